use crate::error::ChatError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    LocalInference,
    HostedChat,
    WebAugmented,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalInference => "local_inference",
            Self::HostedChat => "hosted_chat",
            Self::WebAugmented => "web_augmented",
        }
    }

    pub fn supports_streaming(&self) -> bool {
        matches!(self, Self::HostedChat)
    }

    pub fn accepts_images(&self) -> bool {
        matches!(self, Self::HostedChat)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelMapping {
    /// Canonical identifier, after alias resolution.
    pub model_id: String,
    pub provider_kind: ProviderKind,
    pub upstream_model_path: String,
    /// Only used for outbound observability metadata.
    pub display_name: String,
    /// The deprecated identifier the caller supplied, when one was used.
    pub legacy_alias_of: Option<String>,
    /// Whether this model family is relayed incrementally by default.
    pub streams: bool,
}

struct StaticModel {
    model_id: &'static str,
    provider_kind: ProviderKind,
    upstream_model_path: &'static str,
    display_name: &'static str,
    streams: bool,
}

const LOCAL_FAMILY_PREFIX: &str = "local-inference-";
const LOCAL_FAMILY_LEGACY_PREFIX: &str = "workers-ai-";
pub const DEFAULT_LOCAL_MODEL_PATH: &str = "@cf/meta/llama-3.1-8b-instruct";

const LOCAL_MODELS: &[(&str, &str)] = &[
    ("default", DEFAULT_LOCAL_MODEL_PATH),
    ("llama", DEFAULT_LOCAL_MODEL_PATH),
    ("gpt-oss-120b", "@cf/openai/gpt-oss-120b"),
    ("gpt-oss-20b", "@cf/openai/gpt-oss-20b"),
    ("deepseek-r1", "@cf/deepseek/deepseek-r1-distill-qwen-32b"),
];

const STATIC_MODELS: &[StaticModel] = &[
    StaticModel {
        model_id: "hosted-chat-latest",
        provider_kind: ProviderKind::HostedChat,
        upstream_model_path: "gpt-5-mini",
        display_name: "GPT-5 mini",
        streams: true,
    },
    StaticModel {
        model_id: "hosted-chat-4o",
        provider_kind: ProviderKind::HostedChat,
        upstream_model_path: "gpt-4o-mini",
        display_name: "GPT-4o mini",
        streams: true,
    },
    StaticModel {
        model_id: "hosted-chat-legacy",
        provider_kind: ProviderKind::HostedChat,
        upstream_model_path: "gpt-3.5-turbo",
        display_name: "GPT-3.5 Turbo",
        streams: false,
    },
    StaticModel {
        model_id: "web-augmented-sonar",
        provider_kind: ProviderKind::WebAugmented,
        upstream_model_path: "sonar",
        display_name: "Perplexity Sonar",
        streams: false,
    },
    StaticModel {
        model_id: "web-augmented-sonar-pro",
        provider_kind: ProviderKind::WebAugmented,
        upstream_model_path: "sonar-pro",
        display_name: "Perplexity Sonar Pro",
        streams: false,
    },
];

/// Deprecated identifiers and the canonical identifier each one stands for.
const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("worker-ai", "local-inference-llama"),
    ("gpt", "hosted-chat-legacy"),
    ("openai-gpt-3.5", "hosted-chat-legacy"),
    ("perplexity", "web-augmented-sonar"),
    ("perplexity-sonar", "web-augmented-sonar"),
];

/// Maps an external model identifier to the provider and upstream model serving it.
pub fn resolve(model_id: &str) -> Result<ModelMapping, ChatError> {
    if let Some((_, canonical)) = LEGACY_ALIASES.iter().find(|(alias, _)| *alias == model_id) {
        let mut mapping = resolve_canonical(canonical)
            .ok_or_else(|| ChatError::UnknownModel(model_id.to_string()))?;
        mapping.legacy_alias_of = Some(model_id.to_string());
        return Ok(mapping);
    }
    resolve_canonical(model_id).ok_or_else(|| ChatError::UnknownModel(model_id.to_string()))
}

fn resolve_canonical(model_id: &str) -> Option<ModelMapping> {
    if let Some(suffix) = local_family_suffix(model_id) {
        return Some(resolve_local(suffix));
    }
    STATIC_MODELS
        .iter()
        .find(|entry| entry.model_id == model_id)
        .map(|entry| ModelMapping {
            model_id: entry.model_id.to_string(),
            provider_kind: entry.provider_kind,
            upstream_model_path: entry.upstream_model_path.to_string(),
            display_name: entry.display_name.to_string(),
            legacy_alias_of: None,
            streams: entry.streams,
        })
}

fn local_family_suffix(model_id: &str) -> Option<&str> {
    model_id
        .strip_prefix(LOCAL_FAMILY_PREFIX)
        .or_else(|| model_id.strip_prefix(LOCAL_FAMILY_LEGACY_PREFIX))
}

fn resolve_local(suffix: &str) -> ModelMapping {
    let path = LOCAL_MODELS
        .iter()
        .find(|(name, _)| *name == suffix)
        .map(|(_, path)| *path);
    if path.is_none() {
        tracing::debug!(suffix, "unrecognized local inference model, using default");
    }
    let path = path.unwrap_or(DEFAULT_LOCAL_MODEL_PATH);
    // Both prefixes collapse onto one canonical id so cache keys are shared.
    ModelMapping {
        model_id: format!("{LOCAL_FAMILY_PREFIX}{suffix}"),
        provider_kind: ProviderKind::LocalInference,
        upstream_model_path: path.to_string(),
        display_name: path.rsplit('/').next().unwrap_or(path).to_string(),
        legacy_alias_of: None,
        streams: false,
    }
}

/// Every canonical identifier accepted without aliasing, for listing.
pub fn known_model_ids() -> Vec<String> {
    LOCAL_MODELS
        .iter()
        .map(|(suffix, _)| format!("{LOCAL_FAMILY_PREFIX}{suffix}"))
        .chain(STATIC_MODELS.iter().map(|entry| entry.model_id.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_identifier_resolves_to_static_entry() {
        let mapping = resolve("hosted-chat-latest").unwrap();
        assert_eq!(mapping.provider_kind, ProviderKind::HostedChat);
        assert_eq!(mapping.upstream_model_path, "gpt-5-mini");
        assert!(mapping.streams);
        assert!(mapping.legacy_alias_of.is_none());
    }

    #[test]
    fn legacy_alias_resolves_to_canonical_mapping() {
        let mapping = resolve("perplexity").unwrap();
        assert_eq!(mapping.model_id, "web-augmented-sonar");
        assert_eq!(mapping.provider_kind, ProviderKind::WebAugmented);
        assert_eq!(mapping.legacy_alias_of.as_deref(), Some("perplexity"));
    }

    #[test]
    fn resolving_alias_twice_is_identical() {
        let first = resolve("worker-ai").unwrap();
        let second = resolve("worker-ai").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.upstream_model_path, DEFAULT_LOCAL_MODEL_PATH);
    }

    #[test]
    fn local_family_suffix_selects_upstream_path() {
        let mapping = resolve("local-inference-gpt-oss-20b").unwrap();
        assert_eq!(mapping.provider_kind, ProviderKind::LocalInference);
        assert_eq!(mapping.upstream_model_path, "@cf/openai/gpt-oss-20b");
    }

    #[test]
    fn unknown_local_suffix_falls_back_to_default() {
        let mapping = resolve("local-inference-does-not-exist").unwrap();
        assert_eq!(mapping.upstream_model_path, DEFAULT_LOCAL_MODEL_PATH);
    }

    #[test]
    fn historical_local_prefix_shares_canonical_id() {
        let old = resolve("workers-ai-deepseek-r1").unwrap();
        let new = resolve("local-inference-deepseek-r1").unwrap();
        assert_eq!(old, new);
    }

    #[test]
    fn unknown_identifier_is_rejected() {
        let err = resolve("mystery-model").unwrap_err();
        assert!(matches!(err, ChatError::UnknownModel(ref id) if id == "mystery-model"));
        assert!(resolve("hosted-chat-latest ").is_err());
    }
}
