//! Upstream provider adapters.
//!
//! One variant per [`ProviderKind`]; the dispatcher resolves a model, picks the adapter for
//! its kind and calls through the enum, so provider-specific request and response shapes stay
//! in this module.

use crate::config::{GatewayConfig, ProviderEndpoint};
use crate::models::{ModelMapping, ProviderKind};
use crate::request::{ChatRequest, RequestMetadata};
use crate::upstream::{self, UpstreamCallError, UpstreamErrorKind};
use serde_json::{Value, json};
use std::time::Duration;

pub const MAX_OUTPUT_TOKENS: u64 = 1000;
const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

/// Shared per-call settings that come from process configuration.
#[derive(Debug, Clone)]
pub struct CallSettings {
    pub gateway_token: Option<String>,
    pub gateway_auth_header: String,
    pub metadata_header: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LocalInference {
    endpoint: ProviderEndpoint,
}

#[derive(Debug, Clone)]
pub struct HostedChat {
    endpoint: ProviderEndpoint,
}

#[derive(Debug, Clone)]
pub struct WebAugmented {
    endpoint: ProviderEndpoint,
}

#[derive(Debug, Clone)]
pub enum ProviderAdapter {
    LocalInference(LocalInference),
    HostedChat(HostedChat),
    WebAugmented(WebAugmented),
}

/// The three adapters, built once from configuration.
#[derive(Debug, Clone)]
pub struct ProviderSet {
    local: ProviderAdapter,
    hosted: ProviderAdapter,
    web: ProviderAdapter,
    settings: CallSettings,
}

impl ProviderSet {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            local: ProviderAdapter::LocalInference(LocalInference {
                endpoint: config.endpoint(ProviderKind::LocalInference).clone(),
            }),
            hosted: ProviderAdapter::HostedChat(HostedChat {
                endpoint: config.endpoint(ProviderKind::HostedChat).clone(),
            }),
            web: ProviderAdapter::WebAugmented(WebAugmented {
                endpoint: config.endpoint(ProviderKind::WebAugmented).clone(),
            }),
            settings: CallSettings {
                gateway_token: config.gateway_token.clone(),
                gateway_auth_header: config.gateway_auth_header.clone(),
                metadata_header: config.metadata_header.clone(),
                timeout: config.upstream_timeout(),
            },
        }
    }

    pub fn adapter(&self, kind: ProviderKind) -> &ProviderAdapter {
        match kind {
            ProviderKind::LocalInference => &self.local,
            ProviderKind::HostedChat => &self.hosted,
            ProviderKind::WebAugmented => &self.web,
        }
    }

    pub fn settings(&self) -> &CallSettings {
        &self.settings
    }
}

impl ProviderAdapter {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::LocalInference(_) => ProviderKind::LocalInference,
            Self::HostedChat(_) => ProviderKind::HostedChat,
            Self::WebAugmented(_) => ProviderKind::WebAugmented,
        }
    }

    pub fn supports_streaming(&self) -> bool {
        self.kind().supports_streaming()
    }

    fn endpoint(&self) -> &ProviderEndpoint {
        match self {
            Self::LocalInference(p) => &p.endpoint,
            Self::HostedChat(p) => &p.endpoint,
            Self::WebAugmented(p) => &p.endpoint,
        }
    }

    pub fn request_path(&self, mapping: &ModelMapping) -> String {
        match self {
            Self::LocalInference(_) => format!("/{}", mapping.upstream_model_path),
            Self::HostedChat(_) | Self::WebAugmented(_) => CHAT_COMPLETIONS_PATH.to_string(),
        }
    }

    pub fn build_body(&self, mapping: &ModelMapping, req: &ChatRequest, stream: bool) -> Value {
        match self {
            Self::LocalInference(_) => local_inference_body(&mapping.upstream_model_path, &req.text),
            Self::HostedChat(_) => hosted_chat_body(&mapping.upstream_model_path, req, stream),
            Self::WebAugmented(_) => json!({
                "model": mapping.upstream_model_path,
                "messages": [{ "role": "user", "content": req.text }]
            }),
        }
    }

    /// Pulls the answer text out of a single-shot response.
    pub fn extract_answer(&self, value: &Value) -> Result<String, UpstreamCallError> {
        match self {
            Self::LocalInference(_) => Ok(extract_local_inference_answer(value)),
            Self::HostedChat(_) | Self::WebAugmented(_) => extract_chat_completion_answer(value)
                .ok_or_else(|| {
                    UpstreamCallError::new(
                        UpstreamErrorKind::Decode,
                        None,
                        format!("{} response has no choices[0].message.content", self.kind()),
                    )
                }),
        }
    }

    /// Incremental text carried by one decoded stream event, if any.
    pub fn extract_stream_delta(&self, value: &Value) -> Option<String> {
        match self {
            Self::HostedChat(_) => value
                .get("choices")
                .and_then(|v| v.as_array())
                .and_then(|arr| arr.first())
                .and_then(|c| c.get("delta"))
                .and_then(|d| d.get("content"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            Self::LocalInference(_) | Self::WebAugmented(_) => None,
        }
    }

    pub async fn invoke(
        &self,
        client: &reqwest::Client,
        settings: &CallSettings,
        mapping: &ModelMapping,
        req: &ChatRequest,
        metadata: &RequestMetadata,
    ) -> Result<String, UpstreamCallError> {
        let body = self.build_body(mapping, req, false);
        let path = self.request_path(mapping);
        let headers = outbound_headers(settings, metadata);
        let header_refs: Vec<(&str, &str)> =
            headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        tracing::debug!(
            provider = %self.kind(),
            upstream_model = %mapping.upstream_model_path,
            metadata_entries = metadata.len(),
            "invoking upstream provider"
        );
        let value = upstream::call_upstream_with_timeout_and_headers(
            client,
            self.endpoint(),
            &path,
            &body,
            settings.timeout,
            &header_refs,
        )
        .await?;
        self.extract_answer(&value)
    }

    /// Starts a streaming call and hands back the unread upstream response.
    pub async fn invoke_stream(
        &self,
        client: &reqwest::Client,
        settings: &CallSettings,
        mapping: &ModelMapping,
        req: &ChatRequest,
        metadata: &RequestMetadata,
    ) -> Result<reqwest::Response, UpstreamCallError> {
        if !self.supports_streaming() {
            return Err(UpstreamCallError::new(
                UpstreamErrorKind::Http,
                None,
                format!("{} does not support streaming", self.kind()),
            ));
        }
        let body = self.build_body(mapping, req, true);
        let path = self.request_path(mapping);
        let headers = outbound_headers(settings, metadata);
        let header_refs: Vec<(&str, &str)> =
            headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        tracing::debug!(
            provider = %self.kind(),
            upstream_model = %mapping.upstream_model_path,
            "opening upstream stream"
        );
        upstream::call_upstream_raw_with_headers(
            client,
            self.endpoint(),
            &path,
            &body,
            settings.timeout,
            &header_refs,
        )
        .await
    }
}

fn outbound_headers(settings: &CallSettings, metadata: &RequestMetadata) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    if let Some(token) = settings.gateway_token.as_deref() {
        headers.push((settings.gateway_auth_header.clone(), format!("Bearer {token}")));
    }
    if let Some(value) = metadata.to_header_value() {
        headers.push((settings.metadata_header.clone(), value));
    }
    headers
}

/// Raw-text generation families take `input`; chat-tuned families take `messages`.
fn uses_input_style(upstream_model_path: &str) -> bool {
    upstream_model_path.contains("gpt-oss")
}

fn local_inference_body(upstream_model_path: &str, text: &str) -> Value {
    if uses_input_style(upstream_model_path) {
        json!({ "input": text })
    } else {
        json!({ "messages": [{ "role": "user", "content": text }] })
    }
}

fn extract_local_inference_answer(value: &Value) -> String {
    // Gateway responses wrap the payload in `result`; direct bindings do not.
    let inner = value.get("result").filter(|v| v.is_object()).unwrap_or(value);
    if let Some(text) = inner.get("response").and_then(|v| v.as_str()) {
        return text.to_string();
    }
    if let Some(text) = extract_output_message_text(inner) {
        return text;
    }
    if let Some(text) = extract_chat_completion_answer(inner) {
        return text;
    }
    if let Some(text) = value.get("result").and_then(|v| v.as_str()) {
        return text.to_string();
    }
    tracing::warn!("local inference response matched no known shape, returning empty answer");
    String::new()
}

fn extract_output_message_text(value: &Value) -> Option<String> {
    value
        .get("output")
        .and_then(|v| v.as_array())?
        .iter()
        .find(|item| item.get("type").and_then(|v| v.as_str()) == Some("message"))
        .and_then(|item| item.get("content"))
        .and_then(|v| v.as_array())
        .and_then(|parts| parts.first())
        .and_then(|part| part.get("text"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn extract_chat_completion_answer(value: &Value) -> Option<String> {
    value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Newer hosted families reject `max_tokens` and require `max_completion_tokens`.
pub fn token_limit_param(upstream_model: &str) -> &'static str {
    const NEWER_FAMILIES: &[&str] = &["gpt-5", "gpt-4.1", "o1", "o3", "o4"];
    if NEWER_FAMILIES
        .iter()
        .any(|prefix| upstream_model.starts_with(prefix))
    {
        "max_completion_tokens"
    } else {
        "max_tokens"
    }
}

fn hosted_chat_body(upstream_model: &str, req: &ChatRequest, stream: bool) -> Value {
    let content = if req.has_images() {
        let mut parts = Vec::with_capacity(req.images.len() + 1);
        if !req.text.is_empty() {
            parts.push(json!({ "type": "text", "text": req.text }));
        }
        for image in &req.images {
            parts.push(json!({
                "type": "image_url",
                "image_url": { "url": image.data_uri() }
            }));
        }
        Value::Array(parts)
    } else {
        Value::String(req.text.clone())
    };
    let mut body = json!({
        "model": upstream_model,
        "messages": [{ "role": "user", "content": content }],
        "stream": stream
    });
    if let Some(obj) = body.as_object_mut() {
        obj.insert(
            token_limit_param(upstream_model).to_string(),
            json!(MAX_OUTPUT_TOKENS),
        );
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::resolve;
    use crate::request::ImageInput;

    fn set() -> ProviderSet {
        ProviderSet::new(&GatewayConfig::with_gateway_url("http://gw.test"))
    }

    fn text_request(model_id: &str, text: &str) -> ChatRequest {
        ChatRequest {
            text: text.to_string(),
            images: Vec::new(),
            model_id: model_id.to_string(),
            user: None,
            stream: None,
        }
    }

    #[test]
    fn local_chat_model_gets_messages_body() {
        let mapping = resolve("local-inference-default").unwrap();
        let adapter = set().adapter(mapping.provider_kind).clone();
        let body = adapter.build_body(&mapping, &text_request(&mapping.model_id, "hello"), false);
        assert_eq!(body["messages"][0]["content"], "hello");
        assert!(body.get("input").is_none());
        assert_eq!(
            adapter.request_path(&mapping),
            "/@cf/meta/llama-3.1-8b-instruct"
        );
    }

    #[test]
    fn local_raw_text_model_gets_input_body() {
        let mapping = resolve("local-inference-gpt-oss-120b").unwrap();
        let adapter = set().adapter(mapping.provider_kind).clone();
        let body = adapter.build_body(&mapping, &text_request(&mapping.model_id, "hello"), false);
        assert_eq!(body, json!({ "input": "hello" }));
    }

    #[test]
    fn local_answer_from_response_field() {
        let adapter = set().adapter(ProviderKind::LocalInference).clone();
        let answer = adapter
            .extract_answer(&json!({"result": {"response": "hi there"}, "success": true}))
            .unwrap();
        assert_eq!(answer, "hi there");
    }

    #[test]
    fn local_answer_from_output_message_entry() {
        let adapter = set().adapter(ProviderKind::LocalInference).clone();
        let value = json!({
            "output": [
                {"type": "reasoning", "content": [{"text": "thinking"}]},
                {"type": "message", "content": [{"type": "output_text", "text": "final"}]}
            ]
        });
        assert_eq!(adapter.extract_answer(&value).unwrap(), "final");
    }

    #[test]
    fn local_answer_falls_back_to_empty() {
        let adapter = set().adapter(ProviderKind::LocalInference).clone();
        assert_eq!(adapter.extract_answer(&json!({"weird": 1})).unwrap(), "");
    }

    #[test]
    fn hosted_token_param_depends_on_model_family() {
        assert_eq!(token_limit_param("gpt-5-mini"), "max_completion_tokens");
        assert_eq!(token_limit_param("o3-mini"), "max_completion_tokens");
        assert_eq!(token_limit_param("gpt-4o-mini"), "max_tokens");
        assert_eq!(token_limit_param("gpt-3.5-turbo"), "max_tokens");
    }

    #[test]
    fn hosted_body_builds_multipart_content_with_data_uris() {
        let mapping = resolve("hosted-chat-latest").unwrap();
        let adapter = set().adapter(mapping.provider_kind).clone();
        let mut req = text_request(&mapping.model_id, "what is this");
        req.images.push(ImageInput {
            mime_type: "image/png".to_string(),
            base64: "AAAA".to_string(),
            decoded_len: 3,
        });
        let body = adapter.build_body(&mapping, &req, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_completion_tokens"], 1000);
        assert!(body.get("max_tokens").is_none());
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content[0]["text"], "what is this");
        assert_eq!(
            content[1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
    }

    #[test]
    fn images_only_hosted_body_has_no_empty_text_part() {
        let mapping = resolve("hosted-chat-4o").unwrap();
        let adapter = set().adapter(mapping.provider_kind).clone();
        let mut req = text_request(&mapping.model_id, "");
        req.images.push(ImageInput {
            mime_type: "image/webp".to_string(),
            base64: "AAAA".to_string(),
            decoded_len: 3,
        });
        let body = adapter.build_body(&mapping, &req, false);
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0]["type"], "image_url");
    }

    #[test]
    fn hosted_legacy_body_uses_max_tokens_and_plain_content() {
        let mapping = resolve("gpt").unwrap();
        let adapter = set().adapter(mapping.provider_kind).clone();
        let body = adapter.build_body(&mapping, &text_request(&mapping.model_id, "hi"), false);
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn hosted_stream_delta_is_extracted() {
        let adapter = set().adapter(ProviderKind::HostedChat).clone();
        let delta = adapter.extract_stream_delta(&json!({"choices": [{"delta": {"content": "Hel"}}]}));
        assert_eq!(delta.as_deref(), Some("Hel"));
        assert!(
            adapter
                .extract_stream_delta(&json!({"choices": [{"delta": {"role": "assistant"}}]}))
                .is_none()
        );
    }

    #[test]
    fn chat_completion_without_choices_is_decode_error() {
        let adapter = set().adapter(ProviderKind::WebAugmented).clone();
        let err = adapter.extract_answer(&json!({"id": "x"})).unwrap_err();
        assert_eq!(err.kind, UpstreamErrorKind::Decode);
    }

    #[test]
    fn outbound_headers_include_gateway_token_and_metadata() {
        let settings = CallSettings {
            gateway_token: Some("gw-secret".to_string()),
            gateway_auth_header: "cf-aig-authorization".to_string(),
            metadata_header: "cf-aig-metadata".to_string(),
            timeout: Duration::from_secs(1),
        };
        let req = text_request("gpt", "hi");
        let headers = outbound_headers(&settings, &req.metadata("GPT"));
        assert_eq!(
            headers[0],
            (
                "cf-aig-authorization".to_string(),
                "Bearer gw-secret".to_string()
            )
        );
        assert_eq!(headers[1].0, "cf-aig-metadata");
        assert_eq!(headers[1].1, r#"{"model":"GPT"}"#);
    }
}
