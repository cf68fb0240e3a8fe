use crate::models::ProviderKind;
use std::time::Duration;

pub const DEFAULT_GATEWAY_AUTH_HEADER: &str = "cf-aig-authorization";
pub const DEFAULT_METADATA_HEADER: &str = "cf-aig-metadata";
pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_STREAM_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Where one upstream provider lives and how to authenticate against it.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub base_url: String,
    /// Sent as `Authorization: Bearer ...` when present.
    pub api_key: Option<String>,
}

/// Everything the provider adapters need, built once at process start.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub local: ProviderEndpoint,
    pub hosted: ProviderEndpoint,
    pub web: ProviderEndpoint,
    pub gateway_token: Option<String>,
    pub gateway_auth_header: String,
    pub metadata_header: String,
    pub upstream_timeout_ms: u64,
    pub stream_idle_timeout_ms: u64,
}

impl GatewayConfig {
    /// All three providers behind one gateway base URL, with the gateway's path layout.
    pub fn with_gateway_url(gateway_url: &str) -> Self {
        let base = gateway_url.trim_end_matches('/');
        Self {
            local: ProviderEndpoint {
                base_url: format!("{base}/workers-ai"),
                api_key: None,
            },
            hosted: ProviderEndpoint {
                base_url: format!("{base}/openai"),
                api_key: None,
            },
            web: ProviderEndpoint {
                base_url: format!("{base}/perplexity-ai"),
                api_key: None,
            },
            gateway_token: None,
            gateway_auth_header: DEFAULT_GATEWAY_AUTH_HEADER.to_string(),
            metadata_header: DEFAULT_METADATA_HEADER.to_string(),
            upstream_timeout_ms: DEFAULT_UPSTREAM_TIMEOUT_MS,
            stream_idle_timeout_ms: DEFAULT_STREAM_IDLE_TIMEOUT_MS,
        }
    }

    pub fn from_env() -> Self {
        let gateway_url = env_non_empty("CHATROUTER_GATEWAY_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8787".to_string());
        let mut config = Self::with_gateway_url(&gateway_url);
        if let Some(v) = env_non_empty("CHATROUTER_LOCAL_BASE_URL") {
            config.local.base_url = v;
        }
        if let Some(v) = env_non_empty("CHATROUTER_HOSTED_BASE_URL") {
            config.hosted.base_url = v;
        }
        if let Some(v) = env_non_empty("CHATROUTER_WEB_BASE_URL") {
            config.web.base_url = v;
        }
        config.local.api_key = env_non_empty("CHATROUTER_LOCAL_API_KEY");
        config.hosted.api_key = env_non_empty("CHATROUTER_HOSTED_API_KEY");
        config.web.api_key = env_non_empty("CHATROUTER_WEB_API_KEY");
        config.gateway_token = env_non_empty("CHATROUTER_GATEWAY_TOKEN");
        if let Some(v) = env_non_empty("CHATROUTER_GATEWAY_AUTH_HEADER") {
            config.gateway_auth_header = v;
        }
        if let Some(v) = env_non_empty("CHATROUTER_METADATA_HEADER") {
            config.metadata_header = v;
        }
        config.upstream_timeout_ms = env_u64("CHATROUTER_UPSTREAM_TIMEOUT_MS")
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_MS)
            .max(1);
        config.stream_idle_timeout_ms = env_u64("CHATROUTER_STREAM_IDLE_TIMEOUT_MS")
            .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT_MS)
            .max(1);
        config
    }

    pub fn endpoint(&self, kind: ProviderKind) -> &ProviderEndpoint {
        match kind {
            ProviderKind::LocalInference => &self.local,
            ProviderKind::HostedChat => &self.hosted,
            ProviderKind::WebAugmented => &self.web,
        }
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }
}

pub(crate) fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    env_non_empty(key).and_then(|v| v.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_url_expands_to_provider_paths() {
        let config = GatewayConfig::with_gateway_url("https://gw.example/v1/acct/chat/");
        assert_eq!(
            config.endpoint(ProviderKind::LocalInference).base_url,
            "https://gw.example/v1/acct/chat/workers-ai"
        );
        assert_eq!(
            config.endpoint(ProviderKind::HostedChat).base_url,
            "https://gw.example/v1/acct/chat/openai"
        );
        assert_eq!(
            config.endpoint(ProviderKind::WebAugmented).base_url,
            "https://gw.example/v1/acct/chat/perplexity-ai"
        );
        assert_eq!(config.upstream_timeout(), Duration::from_secs(30));
    }
}
