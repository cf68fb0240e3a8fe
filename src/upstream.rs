use crate::config::ProviderEndpoint;
use axum::http::StatusCode;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Timeout,
    RateLimited,
    Http,
    Decode,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    fn from_transport(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            UpstreamErrorKind::Timeout
        } else {
            UpstreamErrorKind::Network
        };
        Self::new(kind, err.status(), err.to_string())
    }
}

/// Single-shot call: the timeout covers connecting, sending, and reading the whole body.
pub async fn call_upstream_with_timeout_and_headers(
    client: &reqwest::Client,
    endpoint: &ProviderEndpoint,
    path: &str,
    body: &Value,
    timeout: Duration,
    extra_headers: &[(&str, &str)],
) -> Result<Value, UpstreamCallError> {
    let req = build_request(client, endpoint, path, body, extra_headers).timeout(timeout);
    let resp = send_checked(req).await?;
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(UpstreamCallError::from_transport)?;
    let value: Value = serde_json::from_str(&text).map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Decode, Some(status), err.to_string())
    })?;
    Ok(value)
}

/// Streaming call: the timeout only bounds the wait for response headers, the body is left
/// unread for the caller to consume chunk by chunk.
pub async fn call_upstream_raw_with_headers(
    client: &reqwest::Client,
    endpoint: &ProviderEndpoint,
    path: &str,
    body: &Value,
    header_timeout: Duration,
    extra_headers: &[(&str, &str)],
) -> Result<reqwest::Response, UpstreamCallError> {
    let req = build_request(client, endpoint, path, body, extra_headers);
    match tokio::time::timeout(header_timeout, send_checked(req)).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamCallError::new(
            UpstreamErrorKind::Timeout,
            None,
            format!(
                "no upstream response within {}ms",
                header_timeout.as_millis()
            ),
        )),
    }
}

fn build_request(
    client: &reqwest::Client,
    endpoint: &ProviderEndpoint,
    path: &str,
    body: &Value,
    extra_headers: &[(&str, &str)],
) -> reqwest::RequestBuilder {
    let url = join_url(&endpoint.base_url, path);
    let mut req = client.post(url).json(body);
    if let Some(api_key) = endpoint.api_key.as_deref() {
        req = req.bearer_auth(api_key);
    }
    for (k, v) in extra_headers {
        req = req.header(*k, *v);
    }
    req
}

async fn send_checked(req: reqwest::RequestBuilder) -> Result<reqwest::Response, UpstreamCallError> {
    let resp = req.send().await.map_err(UpstreamCallError::from_transport)?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let code = extract_error_code(&text);
        let kind = if status == StatusCode::TOO_MANY_REQUESTS {
            UpstreamErrorKind::RateLimited
        } else {
            UpstreamErrorKind::Http
        };
        tracing::warn!(status = %status, body = %text, "upstream returned non-success status");
        return Err(UpstreamCallError::new(
            kind,
            Some(status),
            format!("upstream status {}: {}", status, text),
        )
        .with_code(code));
    }
    Ok(resp)
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let code = value.get("error").and_then(|v| v.get("code"))?;
    match code {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
