use crate::models::ProviderKind;
use crate::upstream::{UpstreamCallError, UpstreamErrorKind};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.message,
                error_type: self.error_type,
                param: self.param,
                code: self.code,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failure taxonomy of the chat pipeline.
///
/// Validation and resolution failures happen before any upstream call. Storage failures are
/// logged by the persister and cache gate and only reach a caller through the read endpoints.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatError {
    #[error("{message}")]
    Validation {
        code: &'static str,
        param: Option<&'static str>,
        message: String,
    },
    #[error("unsupported model: {0}")]
    UnknownModel(String),
    #[error("{provider} rate limited: {message}")]
    UpstreamRateLimited {
        provider: ProviderKind,
        message: String,
    },
    #[error("{provider} timed out: {message}")]
    UpstreamTimeout {
        provider: ProviderKind,
        message: String,
    },
    #[error("{provider} upstream error: {message}")]
    Upstream {
        provider: ProviderKind,
        status: Option<StatusCode>,
        message: String,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("stream error: {0}")]
    Stream(String),
}

impl ChatError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            param: None,
            message: message.into(),
        }
    }

    pub fn invalid_param(
        code: &'static str,
        param: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            code,
            param: Some(param),
            message: message.into(),
        }
    }

    pub fn from_upstream(provider: ProviderKind, err: UpstreamCallError) -> Self {
        match err.kind {
            UpstreamErrorKind::RateLimited => Self::UpstreamRateLimited {
                provider,
                message: err.message,
            },
            UpstreamErrorKind::Timeout => Self::UpstreamTimeout {
                provider,
                message: err.message,
            },
            UpstreamErrorKind::Network | UpstreamErrorKind::Http | UpstreamErrorKind::Decode => {
                Self::Upstream {
                    provider,
                    status: err.status,
                    message: err.message,
                }
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. } => code,
            Self::UnknownModel(_) => "unknown_model",
            Self::UpstreamRateLimited { .. } => "upstream_rate_limited",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::Upstream { .. } => "upstream_error",
            Self::Storage(_) => "storage_error",
            Self::Stream(_) => "stream_error",
        }
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        let code = err.code();
        let message = err.to_string();
        match err {
            ChatError::Validation { param, .. } => {
                let app = AppError::new(StatusCode::BAD_REQUEST, code, message);
                match param {
                    Some(param) => app.with_param(param),
                    None => app,
                }
            }
            ChatError::UnknownModel(_) => {
                AppError::new(StatusCode::BAD_REQUEST, code, message).with_param("model")
            }
            ChatError::UpstreamRateLimited { .. } => {
                AppError::new(StatusCode::TOO_MANY_REQUESTS, code, message)
                    .with_type("rate_limit_error")
            }
            ChatError::UpstreamTimeout { .. } => {
                AppError::new(StatusCode::GATEWAY_TIMEOUT, code, message).with_type("server_error")
            }
            ChatError::Upstream { .. } => {
                AppError::new(StatusCode::BAD_GATEWAY, code, message).with_type("server_error")
            }
            ChatError::Storage(_) | ChatError::Stream(_) => {
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
                    .with_type("server_error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_maps_to_429_and_generic_upstream_to_502() {
        let limited = ChatError::from_upstream(
            ProviderKind::HostedChat,
            UpstreamCallError::new(
                UpstreamErrorKind::RateLimited,
                Some(StatusCode::TOO_MANY_REQUESTS),
                "slow down".to_string(),
            ),
        );
        let generic = ChatError::from_upstream(
            ProviderKind::HostedChat,
            UpstreamCallError::new(
                UpstreamErrorKind::Http,
                Some(StatusCode::INTERNAL_SERVER_ERROR),
                "boom".to_string(),
            ),
        );
        assert_eq!(AppError::from(limited).status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(AppError::from(generic).status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn validation_error_carries_param() {
        let err: AppError = ChatError::invalid_param("too_many_images", "images", "x").into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.param.as_deref(), Some("images"));
        assert_eq!(err.code, "too_many_images");
    }
}
