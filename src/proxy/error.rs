use axum::http::StatusCode;
use serde_json::{json, Value};

/// Gateway error taxonomy.
///
/// Auth and admission errors are decided locally and never retried.
/// Acquisition and upstream errors are retried internally before they
/// surface; once surfaced they are terminal for the request. Storage
/// errors are always recovered locally (the pool degrades to memory-only).
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("access denied: {0}")]
    Banned(String),

    #[error("token acquisition failed after {attempts} attempts: {message}")]
    AcquisitionFailed { attempts: usize, message: String },

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("upstream produced no data within {0}s")]
    EmptyResponseTimeout(u64),

    #[error("token storage error: {0}")]
    Storage(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Auth(_) => StatusCode::UNAUTHORIZED,
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::Banned(_) => StatusCode::FORBIDDEN,
            ProxyError::AcquisitionFailed { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::EmptyResponseTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            // Storage errors never reach a client; mapped defensively anyway.
            ProxyError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Auth(_) => "authentication_error",
            ProxyError::RateLimited { .. } => "rate_limit_error",
            ProxyError::Banned(_) => "permission_error",
            ProxyError::AcquisitionFailed { .. } | ProxyError::Upstream(_) => "upstream_error",
            ProxyError::EmptyResponseTimeout(_) => "timeout_error",
            ProxyError::Storage(_) => "server_error",
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ProxyError::Auth(_) => "invalid_api_key",
            ProxyError::RateLimited { .. } => "too_many_requests",
            ProxyError::Banned(_) => "ip_banned",
            ProxyError::AcquisitionFailed { .. } => "token_acquisition_failed",
            ProxyError::Upstream(_) => "upstream_error",
            ProxyError::EmptyResponseTimeout(_) => "empty_response_timeout",
            ProxyError::Storage(_) => "storage_error",
        }
    }

    /// OpenAI-style structured error object. Failed requests always carry a
    /// body; never a bare status.
    pub fn error_body(&self) -> Value {
        json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "param": null,
                "code": self.error_code(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::Auth("bad key".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProxyError::RateLimited { retry_after: 5 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ProxyError::Banned("scanner".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ProxyError::EmptyResponseTimeout(5).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::Upstream("connect refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_body_shape() {
        let body = ProxyError::RateLimited { retry_after: 12 }.error_body();
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(body["error"]["code"], "too_many_requests");
        assert!(body["error"]["message"].as_str().unwrap().contains("12s"));
    }
}
