//! Admission middleware
//!
//! Per-request sequence: security inspection, API key authentication,
//! IP + key rate limiting. Only `/v1/` routes take auth and rate limits;
//! the security guard inspects everything.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::modules::api_keys::{mask_api_key, ApiKey, RateDirective};
use crate::proxy::error::ProxyError;
use crate::proxy::security::Verdict;
use crate::proxy::server::AppState;

pub async fn admission_middleware(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let client_ip = resolve_client_ip(request.headers(), addr);
    let path = request.uri().path().to_string();
    let method = request.method().as_str().to_string();

    // 1. 安全检查 (applies to every route)
    if state.config.enable_security_guard {
        if let Verdict::Block(reason) =
            state
                .guard
                .inspect(&client_ip, &method, &path, request.headers())
        {
            warn!(
                "Request blocked [IP:{}] [{} {}]: {}",
                client_ip, method, path, reason
            );
            state.stats.record_blocked();
            return error_response(ProxyError::Banned(reason));
        }
    }

    if !path.starts_with("/v1/") {
        return next.run(request).await;
    }

    // 2. API 密钥认证
    let mut api_key: Option<ApiKey> = None;
    if state.config.key_protection {
        let presented = extract_api_key(&request);
        let Some(value) = presented else {
            warn!(
                "[!] Missing API key [method:{}] [path:{}] [IP:{}]",
                method, path, client_ip
            );
            state.stats.record_auth_failure();
            return error_response(ProxyError::Auth("missing API key".to_string()));
        };

        match state.key_registry.validate(&value) {
            Ok(key) => {
                debug!(
                    "API key accepted [name:{}] [key:{}] [IP:{}]",
                    key.name,
                    mask_api_key(&value),
                    client_ip
                );
                api_key = Some(key);
            }
            Err(e) => {
                state.stats.record_auth_failure();
                return error_response(e);
            }
        }
    }

    // 3. 限速检查 — both applicable limiters must admit the request
    let window = Duration::from_secs(state.config.time_window_secs);

    if state.config.enable_rate_limit {
        if !state
            .ip_limiter
            .allow(&client_ip, state.config.max_request_rate, window)
        {
            let retry_after = state.ip_limiter.retry_after(&client_ip, window);
            warn!(
                "[!] Rate limit exceeded [IP:{}] [path:{}] [wait:{}s]",
                client_ip, path, retry_after
            );
            state.stats.record_rate_limited();
            return rate_limited_response(retry_after);
        }

        let remaining =
            state
                .ip_limiter
                .remaining(&client_ip, state.config.max_request_rate, window);
        if remaining <= 3 {
            warn!(
                "[!] Request quota nearly exhausted [IP:{}] [remaining:{}]",
                client_ip, remaining
            );
        }
    }

    if let Some(key) = &api_key {
        let key_limit = match key.rate {
            RateDirective::Disabled => None,
            RateDirective::Explicit(limit) => Some(limit),
            RateDirective::Limited => Some(state.config.default_key_rate),
            RateDirective::Inherit => state
                .config
                .key_rate_limit_enabled
                .then_some(state.config.default_key_rate),
        };

        if let Some(limit) = key_limit {
            if !state.key_limiter.allow(&key.value, limit, window) {
                let retry_after = state.key_limiter.retry_after(&key.value, window);
                warn!(
                    "[!] Rate limit exceeded [key:{}] [IP:{}] [wait:{}s]",
                    mask_api_key(&key.value),
                    client_ip,
                    retry_after
                );
                state.stats.record_rate_limited();
                return rate_limited_response(retry_after);
            }
        }
    }

    next.run(request).await
}

/// 解析客户端 IP (X-Forwarded-For 优先)
fn resolve_client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

/// 从请求中提取 API 密钥
///
/// Accepted carriers: `Authorization: Bearer <key>`, a raw Authorization
/// value, or the `api-key` query parameter.
fn extract_api_key(request: &Request) -> Option<String> {
    if let Some(value) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        let trimmed = value.trim();
        if let Some(bearer) = trimmed.strip_prefix("Bearer ") {
            if !bearer.is_empty() {
                return Some(bearer.trim().to_string());
            }
        } else if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            if name == "api-key" && !value.is_empty() {
                Some(value.to_string())
            } else {
                None
            }
        })
    })
}

fn error_response(error: ProxyError) -> Response {
    (error.status_code(), Json(error.error_body())).into_response()
}

fn rate_limited_response(retry_after: u64) -> Response {
    let error = ProxyError::RateLimited { retry_after };
    let mut response = (error.status_code(), Json(error.error_body())).into_response();
    response
        .headers_mut()
        .insert("Retry-After", HeaderValue::from(retry_after));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with_auth(auth: Option<&str>, uri: &str) -> Request {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(value) = auth {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_extract_bearer_key() {
        let req = request_with_auth(Some("Bearer sk-abc"), "/v1/chat/completions");
        assert_eq!(extract_api_key(&req).as_deref(), Some("sk-abc"));
    }

    #[test]
    fn test_extract_raw_authorization() {
        let req = request_with_auth(Some("sk-raw"), "/v1/chat/completions");
        assert_eq!(extract_api_key(&req).as_deref(), Some("sk-raw"));
    }

    #[test]
    fn test_extract_query_key() {
        let req = request_with_auth(None, "/v1/models?api-key=sk-query&x=1");
        assert_eq!(extract_api_key(&req).as_deref(), Some("sk-query"));
    }

    #[test]
    fn test_extract_missing_key() {
        let req = request_with_auth(None, "/v1/models");
        assert_eq!(extract_api_key(&req), None);
    }

    #[test]
    fn test_resolve_client_ip_prefers_forwarded_for() {
        let addr: SocketAddr = "10.0.0.9:4242".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 5.6.7.8".parse().unwrap());
        assert_eq!(resolve_client_ip(&headers, addr), "1.2.3.4");

        let empty = HeaderMap::new();
        assert_eq!(resolve_client_ip(&empty, addr), "10.0.0.9");
    }

    #[test]
    fn test_rate_limited_response_carries_retry_after() {
        let response = rate_limited_response(42);
        assert_eq!(response.status(), 429);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "42");
    }
}
