// Upstream client implementation
// HTTP client wrapper for the UnlimitedAI backend

use async_trait::async_trait;
use rand::Rng;
use reqwest::{header, Client, Response};
use serde_json::Value;
use tokio::time::Duration;

use crate::proxy::config::ProxyConfig;
use crate::proxy::error::ProxyError;
use crate::proxy::token_manager::{Credential, TokenFetcher};

const API_BASE_URL: &str = "https://app.unlimitedai.chat";

/// 上游签发的 Token 有效期（秒）
const TOKEN_TTL_SECS: i64 = 3600;

/// Browser fingerprint profile sent with every upstream call. Firefox and
/// Safari omit the sec-ch-ua trio.
struct BrowserProfile {
    user_agent: &'static str,
    accept_language: &'static str,
    sec_ch_ua: Option<&'static str>,
    sec_ch_ua_mobile: Option<&'static str>,
    sec_ch_ua_platform: Option<&'static str>,
}

const BROWSER_PROFILES: &[BrowserProfile] = &[
    // Chrome Windows
    BrowserProfile {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
        accept_language: "zh-CN,zh;q=0.9,en;q=0.8",
        sec_ch_ua: Some("\"Google Chrome\";v=\"135\", \"Not-A.Brand\";v=\"8\", \"Chromium\";v=\"135\""),
        sec_ch_ua_mobile: Some("?0"),
        sec_ch_ua_platform: Some("\"Windows\""),
    },
    // Chrome MacOS
    BrowserProfile {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
        accept_language: "zh-CN,zh;q=0.9,en;q=0.8",
        sec_ch_ua: Some("\"Google Chrome\";v=\"135\", \"Not-A.Brand\";v=\"8\", \"Chromium\";v=\"135\""),
        sec_ch_ua_mobile: Some("?0"),
        sec_ch_ua_platform: Some("\"macOS\""),
    },
    // Chrome Linux
    BrowserProfile {
        user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
        accept_language: "zh-CN,zh;q=0.9,en;q=0.8",
        sec_ch_ua: Some("\"Google Chrome\";v=\"135\", \"Not-A.Brand\";v=\"8\", \"Chromium\";v=\"135\""),
        sec_ch_ua_mobile: Some("?0"),
        sec_ch_ua_platform: Some("\"Linux\""),
    },
    // Firefox Windows
    BrowserProfile {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/119.0",
        accept_language: "zh-CN,zh;q=0.9,en;q=0.8",
        sec_ch_ua: None,
        sec_ch_ua_mobile: None,
        sec_ch_ua_platform: None,
    },
    // Safari MacOS
    BrowserProfile {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
        accept_language: "zh-CN,zh;q=0.9,en;q=0.8",
        sec_ch_ua: None,
        sec_ch_ua_mobile: None,
        sec_ch_ua_platform: None,
    },
    // Edge Windows
    BrowserProfile {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Edge/121.0.0.0 Safari/537.36",
        accept_language: "zh-CN,zh;q=0.9,en;q=0.8",
        sec_ch_ua: Some("\"Microsoft Edge\";v=\"121\", \"Not-A.Brand\";v=\"8\", \"Chromium\";v=\"121\""),
        sec_ch_ua_mobile: Some("?0"),
        sec_ch_ua_platform: Some("\"Windows\""),
    },
];

pub struct UpstreamClient {
    http_client: Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(config: &ProxyConfig) -> Self {
        let mut builder = Client::builder()
            // Connection settings (optimize connection reuse, reduce overhead)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(config.request_timeout_secs.max(
                config.read_timeout_secs + config.write_timeout_secs,
            )))
            .redirect(reqwest::redirect::Policy::limited(5));

        let proxy_config = &config.upstream_proxy;
        if proxy_config.enabled && !proxy_config.url.is_empty() {
            if let Ok(proxy) = reqwest::Proxy::all(&proxy_config.url) {
                builder = builder.proxy(proxy);
                tracing::info!("UpstreamClient enabled proxy: {}", proxy_config.url);
            }
        } else {
            builder = builder.no_proxy();
        }

        let http_client = builder.build().expect("Failed to create HTTP client");

        Self {
            http_client,
            base_url: API_BASE_URL.to_string(),
        }
    }

    fn token_url(&self) -> String {
        format!("{}/api/token", self.base_url)
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn pick_profile() -> &'static BrowserProfile {
        let idx = rand::thread_rng().gen_range(0..BROWSER_PROFILES.len());
        &BROWSER_PROFILES[idx]
    }

    /// Assemble fingerprint headers for one upstream call
    fn fingerprint_headers(&self, token: Option<&str>) -> Result<header::HeaderMap, ProxyError> {
        let profile = Self::pick_profile();
        let chat_id = uuid::Uuid::new_v4();

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("text/event-stream"),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            header::HeaderValue::from_static(profile.accept_language),
        );
        headers.insert("priority", header::HeaderValue::from_static("u=1, i"));
        headers.insert(
            header::ORIGIN,
            header::HeaderValue::from_str(&self.base_url)
                .map_err(|e| ProxyError::Upstream(e.to_string()))?,
        );
        headers.insert(
            header::REFERER,
            header::HeaderValue::from_str(&format!("{}/chat/{}", self.base_url, chat_id))
                .map_err(|e| ProxyError::Upstream(e.to_string()))?,
        );
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_static(profile.user_agent),
        );

        if let Some(value) = profile.sec_ch_ua {
            headers.insert("sec-ch-ua", header::HeaderValue::from_static(value));
        }
        if let Some(value) = profile.sec_ch_ua_mobile {
            headers.insert("sec-ch-ua-mobile", header::HeaderValue::from_static(value));
        }
        if let Some(value) = profile.sec_ch_ua_platform {
            headers.insert("sec-ch-ua-platform", header::HeaderValue::from_static(value));
        }
        headers.insert("sec-fetch-dest", header::HeaderValue::from_static("empty"));
        headers.insert("sec-fetch-mode", header::HeaderValue::from_static("cors"));
        headers.insert(
            "sec-fetch-site",
            header::HeaderValue::from_static("same-origin"),
        );

        if let Some(token) = token {
            headers.insert(
                "x-api-token",
                header::HeaderValue::from_str(token)
                    .map_err(|e| ProxyError::Upstream(e.to_string()))?,
            );
        }

        Ok(headers)
    }

    /// 从上游获取新 Token
    ///
    /// One plain attempt; retry and backoff policy belongs to the token
    /// manager.
    pub async fn fetch_token(&self) -> Result<Credential, ProxyError> {
        let headers = self.fingerprint_headers(None)?;
        let url = self.token_url();
        tracing::debug!("Requesting upstream token: GET {}", url);

        let response = self
            .http_client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::Upstream(format!(
                "token endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProxyError::Upstream(format!("token response parse failed: {}", e)))?;

        let token = body
            .get("token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProxyError::Upstream("token response missing token field".into()))?;

        Ok(Credential::new(token, TOKEN_TTL_SECS))
    }

    /// 发送聊天请求（流式与非流式共用）
    pub async fn send_chat(&self, body: &Value, token: &str) -> Result<Response, ProxyError> {
        let mut headers = self.fingerprint_headers(Some(token))?;
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let url = self.chat_url();
        tracing::debug!("Relaying chat request: POST {}", url);

        self.http_client
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(format!("chat request failed: {}", e)))
    }
}

#[async_trait]
impl TokenFetcher for UpstreamClient {
    async fn acquire(&self) -> Result<Credential, ProxyError> {
        self.fetch_token().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        let client = UpstreamClient::new(&ProxyConfig::default());
        assert_eq!(client.token_url(), "https://app.unlimitedai.chat/api/token");
        assert_eq!(client.chat_url(), "https://app.unlimitedai.chat/api/chat");
    }

    #[test]
    fn test_fingerprint_headers_complete() {
        let client = UpstreamClient::new(&ProxyConfig::default());
        let headers = client.fingerprint_headers(Some("tok-123")).unwrap();

        assert_eq!(headers.get("accept").unwrap(), "text/event-stream");
        assert_eq!(headers.get("x-api-token").unwrap(), "tok-123");
        assert!(headers.get("user-agent").is_some());
        assert!(headers.get("sec-fetch-mode").is_some());
        let referer = headers.get("referer").unwrap().to_str().unwrap();
        assert!(referer.starts_with("https://app.unlimitedai.chat/chat/"));
    }

    #[test]
    fn test_fingerprint_headers_without_token() {
        let client = UpstreamClient::new(&ProxyConfig::default());
        let headers = client.fingerprint_headers(None).unwrap();
        assert!(headers.get("x-api-token").is_none());
    }

    #[test]
    fn test_profiles_consistent() {
        // sec-ch-ua headers come as a full trio or not at all
        for profile in BROWSER_PROFILES {
            assert_eq!(profile.sec_ch_ua.is_some(), profile.sec_ch_ua_mobile.is_some());
            assert_eq!(profile.sec_ch_ua.is_some(), profile.sec_ch_ua_platform.is_some());
        }
    }
}
