use serde::{Deserialize, Serialize};

use crate::proxy::token_store::TokenStorageKind;

/// 反代服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// 是否允许局域网访问
    /// - false: 仅本机访问 127.0.0.1（默认，隐私优先）
    /// - true: 允许局域网访问 0.0.0.0
    #[serde(default)]
    pub allow_lan_access: bool,

    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,

    /// API key file consumed by the key registry (line format:
    /// `API_KEY_<n>=<value>=<expiry>[=<rate-directive>[:<n>]]`)
    #[serde(default = "default_key_file")]
    pub key_file: String,

    /// Whether `/v1/*` endpoints require a gateway-issued API key
    #[serde(default = "default_true")]
    pub key_protection: bool,

    /// IP 请求限速配置
    #[serde(default = "default_true")]
    pub enable_rate_limit: bool,
    #[serde(default = "default_max_request_rate")]
    pub max_request_rate: u32,
    #[serde(default = "default_time_window")]
    pub time_window_secs: u64,

    /// API 密钥限速配置 (per-key directives may override the default)
    #[serde(default = "default_true")]
    pub key_rate_limit_enabled: bool,
    #[serde(default = "default_key_rate")]
    pub default_key_rate: u32,

    /// Security guard (suspicious request scoring / IP bans)
    #[serde(default = "default_true")]
    pub enable_security_guard: bool,
    #[serde(default = "default_block_threshold")]
    pub block_threshold: u32,
    #[serde(default = "default_block_duration")]
    pub block_duration_secs: u64,
    /// Whitelisted IPs (exact match or prefix like "192.168.")
    #[serde(default = "default_whitelist")]
    pub ip_whitelist: Vec<String>,

    /// Token 池与生命周期配置
    #[serde(default)]
    pub token_storage_type: TokenStorageKind,
    #[serde(default = "default_db_path")]
    pub token_db_path: String,
    #[serde(default = "default_storage_dir")]
    pub token_storage_dir: String,
    #[serde(default = "default_pool_size")]
    pub token_pool_size: usize,
    #[serde(default = "default_token_retries")]
    pub max_token_retries: usize,
    #[serde(default = "default_initial_delay")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_retry_delay_ms: u64,
    /// Remaining lifetime below which a credential counts as expiring
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: i64,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Persist acquired credentials to the token store
    #[serde(default = "default_true")]
    pub token_cache_enabled: bool,

    /// Upstream relay timeouts / retries
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_empty_response_timeout")]
    pub empty_response_timeout_secs: u64,
    /// API 请求超时时间(秒)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// 上游代理配置
    #[serde(default)]
    pub upstream_proxy: UpstreamProxyConfig,
}

/// 上游代理配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpstreamProxyConfig {
    /// 是否启用
    pub enabled: bool,
    /// 代理地址 (http://, https://, socks5://)
    pub url: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            allow_lan_access: false, // 默认仅本机访问，隐私优先
            port: default_port(),
            key_file: default_key_file(),
            key_protection: true,
            enable_rate_limit: true,
            max_request_rate: default_max_request_rate(),
            time_window_secs: default_time_window(),
            key_rate_limit_enabled: true,
            default_key_rate: default_key_rate(),
            enable_security_guard: true,
            block_threshold: default_block_threshold(),
            block_duration_secs: default_block_duration(),
            ip_whitelist: default_whitelist(),
            token_storage_type: TokenStorageKind::default(),
            token_db_path: default_db_path(),
            token_storage_dir: default_storage_dir(),
            token_pool_size: default_pool_size(),
            max_token_retries: default_token_retries(),
            initial_retry_delay_ms: default_initial_delay(),
            max_retry_delay_ms: default_max_delay(),
            refresh_margin_secs: default_refresh_margin(),
            refresh_interval_secs: default_refresh_interval(),
            token_cache_enabled: true,
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            max_retries: default_max_retries(),
            empty_response_timeout_secs: default_empty_response_timeout(),
            request_timeout_secs: default_request_timeout(),
            upstream_proxy: UpstreamProxyConfig::default(),
        }
    }
}

fn default_port() -> u16 {
    8045
}

fn default_key_file() -> String {
    ".KEY".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_request_rate() -> u32 {
    30
}

fn default_time_window() -> u64 {
    60
}

fn default_key_rate() -> u32 {
    20
}

fn default_block_threshold() -> u32 {
    5
}

fn default_block_duration() -> u64 {
    1800
}

fn default_whitelist() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "::1".to_string()]
}

fn default_db_path() -> String {
    "tokens.db".to_string()
}

fn default_storage_dir() -> String {
    ".unlimited".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_token_retries() -> usize {
    3
}

fn default_initial_delay() -> u64 {
    100
}

fn default_max_delay() -> u64 {
    5000
}

fn default_refresh_margin() -> i64 {
    300
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    180
}

fn default_write_timeout() -> u64 {
    30
}

fn default_max_retries() -> usize {
    3
}

fn default_empty_response_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    120 // 默认 120 秒
}

impl ProxyConfig {
    /// 获取实际的监听地址
    pub fn get_bind_address(&self) -> &str {
        if self.allow_lan_access {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let cfg: ProxyConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.port, 8045);
        assert_eq!(cfg.max_request_rate, 30);
        assert_eq!(cfg.time_window_secs, 60);
        assert_eq!(cfg.block_threshold, 5);
        assert_eq!(cfg.token_pool_size, 4);
        assert_eq!(cfg.refresh_margin_secs, 300);
        assert!(cfg.key_protection);
        assert_eq!(cfg.get_bind_address(), "127.0.0.1");
    }

    #[test]
    fn test_lan_access_bind_address() {
        let cfg = ProxyConfig {
            allow_lan_access: true,
            ..ProxyConfig::default()
        };
        assert_eq!(cfg.get_bind_address(), "0.0.0.0");
    }
}
