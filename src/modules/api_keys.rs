//! API key registry
//!
//! Loads gateway-issued API keys from the line-oriented `.KEY` file and
//! validates them on each request. The set is reloaded wholesale, never
//! mutated in place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{Local, NaiveDate};

use crate::proxy::error::ProxyError;

/// Per-key rate directive parsed from the key file.
///
/// - absent           -> Inherit (global setting decides)
/// - `no_limit`       -> Disabled
/// - `rate_limit`     -> Limited (global default rate)
/// - `rate_limit:<N>` -> Explicit(N)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDirective {
    Inherit,
    Disabled,
    Limited,
    Explicit(u32),
}

/// 单个 API 密钥记录
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub name: String,
    pub value: String,
    /// None = permanent
    pub expiry: Option<NaiveDate>,
    pub rate: RateDirective,
}

impl ApiKey {
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        match self.expiry {
            Some(date) => today > date,
            None => false,
        }
    }

    pub fn days_remaining(&self, today: NaiveDate) -> Option<i64> {
        self.expiry.map(|date| (date - today).num_days())
    }
}

/// API 密钥注册表
pub struct KeyRegistry {
    key_file: PathBuf,
    keys: RwLock<HashMap<String, ApiKey>>,
}

#[derive(Debug, Default, PartialEq)]
pub struct LoadSummary {
    pub valid: usize,
    pub permanent: usize,
    pub expired: usize,
    pub invalid: usize,
}

impl KeyRegistry {
    pub fn new(key_file: impl AsRef<Path>) -> Self {
        let registry = Self {
            key_file: key_file.as_ref().to_path_buf(),
            keys: RwLock::new(HashMap::new()),
        };
        registry.reload();
        registry
    }

    /// 从配置文件重新加载全部密钥 (wholesale replace)
    pub fn reload(&self) -> LoadSummary {
        let content = match std::fs::read_to_string(&self.key_file) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("API key file not readable ({:?}): {}", self.key_file, e);
                return LoadSummary::default();
            }
        };

        let mut summary = LoadSummary::default();
        let mut loaded: HashMap<String, ApiKey> = HashMap::new();
        let today = Local::now().date_naive();

        for (line_number, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match parse_key_line(line) {
                Some(key) => {
                    if key.is_expired(today) {
                        summary.expired += 1;
                        tracing::debug!(
                            "Expired API key skipped [line:{}, name:{}]",
                            line_number + 1,
                            key.name
                        );
                        continue;
                    }
                    if key.expiry.is_none() {
                        summary.permanent += 1;
                    } else {
                        summary.valid += 1;
                        if let Some(days) = key.days_remaining(today) {
                            if days <= 7 {
                                tracing::warn!(
                                    "[!] API key expiring soon [name:{}, remaining:{} days]",
                                    key.name,
                                    days
                                );
                            }
                        }
                    }
                    loaded.insert(key.value.clone(), key);
                }
                None => {
                    summary.invalid += 1;
                    tracing::warn!("Malformed API key line skipped [line:{}]", line_number + 1);
                }
            }
        }

        let total = summary.valid + summary.permanent;
        if total > 0 {
            tracing::info!(
                "API keys loaded [valid:{}, permanent:{}, dated:{}, expired:{}, invalid:{}]",
                total,
                summary.permanent,
                summary.valid,
                summary.expired,
                summary.invalid
            );
        } else {
            tracing::warn!("[!] No valid API keys loaded; all API requests will be rejected");
        }

        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        *keys = loaded;
        summary
    }

    /// 验证密钥是否有效
    pub fn validate(&self, value: &str) -> Result<ApiKey, ProxyError> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        let key = match keys.get(value) {
            Some(k) => k.clone(),
            None => {
                tracing::warn!("[!] API key rejected: unknown key [{}]", mask_api_key(value));
                return Err(ProxyError::Auth("invalid API key".to_string()));
            }
        };
        drop(keys);

        let today = Local::now().date_naive();
        if key.is_expired(today) {
            tracing::warn!(
                "[!] API key rejected: expired [name:{}, key:{}]",
                key.name,
                mask_api_key(value)
            );
            return Err(ProxyError::Auth(format!("API key {} has expired", key.name)));
        }

        if let Some(days) = key.days_remaining(today) {
            if days <= 7 {
                tracing::info!("API key expiring soon [name:{}, remaining:{} days]", key.name, days);
            }
        }

        Ok(key)
    }

    pub fn get(&self, value: &str) -> Option<ApiKey> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        keys.get(value).cloned()
    }

    pub fn len(&self) -> usize {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 解析密钥行: 密钥名=密钥值=过期时间[=限速设置[:限速值]]
fn parse_key_line(line: &str) -> Option<ApiKey> {
    let parts: Vec<&str> = line.split('=').collect();
    if parts.len() < 2 {
        return None;
    }

    let name = parts[0].trim();
    let value = parts[1].trim();
    if name.is_empty() || value.is_empty() {
        return None;
    }

    let expiry_str = parts.get(2).map(|s| s.trim()).unwrap_or("permanent");
    let expiry = if expiry_str.eq_ignore_ascii_case("permanent") {
        None
    } else {
        match NaiveDate::parse_from_str(expiry_str, "%Y-%m-%d") {
            Ok(date) => Some(date),
            Err(_) => {
                tracing::warn!("Invalid expiry date format [value:{}]", expiry_str);
                return None;
            }
        }
    };

    let rate = match parts.get(3).map(|s| s.trim().to_ascii_lowercase()) {
        None => RateDirective::Inherit,
        Some(directive) => {
            if let Some((setting, rate_value)) = directive.split_once(':') {
                match setting.trim() {
                    "rate_limit" => match rate_value.trim().parse::<u32>() {
                        Ok(n) => RateDirective::Explicit(n),
                        Err(_) => {
                            // An unparseable value degrades to the default rate.
                            tracing::warn!(
                                "Invalid rate limit value [value:{}], using default",
                                rate_value
                            );
                            RateDirective::Limited
                        }
                    },
                    "no_limit" => RateDirective::Disabled,
                    _ => RateDirective::Inherit,
                }
            } else {
                match directive.as_str() {
                    "rate_limit" => RateDirective::Limited,
                    "no_limit" => RateDirective::Disabled,
                    _ => RateDirective::Inherit,
                }
            }
        }
    };

    Some(ApiKey {
        name: name.to_string(),
        value: value.to_string(),
        expiry,
        rate,
    })
}

/// 掩码API密钥，只显示前4位和后4位
pub fn mask_api_key(value: &str) -> String {
    if value.is_empty() {
        return "<empty>".to_string();
    }
    if value.len() <= 8 {
        let tail = if value.len() > 3 {
            &value[value.len() - 2..]
        } else {
            ""
        };
        return format!("{}***{}", &value[..2.min(value.len())], tail);
    }
    format!("{}***{}", &value[..4], &value[value.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    fn registry_from(content: &str) -> (KeyRegistry, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let registry = KeyRegistry::new(file.path());
        (registry, file)
    }

    #[test]
    fn test_parse_permanent_with_explicit_rate() {
        let key = parse_key_line("API_KEY_3=sk-x=permanent=rate_limit:3").unwrap();
        assert_eq!(key.name, "API_KEY_3");
        assert_eq!(key.value, "sk-x");
        assert!(key.expiry.is_none());
        assert_eq!(key.rate, RateDirective::Explicit(3));
        assert!(!key.is_expired(Local::now().date_naive()));
    }

    #[test]
    fn test_parse_directives() {
        assert_eq!(
            parse_key_line("k=v=permanent=no_limit").unwrap().rate,
            RateDirective::Disabled
        );
        assert_eq!(
            parse_key_line("k=v=permanent=rate_limit").unwrap().rate,
            RateDirective::Limited
        );
        assert_eq!(parse_key_line("k=v").unwrap().rate, RateDirective::Inherit);
        // invalid numeric value degrades to the default rate
        assert_eq!(
            parse_key_line("k=v=permanent=rate_limit:abc").unwrap().rate,
            RateDirective::Limited
        );
    }

    #[test]
    fn test_malformed_lines_skipped() {
        assert!(parse_key_line("just-a-token").is_none());
        assert!(parse_key_line("name=").is_none());
        assert!(parse_key_line("k=v=not-a-date").is_none());
    }

    #[test]
    fn test_registry_load_and_validate() {
        let (registry, _file) = registry_from(
            "# comment line\n\
             API_KEY_1=sk-alpha=permanent\n\
             API_KEY_2=sk-beta=2099-12-31=no_limit\n\
             API_KEY_3=sk-old=2020-01-01\n\
             broken line without equals\n",
        );

        assert_eq!(registry.len(), 2);
        assert!(registry.validate("sk-alpha").is_ok());
        let beta = registry.validate("sk-beta").unwrap();
        assert_eq!(beta.rate, RateDirective::Disabled);

        // expired key was dropped at load time
        assert!(registry.validate("sk-old").is_err());
        // unknown key
        assert!(matches!(
            registry.validate("sk-missing"),
            Err(ProxyError::Auth(_))
        ));
    }

    #[test]
    fn test_reload_replaces_wholesale() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"API_KEY_1=sk-one=permanent\n").unwrap();
        let registry = KeyRegistry::new(file.path());
        assert!(registry.validate("sk-one").is_ok());

        file.as_file().set_len(0).unwrap();
        file.as_file().seek(SeekFrom::Start(0)).unwrap();
        file.write_all(b"API_KEY_2=sk-two=permanent\n").unwrap();
        registry.reload();
        assert!(registry.validate("sk-one").is_err());
        assert!(registry.validate("sk-two").is_ok());
    }

    #[test]
    fn test_mask_api_key() {
        assert_eq!(mask_api_key("sk-abcdef123456"), "sk-a***3456");
        assert_eq!(mask_api_key("short"), "sh***rt");
        assert_eq!(mask_api_key(""), "<empty>");
    }
}
