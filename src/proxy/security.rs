use axum::http::HeaderMap;
use dashmap::DashMap;
use regex::Regex;
use std::time::{Duration, SystemTime};

/// Inspection verdict
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow,
    Block(String),
}

/// One suspicious-request rule. The rule set is data, not code: operators
/// can replace the defaults wholesale via `SecurityGuard::with_rules`.
pub struct SuspiciousRule {
    pub pattern: Regex,
    pub weight: u32,
    pub reason: &'static str,
}

/// Ban record for one IP
#[derive(Debug, Clone)]
pub struct BanEntry {
    pub reason: String,
    pub banned_at: SystemTime,
    pub expires_at: SystemTime,
    pub strike_count: u32,
}

impl BanEntry {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_secs(&self, now: SystemTime) -> u64 {
        self.expires_at
            .duration_since(now)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Default path probes seen from scanners. Weights: generic probes count 1,
/// env/credential probes and traversal count 2.
pub fn default_rules() -> Vec<SuspiciousRule> {
    let table: [(&str, u32, &str); 8] = [
        (r"(?i)/\.env(\.|$|/)?", 2, "env file probe"),
        (r"(?i)/\.git(/|$)", 2, "git directory probe"),
        (r"(?i)\.\./|%2e%2e", 2, "path traversal"),
        (r"(?i)/wp-(admin|login|content)", 1, "wordpress probe"),
        (r"(?i)/phpmyadmin", 1, "phpmyadmin probe"),
        (r"(?i)/(admin|manager)/(config|console|html)", 1, "admin console probe"),
        (r"(?i)\.php(\?|$)", 1, "php endpoint probe"),
        (r"(?i)/etc/passwd", 2, "system file probe"),
    ];

    table
        .iter()
        .filter_map(|&(pattern, weight, reason)| {
            Regex::new(pattern).ok().map(|re| SuspiciousRule {
                pattern: re,
                weight,
                reason,
            })
        })
        .collect()
}

const MAX_HEADER_VALUE_LEN: usize = 8 * 1024;

/// Suspicious-request scoring and IP ban management.
///
/// Inspection order: whitelist, active ban, rule scan. Strike accounting
/// for one IP happens under its dashmap entry guard, so the threshold
/// decision is atomic per subject: two concurrent suspicious requests
/// cannot both slip past the ban check once their combined strikes cross
/// the threshold.
pub struct SecurityGuard {
    whitelist: Vec<String>,
    block_threshold: u32,
    block_duration: Duration,
    rules: Vec<SuspiciousRule>,
    strikes: DashMap<String, u32>,
    bans: DashMap<String, BanEntry>,
}

impl SecurityGuard {
    pub fn new(whitelist: Vec<String>, block_threshold: u32, block_duration: Duration) -> Self {
        Self::with_rules(whitelist, block_threshold, block_duration, default_rules())
    }

    pub fn with_rules(
        whitelist: Vec<String>,
        block_threshold: u32,
        block_duration: Duration,
        rules: Vec<SuspiciousRule>,
    ) -> Self {
        Self {
            whitelist,
            block_threshold: block_threshold.max(1),
            block_duration,
            rules,
            strikes: DashMap::new(),
            bans: DashMap::new(),
        }
    }

    /// 检查请求是否放行
    pub fn inspect(&self, ip: &str, method: &str, path: &str, headers: &HeaderMap) -> Verdict {
        self.inspect_at(ip, method, path, headers, SystemTime::now())
    }

    fn inspect_at(
        &self,
        ip: &str,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        now: SystemTime,
    ) -> Verdict {
        // 1. Whitelisted subjects are always allowed and never accumulate strikes.
        if self.is_whitelisted(ip) {
            return Verdict::Allow;
        }

        // 2. Active ban?
        if let Some(ban) = self.active_ban(ip, now) {
            tracing::debug!(
                "Blocked banned IP {} ({}), {}s remaining",
                ip,
                ban.reason,
                ban.remaining_secs(now)
            );
            return Verdict::Block(format!("IP banned: {}", ban.reason));
        }

        // 3. Rule scan; every match adds its weight to the strike count.
        let mut weight = 0u32;
        let mut reason = "";
        for rule in &self.rules {
            if rule.pattern.is_match(path) {
                weight += rule.weight;
                if reason.is_empty() {
                    reason = rule.reason;
                }
            }
        }

        if let Some(oversized) = headers
            .iter()
            .find(|(_, v)| v.as_bytes().len() > MAX_HEADER_VALUE_LEN)
        {
            weight += 1;
            if reason.is_empty() {
                reason = "oversized header";
            }
            tracing::debug!("Oversized header {} from {}", oversized.0, ip);
        }

        if method == "POST" {
            let content_type_ok = headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.contains("application/json") || v.contains("multipart/form-data"))
                .unwrap_or(false);
            if !content_type_ok {
                weight += 1;
                if reason.is_empty() {
                    reason = "malformed content type";
                }
            }
        }

        if weight == 0 {
            return Verdict::Allow;
        }

        tracing::warn!(
            "Suspicious request from {} [{} {}]: {} (+{} strikes)",
            ip,
            method,
            path,
            reason,
            weight
        );

        if self.record_strikes(ip, weight, reason, now) {
            return Verdict::Block(format!("IP banned: {}", reason));
        }

        // Suspicious but below the threshold: the request itself still passes.
        Verdict::Allow
    }

    /// 记录违规并判断是否达到封禁阈值
    ///
    /// Returns true when this increment crossed the threshold and created a
    /// ban. Increment and decision run under the entry guard.
    fn record_strikes(&self, ip: &str, weight: u32, reason: &str, now: SystemTime) -> bool {
        let mut entry = self.strikes.entry(ip.to_string()).or_insert(0);
        *entry = entry.saturating_add(weight);
        let total = *entry;

        if total >= self.block_threshold {
            let ban = BanEntry {
                reason: reason.to_string(),
                banned_at: now,
                expires_at: now + self.block_duration,
                strike_count: total,
            };
            tracing::warn!(
                "IP {} banned for {}s after {} strikes ({})",
                ip,
                self.block_duration.as_secs(),
                total,
                reason
            );
            self.bans.insert(ip.to_string(), ban);
            drop(entry);
            self.strikes.remove(ip);
            return true;
        }
        false
    }

    fn active_ban(&self, ip: &str, now: SystemTime) -> Option<BanEntry> {
        let ban = self.bans.get(ip)?;
        if ban.is_expired(now) {
            drop(ban);
            // Expiry is passive; collect the stale entry opportunistically.
            self.bans.remove(ip);
            return None;
        }
        Some(ban.clone())
    }

    fn is_whitelisted(&self, ip: &str) -> bool {
        self.whitelist
            .iter()
            .any(|entry| ip == entry || (entry.ends_with('.') && ip.starts_with(entry.as_str())))
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        self.active_ban(ip, SystemTime::now()).is_some()
    }

    /// 清除过期的封禁记录
    pub fn cleanup_expired(&self) -> usize {
        let now = SystemTime::now();
        let before = self.bans.len();
        self.bans.retain(|_ip, ban| !ban.is_expired(now));
        before - self.bans.len()
    }

    pub fn ban_count(&self) -> usize {
        self.bans.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn guard(threshold: u32) -> SecurityGuard {
        SecurityGuard::new(
            vec!["127.0.0.1".to_string(), "192.168.".to_string()],
            threshold,
            Duration::from_secs(1800),
        )
    }

    fn headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("content-type", "application/json".parse().unwrap());
        h
    }

    #[test]
    fn test_clean_request_allowed() {
        let g = guard(3);
        assert_eq!(
            g.inspect("1.2.3.4", "POST", "/v1/chat/completions", &headers()),
            Verdict::Allow
        );
        assert_eq!(g.ban_count(), 0);
    }

    #[test]
    fn test_strikes_accumulate_to_ban() {
        let g = guard(3);
        // Two weight-2 probes cross a threshold of 3.
        assert_eq!(g.inspect("9.9.9.9", "GET", "/.env", &headers()), Verdict::Allow);
        assert!(matches!(
            g.inspect("9.9.9.9", "GET", "/.git/config", &headers()),
            Verdict::Block(_)
        ));

        // Once banned, every request blocks, even clean ones.
        assert!(matches!(
            g.inspect("9.9.9.9", "POST", "/v1/chat/completions", &headers()),
            Verdict::Block(_)
        ));
        assert!(g.is_banned("9.9.9.9"));
    }

    #[test]
    fn test_whitelisted_never_banned() {
        let g = guard(1);
        for _ in 0..10 {
            assert_eq!(
                g.inspect("127.0.0.1", "GET", "/.env", &headers()),
                Verdict::Allow
            );
            assert_eq!(
                g.inspect("192.168.1.44", "GET", "/.env", &headers()),
                Verdict::Allow
            );
        }
        assert_eq!(g.ban_count(), 0);
    }

    #[test]
    fn test_ban_expiry_is_passive() {
        let g = SecurityGuard::new(vec![], 1, Duration::from_secs(60));
        let start = SystemTime::now();

        assert!(matches!(
            g.inspect_at("5.5.5.5", "GET", "/.env", &headers(), start),
            Verdict::Block(_)
        ));
        // Still banned just before expiry
        assert!(matches!(
            g.inspect_at("5.5.5.5", "GET", "/", &headers(), start + Duration::from_secs(59)),
            Verdict::Block(_)
        ));
        // Expired entry behaves as no entry
        assert_eq!(
            g.inspect_at("5.5.5.5", "GET", "/", &headers(), start + Duration::from_secs(61)),
            Verdict::Allow
        );
    }

    #[test]
    fn test_oversized_header_strikes() {
        let g = SecurityGuard::new(vec![], 1, Duration::from_secs(60));
        let mut h = headers();
        h.insert("x-filler", "a".repeat(9000).parse().unwrap());
        assert!(matches!(
            g.inspect("6.6.6.6", "GET", "/v1/models", &h),
            Verdict::Block(_)
        ));
    }

    #[test]
    fn test_post_without_json_content_type_strikes() {
        let g = SecurityGuard::new(vec![], 5, Duration::from_secs(60));
        let h = HeaderMap::new();
        assert_eq!(
            g.inspect("7.7.7.7", "POST", "/v1/chat/completions", &h),
            Verdict::Allow
        );
        assert_eq!(*g.strikes.get("7.7.7.7").unwrap(), 1);
    }

    #[test]
    fn test_cleanup_expired_bans() {
        let g = SecurityGuard::new(vec![], 1, Duration::from_secs(0));
        let _ = g.inspect("8.8.8.8", "GET", "/.env", &headers());
        // zero-duration ban expires immediately
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(g.cleanup_expired(), 1);
        assert_eq!(g.ban_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_ban_decision_atomic_under_concurrency() {
        let g = Arc::new(SecurityGuard::new(vec![], 10, Duration::from_secs(600)));
        let mut handles = Vec::new();
        // 20 concurrent weight-1 probes; threshold 10 must ban exactly once
        // and all subsequent inspections must block.
        for _ in 0..20 {
            let g = g.clone();
            handles.push(tokio::spawn(async move {
                g.inspect("3.3.3.3", "GET", "/phpmyadmin", &HeaderMap::new())
            }));
        }
        for handle in handles {
            let _ = handle.await.unwrap();
        }
        assert!(g.is_banned("3.3.3.3"));
        assert!(matches!(
            g.inspect("3.3.3.3", "GET", "/v1/models", &HeaderMap::new()),
            Verdict::Block(_)
        ));
    }
}
