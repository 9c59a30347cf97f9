use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Sliding-window rate limiter.
///
/// Keyed by an opaque subject string (a client IP or an API key value).
/// Each subject holds the timestamps of its admitted requests inside the
/// current window; stale entries are pruned on access so the map never
/// grows with time. Record-and-decide for one subject happens under that
/// subject's dashmap entry guard, so two concurrent requests from the same
/// subject are linearized without a global lock.
pub struct RateLimiter {
    history: DashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            history: DashMap::new(),
        }
    }

    /// 检查请求是否被允许，允许时记录本次请求
    ///
    /// Admits iff the subject has fewer than `limit` admitted requests in
    /// the trailing window. Rejected requests are not recorded.
    pub fn allow(&self, subject: &str, limit: u32, window: Duration) -> bool {
        self.allow_at(subject, limit, window, Instant::now())
    }

    fn allow_at(&self, subject: &str, limit: u32, window: Duration, now: Instant) -> bool {
        let mut stamps = self.history.entry(subject.to_string()).or_default();
        Self::prune(&mut stamps, window, now);

        if stamps.len() >= limit as usize {
            return false;
        }
        stamps.push(now);
        true
    }

    /// 获取剩余的请求配额
    pub fn remaining(&self, subject: &str, limit: u32, window: Duration) -> u32 {
        self.remaining_at(subject, limit, window, Instant::now())
    }

    fn remaining_at(&self, subject: &str, limit: u32, window: Duration, now: Instant) -> u32 {
        match self.history.get_mut(subject) {
            Some(mut stamps) => {
                Self::prune(&mut stamps, window, now);
                limit.saturating_sub(stamps.len() as u32)
            }
            None => limit,
        }
    }

    /// 获取下一次请求可以尝试的时间(秒)
    ///
    /// Seconds until the oldest recorded request leaves the window, plus a
    /// one-second buffer. 0 when the subject has free quota.
    pub fn retry_after(&self, subject: &str, window: Duration) -> u64 {
        self.retry_after_at(subject, window, Instant::now())
    }

    fn retry_after_at(&self, subject: &str, window: Duration, now: Instant) -> u64 {
        match self.history.get(subject) {
            Some(stamps) => match stamps.first() {
                // Timestamps are appended monotonically, so first() is oldest.
                Some(oldest) => {
                    let age = now.saturating_duration_since(*oldest);
                    let wait = window.saturating_sub(age);
                    if wait.is_zero() { 0 } else { wait.as_secs() + 1 }
                }
                None => 0,
            },
            None => 0,
        }
    }

    /// 清除窗口外的全部过期记录
    pub fn cleanup_expired(&self, window: Duration) -> usize {
        self.cleanup_expired_at(window, Instant::now())
    }

    fn cleanup_expired_at(&self, window: Duration, now: Instant) -> usize {
        let before = self.history.len();
        self.history.retain(|_subject, stamps| {
            Self::prune(stamps, window, now);
            !stamps.is_empty()
        });
        let removed = before - self.history.len();
        if removed > 0 {
            tracing::debug!("Rate limiter dropped {} idle subjects", removed);
        }
        removed
    }

    pub fn tracked_subjects(&self) -> usize {
        self.history.len()
    }

    fn prune(stamps: &mut Vec<Instant>, window: Duration, now: Instant) {
        stamps.retain(|t| now.saturating_duration_since(*t) < window);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_admits_up_to_limit() {
        let limiter = RateLimiter::new();
        for _ in 0..50 {
            assert!(limiter.allow("10.0.0.1", 50, WINDOW));
        }
        // 51st request within the window is rejected
        assert!(!limiter.allow("10.0.0.1", 50, WINDOW));
        assert!(limiter.retry_after("10.0.0.1", WINDOW) > 0);
    }

    #[test]
    fn test_subjects_are_independent() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("a", 1, WINDOW));
        assert!(!limiter.allow("a", 1, WINDOW));
        assert!(limiter.allow("b", 1, WINDOW));
    }

    #[test]
    fn test_rejected_requests_are_not_recorded() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("a", 1, WINDOW));
        for _ in 0..10 {
            assert!(!limiter.allow("a", 1, WINDOW));
        }
        // only the admitted request occupies the window
        assert_eq!(limiter.remaining("a", 1, WINDOW), 0);
        let stamps = limiter.history.get("a").unwrap();
        assert_eq!(stamps.len(), 1);
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        let window = Duration::from_secs(60);

        assert!(limiter.allow_at("a", 2, window, start));
        assert!(limiter.allow_at("a", 2, window, start + Duration::from_secs(10)));
        assert!(!limiter.allow_at("a", 2, window, start + Duration::from_secs(30)));

        // first record leaves the window at start+60
        assert!(limiter.allow_at("a", 2, window, start + Duration::from_secs(61)));
        // records from +10s and +61s still occupy the window at +65s
        assert!(!limiter.allow_at("a", 2, window, start + Duration::from_secs(65)));
        // the +10s record expires at +70s
        assert!(limiter.allow_at("a", 2, window, start + Duration::from_secs(71)));
    }

    #[test]
    fn test_retry_after_tracks_oldest_record() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        let window = Duration::from_secs(60);

        assert!(limiter.allow_at("a", 1, window, start));
        let wait = limiter.retry_after_at("a", window, start + Duration::from_secs(10));
        // 50 seconds left in the window, +1s buffer
        assert_eq!(wait, 51);
        assert_eq!(limiter.retry_after_at("a", window, start + Duration::from_secs(61)), 0);
    }

    #[test]
    fn test_remaining() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.remaining("a", 5, WINDOW), 5);
        limiter.allow("a", 5, WINDOW);
        limiter.allow("a", 5, WINDOW);
        assert_eq!(limiter.remaining("a", 5, WINDOW), 3);
    }

    #[test]
    fn test_cleanup_expired() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        limiter.allow_at("stale", 5, WINDOW, start);
        limiter.allow_at("fresh", 5, WINDOW, start + Duration::from_secs(100));

        assert_eq!(limiter.tracked_subjects(), 2);
        assert_eq!(
            limiter.cleanup_expired_at(WINDOW, start + Duration::from_secs(120)),
            1
        );
        assert_eq!(limiter.tracked_subjects(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_limit_holds_under_concurrency() {
        let limiter = Arc::new(RateLimiter::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let mut admitted = 0u32;
                for _ in 0..25 {
                    if limiter.allow("shared-ip", 50, WINDOW) {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        // 400 attempts from 16 tasks, never more than the limit admitted
        assert_eq!(total, 50);
    }
}
