use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;

use crate::proxy::config::ProxyConfig;
use crate::proxy::error::ProxyError;
use crate::proxy::token_store::{StoredCredential, TokenStore};

/// 连续错误达到该次数后吊销凭证
const MAX_TOKEN_ERRORS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Valid,
    Expiring,
    Expired,
    Revoked,
}

/// 上游访问凭证
#[derive(Debug, Clone)]
pub struct Credential {
    pub value: String,
    pub acquired_at: i64,
    pub expires_at: i64,
    pub use_count: u64,
    pub error_count: u32,
}

impl Credential {
    pub fn new(value: impl Into<String>, ttl_secs: i64) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            value: value.into(),
            acquired_at: now,
            expires_at: now + ttl_secs,
            use_count: 0,
            error_count: 0,
        }
    }

    /// 计算凭证在给定时刻的状态
    ///
    /// `margin` is the remaining-lifetime threshold below which a credential
    /// counts as expiring and is skipped by checkout.
    pub fn status_at(&self, now: i64, margin: i64) -> CredentialStatus {
        if now >= self.expires_at {
            CredentialStatus::Expired
        } else if now >= self.expires_at - margin {
            CredentialStatus::Expiring
        } else {
            CredentialStatus::Valid
        }
    }

    pub fn remaining_secs(&self, now: i64) -> i64 {
        self.expires_at - now
    }
}

impl From<&Credential> for StoredCredential {
    fn from(cred: &Credential) -> Self {
        StoredCredential {
            value: cred.value.clone(),
            acquired_at: cred.acquired_at,
            expires_at: cred.expires_at,
            use_count: cred.use_count,
            error_count: cred.error_count,
        }
    }
}

impl From<StoredCredential> for Credential {
    fn from(stored: StoredCredential) -> Self {
        Credential {
            value: stored.value,
            acquired_at: stored.acquired_at,
            expires_at: stored.expires_at,
            use_count: stored.use_count,
            error_count: stored.error_count,
        }
    }
}

/// Upstream credential issuer seam. The real implementation lives in
/// `proxy::upstream::client`; tests inject counting mocks.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn acquire(&self) -> Result<Credential, ProxyError>;
}

/// 指数退避参数
#[derive(Debug, Clone)]
pub struct TokenRetryPolicy {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl TokenRetryPolicy {
    /// 计算指数退避延迟（含 0.8–1.2 抖动）
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let exp = self
            .initial_delay_ms
            .saturating_mul(1u64 << attempt.min(20));
        let capped = exp.min(self.max_delay_ms);
        let jitter: f64 = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_millis((capped as f64 * jitter) as u64)
    }
}

/// Token 管理器
///
/// A fixed arena of slots, each guarded by its own mutex so unrelated slots
/// rotate concurrently. Acquisition for a slot happens while that slot's
/// mutex is held: concurrent checkouts that land on the same empty slot
/// queue on the mutex and find the fresh credential when they re-check,
/// which coalesces them into a single upstream call.
pub struct TokenManager {
    slots: Vec<Arc<Mutex<Option<Credential>>>>,
    cursor: AtomicUsize,
    fetcher: Arc<dyn TokenFetcher>,
    store: Arc<dyn TokenStore>,
    cache_enabled: bool,
    refresh_margin: i64,
    retry: TokenRetryPolicy,
    /// 已吊销凭证集合 (值 -> 吊销时间戳)
    revoked: DashMap<String, i64>,
    acquisitions: AtomicU64,
}

impl TokenManager {
    pub fn new(
        fetcher: Arc<dyn TokenFetcher>,
        store: Arc<dyn TokenStore>,
        config: &ProxyConfig,
    ) -> Self {
        let pool_size = config.token_pool_size.max(1);
        Self {
            slots: (0..pool_size)
                .map(|_| Arc::new(Mutex::new(None)))
                .collect(),
            cursor: AtomicUsize::new(0),
            fetcher,
            store,
            cache_enabled: config.token_cache_enabled,
            refresh_margin: config.refresh_margin_secs,
            retry: TokenRetryPolicy {
                max_retries: config.max_token_retries,
                initial_delay_ms: config.initial_retry_delay_ms,
                max_delay_ms: config.max_retry_delay_ms,
            },
            revoked: DashMap::new(),
            acquisitions: AtomicU64::new(0),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    /// 凭证的综合状态（含吊销集合）
    fn credential_status(&self, cred: &Credential, now: i64) -> CredentialStatus {
        if self.revoked.contains_key(&cred.value) {
            CredentialStatus::Revoked
        } else {
            cred.status_at(now, self.refresh_margin)
        }
    }

    pub fn acquisition_count(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// 启动时从存储预热池，丢弃已过期的条目
    pub async fn load_from_store(&self) -> usize {
        let store = Arc::clone(&self.store);
        let entries = match tokio::task::spawn_blocking(move || store.load_all()).await {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                tracing::warn!("Token store load failed, starting cold: {}", e);
                return 0;
            }
            Err(e) => {
                tracing::warn!("Token store load task failed: {}", e);
                return 0;
            }
        };

        let now = chrono::Utc::now().timestamp();
        let mut warmed = 0;
        for stored in entries {
            if warmed >= self.slots.len() {
                break;
            }
            if stored.expires_at <= now {
                continue;
            }
            let mut guard = self.slots[warmed].lock().await;
            *guard = Some(Credential::from(stored));
            warmed += 1;
        }

        // Drop expired rows so they never come back on the next start.
        self.purge_store(now).await;

        if warmed > 0 {
            tracing::info!("Token pool warmed with {} stored credentials", warmed);
        }
        warmed
    }

    /// 获取一个可用凭证
    ///
    /// Round-robin over valid credentials; an empty or expiring pool
    /// triggers a synchronous acquisition with retry/backoff. Never returns
    /// an expired or revoked credential.
    pub async fn checkout(&self) -> Result<Credential, ProxyError> {
        let total = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::SeqCst) % total;
        let now = chrono::Utc::now().timestamp();

        // Pass 1: a usable credential anywhere in the pool. try_lock keeps
        // rotation moving past slots busy with an in-flight acquisition.
        for offset in 0..total {
            let idx = (start + offset) % total;
            let Ok(mut guard) = self.slots[idx].try_lock() else {
                continue;
            };

            let mut stale: Option<String> = None;
            let mut picked: Option<Credential> = None;
            if let Some(cred) = guard.as_mut() {
                match self.credential_status(cred, now) {
                    CredentialStatus::Valid => {
                        cred.use_count += 1;
                        picked = Some(cred.clone());
                    }
                    CredentialStatus::Expired | CredentialStatus::Revoked => {
                        stale = Some(cred.value.clone());
                        *guard = None;
                    }
                    // Expiring credentials are left in place for the
                    // refresh pass; checkout skips them.
                    CredentialStatus::Expiring => {}
                }
            }
            drop(guard);

            if let Some(value) = stale {
                self.discard_from_store(&value).await;
            }
            if let Some(cred) = picked {
                return Ok(cred);
            }
        }

        // Pass 2: nothing usable; acquire into the rotation slot. Holding
        // the slot mutex across the upstream call is what coalesces
        // concurrent checkouts into one acquisition (single-flight).
        let slot = Arc::clone(&self.slots[start]);
        let mut guard = slot.lock().await;

        // Re-check after the lock: another task may have just filled it.
        let now = chrono::Utc::now().timestamp();
        if let Some(cred) = guard.as_mut() {
            if self.credential_status(cred, now) == CredentialStatus::Valid {
                cred.use_count += 1;
                return Ok(cred.clone());
            }
        }

        let mut fresh = self.acquire_with_retry().await?;
        fresh.use_count = 1;
        *guard = Some(fresh.clone());
        drop(guard);

        // Store I/O happens outside the slot lock.
        self.persist(&fresh).await;
        Ok(fresh)
    }

    /// 记录凭证使用错误
    ///
    /// 401/403 mean the upstream no longer honors the credential: revoke it
    /// immediately so the next checkout acquires a fresh one. Other errors
    /// count toward the revocation threshold.
    pub async fn record_error(&self, value: &str, status: u16) {
        if status == 401 || status == 403 {
            tracing::warn!(
                "Upstream rejected token {} with HTTP {}, revoking",
                mask_token(value),
                status
            );
            self.revoke(value).await;
            return;
        }

        let mut should_revoke = false;
        let mut snapshot: Option<Credential> = None;
        for slot in &self.slots {
            let mut guard = slot.lock().await;
            if let Some(cred) = guard.as_mut() {
                if cred.value == value {
                    cred.error_count += 1;
                    if cred.error_count >= MAX_TOKEN_ERRORS {
                        should_revoke = true;
                    } else {
                        snapshot = Some(cred.clone());
                    }
                    break;
                }
            }
        }

        if should_revoke {
            tracing::warn!(
                "Token {} reached the error limit, revoking",
                mask_token(value)
            );
            self.revoke(value).await;
        } else if let Some(cred) = snapshot {
            tracing::debug!(
                "Recorded error for token {} (HTTP {}, count {})",
                mask_token(value),
                status,
                cred.error_count
            );
            self.persist(&cred).await;
        }
    }

    /// 吊销凭证并从池中清除
    pub async fn revoke(&self, value: &str) {
        let now = chrono::Utc::now().timestamp();
        self.revoked.insert(value.to_string(), now);
        for slot in &self.slots {
            let mut guard = slot.lock().await;
            if guard.as_ref().map(|c| c.value == value).unwrap_or(false) {
                *guard = None;
            }
        }
        self.discard_from_store(value).await;
    }

    /// 启动后台刷新任务
    pub fn spawn_refresh_loop(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                manager.refresh_pass().await;
            }
        })
    }

    /// 扫描池并主动刷新临期凭证
    ///
    /// Runs independently of request handling; replaces credentials in
    /// place so in-flight checkouts (which hold clones) are unaffected.
    pub async fn refresh_pass(&self) -> usize {
        let mut refreshed = 0;

        for slot in self.slots.iter() {
            let now = chrono::Utc::now().timestamp();
            let mut guard = slot.lock().await;

            let needs_refresh = match guard.as_ref() {
                Some(cred) => match self.credential_status(cred, now) {
                    CredentialStatus::Valid => false,
                    CredentialStatus::Revoked => {
                        *guard = None;
                        false
                    }
                    CredentialStatus::Expiring | CredentialStatus::Expired => true,
                },
                // Empty slots fill on demand at checkout.
                None => false,
            };
            if !needs_refresh {
                continue;
            }

            let old_value = guard.as_ref().map(|c| c.value.clone());
            match self.acquire_with_retry().await {
                Ok(fresh) => {
                    tracing::debug!(
                        "Refreshed expiring token {} -> {}",
                        old_value.as_deref().map(mask_token).unwrap_or_default(),
                        mask_token(&fresh.value)
                    );
                    *guard = Some(fresh.clone());
                    drop(guard);
                    refreshed += 1;
                    if let Some(old) = old_value {
                        if old != fresh.value {
                            self.discard_from_store(&old).await;
                        }
                    }
                    self.persist(&fresh).await;
                }
                Err(e) => {
                    tracing::warn!("Background token refresh failed: {}", e);
                    // An expired credential must not linger in the pool.
                    if let Some(cred) = guard.as_ref() {
                        if cred.status_at(now, 0) == CredentialStatus::Expired {
                            *guard = None;
                        }
                    }
                }
            }
        }

        self.purge_store(chrono::Utc::now().timestamp()).await;
        refreshed
    }

    /// 当前池中立即可用的凭证数量（统计用）
    pub fn available(&self) -> usize {
        let now = chrono::Utc::now().timestamp();
        self.slots
            .iter()
            .filter(|slot| match slot.try_lock() {
                Ok(guard) => guard
                    .as_ref()
                    .map(|c| self.credential_status(c, now) == CredentialStatus::Valid)
                    .unwrap_or(false),
                Err(_) => false,
            })
            .count()
    }

    async fn acquire_with_retry(&self) -> Result<Credential, ProxyError> {
        let mut last_err = String::new();
        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                let delay = self.retry.backoff_delay(attempt - 1);
                tracing::warn!(
                    "Token acquisition retry {}/{} in {}ms",
                    attempt,
                    self.retry.max_retries,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            match self.fetcher.acquire().await {
                Ok(cred) => {
                    self.acquisitions.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        "Acquired upstream token {} (expires in {}s)",
                        mask_token(&cred.value),
                        cred.remaining_secs(chrono::Utc::now().timestamp())
                    );
                    return Ok(cred);
                }
                Err(e) => {
                    last_err = e.to_string();
                    tracing::warn!("Token acquisition attempt {} failed: {}", attempt + 1, e);
                }
            }
        }
        Err(ProxyError::AcquisitionFailed {
            attempts: self.retry.max_retries + 1,
            message: last_err,
        })
    }

    async fn persist(&self, cred: &Credential) {
        if !self.cache_enabled {
            return;
        }
        let store = Arc::clone(&self.store);
        let snapshot = StoredCredential::from(cred);
        let result = tokio::task::spawn_blocking(move || store.save(&snapshot)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Token persist failed (continuing in memory): {}", e),
            Err(e) => tracing::warn!("Token persist task failed: {}", e),
        }
    }

    async fn discard_from_store(&self, value: &str) {
        if !self.cache_enabled {
            return;
        }
        let store = Arc::clone(&self.store);
        let value = value.to_string();
        let result = tokio::task::spawn_blocking(move || store.remove(&value)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Token store remove failed: {}", e),
            Err(e) => tracing::warn!("Token store remove task failed: {}", e),
        }
    }

    async fn purge_store(&self, now: i64) {
        if !self.cache_enabled {
            return;
        }
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || store.purge_expired(now)).await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::debug!("Token store purge failed: {}", e),
            Err(e) => tracing::debug!("Token store purge task failed: {}", e),
        }
    }

    #[cfg(test)]
    async fn inject_for_test(&self, idx: usize, cred: Credential) {
        let mut guard = self.slots[idx].lock().await;
        *guard = Some(cred);
    }
}

/// 日志中只显示凭证前缀
fn mask_token(value: &str) -> String {
    let prefix: String = value.chars().take(10).collect();
    if value.chars().count() > 10 {
        format!("{}...", prefix)
    } else {
        prefix
    }
}
