//! Sliding-window rate limiting for payment verification attempts.
//!
//! Each caller identifier (typically a client IP or bearer identity) owns an
//! ordered set of attempt timestamps in the backing store. On every check the
//! window is pruned lazily: entries older than `now - window` are dropped and
//! the remaining cardinality is compared against the attempt budget.
//!
//! Identifiers are hashed before being used as store keys, so an
//! attacker-controlled identifier string (e.g. a spoofed header) cannot shape
//! key names in a shared store.

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Failure of the backing store. Rate limiting fails closed: a window that
/// cannot be read does not admit the request.
#[derive(Debug, thiserror::Error)]
#[error("Rate limit store failure: {0}")]
pub struct RateLimitStoreError(pub String);

/// Backing store holding one ordered timestamp set per key.
///
/// Timestamps are microseconds since the Unix epoch. All operations prune
/// entries older than `cutoff_micros` before acting, which keeps windows
/// trimmed without a background sweeper.
#[async_trait]
pub trait SlidingWindowStore: Send + Sync {
    /// Prunes, then returns the number of entries still inside the window.
    async fn count_in_window(
        &self,
        key: &str,
        cutoff_micros: u64,
    ) -> Result<usize, RateLimitStoreError>;

    /// Prunes, appends `now_micros`, and returns the new cardinality.
    async fn add_attempt(
        &self,
        key: &str,
        now_micros: u64,
        cutoff_micros: u64,
    ) -> Result<usize, RateLimitStoreError>;

    /// Drops the oldest entry, if any.
    async fn remove_oldest(&self, key: &str) -> Result<(), RateLimitStoreError>;

    /// Drops the whole window for `key`.
    async fn clear(&self, key: &str) -> Result<(), RateLimitStoreError>;
}

/// Single-process [`SlidingWindowStore`] backed by per-key deques.
#[derive(Debug, Default)]
pub struct InMemorySlidingWindowStore {
    windows: DashMap<String, VecDeque<u64>>,
}

impl InMemorySlidingWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn prune(window: &mut VecDeque<u64>, cutoff_micros: u64) {
    while let Some(oldest) = window.front() {
        if *oldest < cutoff_micros {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[async_trait]
impl SlidingWindowStore for InMemorySlidingWindowStore {
    async fn count_in_window(
        &self,
        key: &str,
        cutoff_micros: u64,
    ) -> Result<usize, RateLimitStoreError> {
        match self.windows.get_mut(key) {
            Some(mut window) => {
                prune(&mut window, cutoff_micros);
                Ok(window.len())
            }
            None => Ok(0),
        }
    }

    async fn add_attempt(
        &self,
        key: &str,
        now_micros: u64,
        cutoff_micros: u64,
    ) -> Result<usize, RateLimitStoreError> {
        let mut window = self.windows.entry(key.to_string()).or_default();
        prune(&mut window, cutoff_micros);
        window.push_back(now_micros);
        Ok(window.len())
    }

    async fn remove_oldest(&self, key: &str) -> Result<(), RateLimitStoreError> {
        if let Some(mut window) = self.windows.get_mut(key) {
            window.pop_front();
        }
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), RateLimitStoreError> {
        self.windows.remove(key);
        Ok(())
    }
}

/// Sliding-window attempt counter per caller identifier.
pub struct RateLimiter {
    store: Arc<dyn SlidingWindowStore>,
    max_attempts: usize,
    window: Duration,
    namespace: String,
}

impl RateLimiter {
    const DEFAULT_NAMESPACE: &'static str = "x402:ratelimit";

    pub fn new(store: Arc<dyn SlidingWindowStore>, max_attempts: usize, window: Duration) -> Self {
        Self {
            store,
            max_attempts,
            window,
            namespace: Self::DEFAULT_NAMESPACE.to_string(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Hashed store key for an identifier.
    fn key(&self, identifier: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.namespace.as_bytes());
        hasher.update(b":");
        hasher.update(identifier.as_bytes());
        format!("{}:{}", self.namespace, hex::encode(hasher.finalize()))
    }

    fn now_micros() -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("SystemTime before UNIX epoch?!?")
            .as_micros() as u64
    }

    fn cutoff_micros(&self) -> u64 {
        Self::now_micros().saturating_sub(self.window.as_micros() as u64)
    }

    /// Whether the identifier still has attempt budget inside the window.
    pub async fn is_allowed(&self, identifier: &str) -> Result<bool, RateLimitStoreError> {
        let count = self
            .store
            .count_in_window(&self.key(identifier), self.cutoff_micros())
            .await?;
        Ok(count < self.max_attempts)
    }

    /// Records an attempt and returns the current count inside the window.
    pub async fn record_attempt(&self, identifier: &str) -> Result<usize, RateLimitStoreError> {
        self.store
            .add_attempt(
                &self.key(identifier),
                Self::now_micros(),
                self.cutoff_micros(),
            )
            .await
    }

    /// Relieves one prior attempt, rewarding a successful payment.
    pub async fn record_success(&self, identifier: &str) -> Result<(), RateLimitStoreError> {
        self.store.remove_oldest(&self.key(identifier)).await
    }

    /// Forgets all attempts for the identifier.
    pub async fn reset(&self, identifier: &str) -> Result<(), RateLimitStoreError> {
        self.store.clear(&self.key(identifier)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_attempts: usize, window: Duration) -> RateLimiter {
        RateLimiter::new(
            Arc::new(InMemorySlidingWindowStore::new()),
            max_attempts,
            window,
        )
    }

    #[tokio::test]
    async fn admits_up_to_the_budget_then_rejects() {
        let limiter = limiter(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limiter.is_allowed("10.0.0.1").await.unwrap());
            limiter.record_attempt("10.0.0.1").await.unwrap();
        }
        assert!(!limiter.is_allowed("10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn admits_again_after_the_window_ages_out() {
        let limiter = limiter(2, Duration::from_millis(100));
        limiter.record_attempt("10.0.0.1").await.unwrap();
        limiter.record_attempt("10.0.0.1").await.unwrap();
        assert!(!limiter.is_allowed("10.0.0.1").await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.is_allowed("10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn identifiers_have_independent_windows() {
        let limiter = limiter(1, Duration::from_secs(60));
        limiter.record_attempt("10.0.0.1").await.unwrap();
        assert!(!limiter.is_allowed("10.0.0.1").await.unwrap());
        assert!(limiter.is_allowed("10.0.0.2").await.unwrap());
    }

    #[tokio::test]
    async fn success_relieves_one_attempt() {
        let limiter = limiter(2, Duration::from_secs(60));
        limiter.record_attempt("10.0.0.1").await.unwrap();
        limiter.record_attempt("10.0.0.1").await.unwrap();
        assert!(!limiter.is_allowed("10.0.0.1").await.unwrap());
        limiter.record_success("10.0.0.1").await.unwrap();
        assert!(limiter.is_allowed("10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn reset_clears_the_window() {
        let limiter = limiter(1, Duration::from_secs(60));
        limiter.record_attempt("10.0.0.1").await.unwrap();
        assert!(!limiter.is_allowed("10.0.0.1").await.unwrap());
        limiter.reset("10.0.0.1").await.unwrap();
        assert!(limiter.is_allowed("10.0.0.1").await.unwrap());
    }

    #[test]
    fn store_keys_do_not_echo_identifiers() {
        let limiter = limiter(1, Duration::from_secs(60));
        let key = limiter.key("evil:*:key");
        assert!(!key.contains("evil"));
        assert!(key.starts_with("x402:ratelimit:"));
    }

    #[tokio::test]
    async fn record_attempt_reports_count() {
        let limiter = limiter(5, Duration::from_secs(60));
        assert_eq!(limiter.record_attempt("10.0.0.1").await.unwrap(), 1);
        assert_eq!(limiter.record_attempt("10.0.0.1").await.unwrap(), 2);
    }
}
