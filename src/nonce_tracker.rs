//! Replay prevention for payment authorizations.
//!
//! A nonce, once accepted, must never authorize a second payment. The
//! [`NonceStore`] trait abstracts the backing key-value store so a
//! distributed backend (e.g. a store with native create-if-absent-with-expiry)
//! can replace the in-memory one without touching the pipeline. The critical
//! contract is that [`NonceStore::put_if_absent`] is a single atomic
//! operation: a separate check-then-set would open a race window in which the
//! same authorization could be accepted twice.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::{Duration, Instant};

use crate::types::HexEncodedNonce;

/// Failure of the backing store. Callers treat this as fatal for the current
/// request: a nonce that cannot be checked must not authorize a payment.
#[derive(Debug, thiserror::Error)]
#[error("Nonce store failure: {0}")]
pub struct NonceStoreError(pub String);

/// Backing store for used nonces.
///
/// Keys are opaque namespaced strings; values only need to exist until their
/// TTL lapses.
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Atomically creates `key` with the given TTL if it is absent (or its
    /// previous entry has expired). Returns `true` when the key was newly
    /// created, `false` when a live entry already existed.
    async fn put_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, NonceStoreError>;

    /// Whether a live entry exists for `key`.
    async fn contains(&self, key: &str) -> Result<bool, NonceStoreError>;

    /// Removes `key` regardless of TTL.
    async fn remove(&self, key: &str) -> Result<(), NonceStoreError>;
}

/// Single-process [`NonceStore`] backed by a sharded concurrent map.
///
/// Entries hold their expiry instant; expired entries are treated as absent
/// and reclaimed lazily on access. The entry API keeps `put_if_absent` atomic
/// within the map shard.
#[derive(Debug, Default)]
pub struct InMemoryNonceStore {
    entries: DashMap<String, Instant>,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn put_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, NonceStoreError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() <= now {
                    occupied.insert(now + ttl);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now + ttl);
                Ok(true)
            }
        }
    }

    async fn contains(&self, key: &str) -> Result<bool, NonceStoreError> {
        let now = Instant::now();
        self.entries.remove_if(key, |_, expires_at| *expires_at <= now);
        Ok(self.entries.contains_key(key))
    }

    async fn remove(&self, key: &str) -> Result<(), NonceStoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Tracks used payment nonces under a namespace.
///
/// The namespace keeps nonce keys from colliding with other data in a shared
/// store.
pub struct NonceTracker {
    store: std::sync::Arc<dyn NonceStore>,
    namespace: String,
}

impl NonceTracker {
    const DEFAULT_NAMESPACE: &'static str = "x402:nonce";

    pub fn new(store: std::sync::Arc<dyn NonceStore>) -> Self {
        Self {
            store,
            namespace: Self::DEFAULT_NAMESPACE.to_string(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn key(&self, nonce: &HexEncodedNonce) -> String {
        format!("{}:{}", self.namespace, nonce.as_hex())
    }

    /// Whether the nonce has already been used.
    pub async fn has_nonce(&self, nonce: &HexEncodedNonce) -> Result<bool, NonceStoreError> {
        self.store.contains(&self.key(nonce)).await
    }

    /// Atomically marks the nonce used for `ttl_seconds`.
    ///
    /// Returns `true` when this call was the first to mark it; exactly one of
    /// any set of concurrent callers observes `true`.
    pub async fn mark_used(
        &self,
        nonce: &HexEncodedNonce,
        ttl_seconds: u64,
    ) -> Result<bool, NonceStoreError> {
        self.store
            .put_if_absent(&self.key(nonce), Duration::from_secs(ttl_seconds))
            .await
    }

    /// Removes the nonce. For tests and cleanup tooling only; production code
    /// must let entries expire.
    pub async fn remove(&self, nonce: &HexEncodedNonce) -> Result<(), NonceStoreError> {
        self.store.remove(&self.key(nonce)).await
    }
}
