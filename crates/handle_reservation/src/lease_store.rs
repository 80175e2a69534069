//! Lease store abstraction
//!
//! The guard and the reconciler share nothing but a key-value store with
//! per-key leases. Mutual exclusion relies solely on [`LeaseStore::create_if_absent`]
//! being atomic; every other operation touches a single key.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Longest lease a store will hold (30 days); longer requests are clamped.
pub const MAX_LEASE_SECS: u64 = 30 * 24 * 60 * 60;

pub(crate) fn clamp_lease(ttl: Duration) -> Duration {
    ttl.min(Duration::from_secs(MAX_LEASE_SECS))
}

/// Errors raised by a lease store backend.
#[derive(Debug, Error)]
pub enum LeaseStoreError {
    #[error("lease store backend error: {0}")]
    Backend(String),

    #[error("lease store encoding error: {0}")]
    Encoding(String),
}

impl From<sled::Error> for LeaseStoreError {
    fn from(value: sled::Error) -> Self {
        Self::Backend(value.to_string())
    }
}

impl From<bincode::Error> for LeaseStoreError {
    fn from(value: bincode::Error) -> Self {
        Self::Encoding(value.to_string())
    }
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create `key` with a lease of `ttl` only if no live entry exists.
    ///
    /// Returns `false` without touching the existing entry otherwise.
    async fn create_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, LeaseStoreError>;

    /// Overwrite `key` and replace its lease.
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), LeaseStoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LeaseStoreError>;

    /// Remove `key`; returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, LeaseStoreError>;

    /// Replace the lease of a live entry; returns `false` if there is none.
    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<bool, LeaseStoreError>;

    /// Remaining lease in whole seconds, rounded up; `None` if absent.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<u64>, LeaseStoreError>;

    /// Live keys starting with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, LeaseStoreError>;
}

/// Round a remaining lease up to whole seconds so a live entry never reports 0.
pub(crate) fn ceil_secs(remaining: Duration) -> u64 {
    let secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[derive(Debug, Clone)]
struct LeasedEntry {
    value: Vec<u8>,
    deadline: Instant,
}

impl LeasedEntry {
    fn new(value: &[u8], ttl: Duration) -> Self {
        Self {
            value: value.to_vec(),
            deadline: Instant::now() + clamp_lease(ttl),
        }
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        let remaining = self.deadline.saturating_duration_since(now);
        (!remaining.is_zero()).then_some(remaining)
    }
}

/// In-process lease store.
///
/// Deadlines use the tokio clock, so tests can drive expiry with paused time.
#[derive(Debug, Clone, Default)]
pub struct MemoryLeaseStore {
    entries: Arc<Mutex<HashMap<String, LeasedEntry>>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.remaining(now).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.remaining(now).is_some());
        before - entries.len()
    }

    fn live_entry<'a>(
        entries: &'a mut HashMap<String, LeasedEntry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut LeasedEntry> {
        let expired = entries
            .get(key)
            .is_some_and(|entry| entry.remaining(now).is_none());
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get_mut(key)
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn create_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, LeaseStoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if Self::live_entry(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), LeasedEntry::new(value, ttl));
        Ok(true)
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), LeaseStoreError> {
        self.entries
            .lock()
            .insert(key.to_string(), LeasedEntry::new(value, ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LeaseStoreError> {
        let mut entries = self.entries.lock();
        Ok(Self::live_entry(&mut entries, key, Instant::now()).map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, LeaseStoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .is_some_and(|entry| entry.remaining(now).is_some()))
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<bool, LeaseStoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key, now) {
            Some(entry) => {
                entry.deadline = now + clamp_lease(ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<u64>, LeaseStoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(Self::live_entry(&mut entries, key, now)
            .and_then(|entry| entry.remaining(now))
            .map(ceil_secs))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, LeaseStoreError> {
        let now = Instant::now();
        let entries = self.entries.lock();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.remaining(now).is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
