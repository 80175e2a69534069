//! Sled-backed lease store
//!
//! Every value is wrapped in an envelope carrying its wall-clock deadline, so
//! leases survive process restarts. Expired envelopes read as absent and are
//! swept lazily.

use crate::lease_store::{ceil_secs, clamp_lease, LeaseStore, LeaseStoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::{Db, IVec, Tree};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Tree holding every lease envelope.
pub const LEASE_TREE: &str = "handle_leases";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    expires_at_ms: u64,
    value: Vec<u8>,
}

impl Envelope {
    fn remaining(&self, now_ms: u64) -> Option<Duration> {
        (self.expires_at_ms > now_ms)
            .then(|| Duration::from_millis(self.expires_at_ms - now_ms))
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(millis)
        .unwrap_or(0)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn deadline_ms(ttl: Duration) -> u64 {
    now_ms().saturating_add(millis(clamp_lease(ttl)))
}

/// Persistent lease store on a single sled tree.
#[derive(Debug, Clone)]
pub struct SledLeaseStore {
    db: Db,
    leases: Tree,
}

impl SledLeaseStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LeaseStoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    pub fn from_db(db: Db) -> Result<Self, LeaseStoreError> {
        let leases = db.open_tree(LEASE_TREE)?;
        Ok(Self { db, leases })
    }

    pub fn flush(&self) -> Result<(), LeaseStoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Remove every expired envelope, returning how many were removed.
    pub fn purge_expired(&self) -> Result<usize, LeaseStoreError> {
        let now = now_ms();
        let mut removed = 0;
        for item in self.leases.iter() {
            let (key, raw) = item?;
            match decode(&raw) {
                Ok(envelope) if envelope.remaining(now).is_some() => continue,
                Ok(_) => {}
                Err(err) => {
                    // Kept for inspection until create_if_absent overwrites it.
                    warn!(
                        key = %String::from_utf8_lossy(&key),
                        error = %err,
                        "skipping undecodable lease envelope"
                    );
                    continue;
                }
            }
            // Only remove the exact envelope we inspected; a concurrent
            // writer may have renewed the key in the meantime.
            if self
                .leases
                .compare_and_swap(&key, Some(&raw), None as Option<IVec>)?
                .is_ok()
            {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "purged expired handle leases");
        }
        Ok(removed)
    }

    fn live(&self, key: &str, now: u64) -> Result<Option<(IVec, Envelope)>, LeaseStoreError> {
        let Some(raw) = self.leases.get(key.as_bytes())? else {
            return Ok(None);
        };
        let envelope = decode(&raw)?;
        if envelope.remaining(now).is_none() {
            return Ok(None);
        }
        Ok(Some((raw, envelope)))
    }
}

fn encode(value: &[u8], ttl: Duration) -> Result<Vec<u8>, LeaseStoreError> {
    let envelope = Envelope {
        expires_at_ms: deadline_ms(ttl),
        value: value.to_vec(),
    };
    Ok(bincode::serialize(&envelope)?)
}

fn decode(raw: &[u8]) -> Result<Envelope, LeaseStoreError> {
    Ok(bincode::deserialize(raw)?)
}

#[async_trait]
impl LeaseStore for SledLeaseStore {
    async fn create_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, LeaseStoreError> {
        let fresh = encode(value, ttl)?;
        loop {
            let current = self.leases.get(key.as_bytes())?;
            if let Some(raw) = &current {
                if decode(raw).is_ok_and(|envelope| envelope.remaining(now_ms()).is_some()) {
                    return Ok(false);
                }
            }
            // Expired and undecodable envelopes are swapped out like a missing key.
            match self
                .leases
                .compare_and_swap(key.as_bytes(), current, Some(fresh.clone()))?
            {
                Ok(()) => return Ok(true),
                Err(_) => continue,
            }
        }
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), LeaseStoreError> {
        self.leases.insert(key.as_bytes(), encode(value, ttl)?)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LeaseStoreError> {
        Ok(self
            .live(key, now_ms())?
            .map(|(_, envelope)| envelope.value))
    }

    async fn delete(&self, key: &str) -> Result<bool, LeaseStoreError> {
        let Some(raw) = self.leases.remove(key.as_bytes())? else {
            return Ok(false);
        };
        // An undecodable envelope is gone either way.
        Ok(decode(&raw).map_or(true, |envelope| envelope.remaining(now_ms()).is_some()))
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<bool, LeaseStoreError> {
        loop {
            let Some((raw, envelope)) = self.live(key, now_ms())? else {
                return Ok(false);
            };
            let renewed = encode(&envelope.value, ttl)?;
            match self
                .leases
                .compare_and_swap(key.as_bytes(), Some(raw), Some(renewed))?
            {
                Ok(()) => return Ok(true),
                Err(_) => continue,
            }
        }
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<u64>, LeaseStoreError> {
        let now = now_ms();
        Ok(self
            .live(key, now)?
            .and_then(|(_, envelope)| envelope.remaining(now))
            .map(ceil_secs))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, LeaseStoreError> {
        let now = now_ms();
        let mut keys = Vec::new();
        for item in self.leases.scan_prefix(prefix.as_bytes()) {
            let (key, raw) = item?;
            match decode(&raw) {
                Ok(envelope) if envelope.remaining(now).is_none() => continue,
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        key = %String::from_utf8_lossy(&key),
                        error = %err,
                        "skipping undecodable lease envelope"
                    );
                    continue;
                }
            }
            if let Ok(key) = String::from_utf8(key.to_vec()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}
