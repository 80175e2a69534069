use crate::handle::Handle;
use crate::types::Ownership;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while querying the ownership authority.
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("authority transport error: {0}")]
    Transport(String),

    #[error("authority lookup timed out")]
    Timeout,

    #[error("authority returned unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("authority response could not be decoded: {0}")]
    Decode(String),

    #[error("authority circuit is open, lookups suspended")]
    CircuitOpen,

    #[error("authority unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for AuthorityError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Self::Timeout
        } else if value.is_decode() {
            Self::Decode(value.to_string())
        } else {
            Self::Transport(value.to_string())
        }
    }
}

/// Source of truth for confirmed handle ownership.
///
/// Eventually consistent: a handle registered on-chain may take a while to
/// show up here.
#[async_trait]
pub trait OwnershipAuthority: Send + Sync {
    async fn lookup(&self, handle: &Handle) -> Result<Option<Ownership>, AuthorityError>;
}

/// Stub implementation backed by an in-memory hashmap.
#[derive(Clone, Default)]
pub struct StubAuthority {
    records: Arc<RwLock<HashMap<String, Ownership>>>,
    offline: Arc<AtomicBool>,
    lookups: Arc<AtomicUsize>,
}

impl StubAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a confirmed registration.
    pub fn confirm(&self, ownership: Ownership) {
        let key = crate::handle::normalize(&ownership.handle);
        self.records.write().insert(key, ownership);
    }

    pub fn revoke(&self, handle: &str) -> Option<Ownership> {
        self.records.write().remove(&crate::handle::normalize(handle))
    }

    /// While offline every lookup fails with [`AuthorityError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of lookups served so far, failed ones included.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OwnershipAuthority for StubAuthority {
    async fn lookup(&self, handle: &Handle) -> Result<Option<Ownership>, AuthorityError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(AuthorityError::Unavailable(
                "stub authority is offline".to_string(),
            ));
        }
        Ok(self.records.read().get(handle.as_str()).cloned())
    }
}
