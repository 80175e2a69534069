//! Handle reservations for human-readable identifiers
//!
//! A handle such as `@alice` is first claimed through a short off-chain lease
//! and later becomes authoritative once an on-chain registration is indexed.
//! The [`ReservationGuard`] arbitrates leases in a shared [`LeaseStore`], while
//! the [`Reconciler`] periodically converges pending leases with the
//! [`OwnershipAuthority`] that reports confirmed ownership.

pub mod authority;
pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod guard;
pub mod handle;
pub mod indexer;
pub mod lease_store;
pub mod reconciler;
pub mod sled_store;
pub mod types;

pub use authority::{OwnershipAuthority, StubAuthority};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState};
pub use config::{ConfigError, GuardConfig, IndexerConfig, ReconcilerConfig};
pub use errors::*;
pub use guard::ReservationGuard;
pub use handle::{Handle, HandleCheck, HandleValidationError};
pub use indexer::IndexerClient;
pub use lease_store::{LeaseStore, MemoryLeaseStore};
pub use reconciler::{ReconcileAction, ReconcileReport, Reconciler, ReconcilerHandle};
pub use sled_store::SledLeaseStore;
pub use types::*;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in whole seconds since the UNIX epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
