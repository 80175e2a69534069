//! Reservation guard
//!
//! Arbitrates leases on handles: `validate` claims, `confirm` attaches the
//! on-chain transaction, `release` gives the claim up, and `status` reports
//! the combined view of the authority and the lease store.

use crate::authority::OwnershipAuthority;
use crate::config::GuardConfig;
use crate::errors::*;
use crate::handle::Handle;
use crate::lease_store::LeaseStore;
use crate::types::*;
use crate::unix_now;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Entry point for every client-facing reservation operation.
///
/// Cheap to clone; all state lives in the shared lease store.
#[derive(Clone)]
pub struct ReservationGuard {
    store: Arc<dyn LeaseStore>,
    authority: Arc<dyn OwnershipAuthority>,
    config: GuardConfig,
}

impl ReservationGuard {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        authority: Arc<dyn OwnershipAuthority>,
        config: GuardConfig,
    ) -> Self {
        Self {
            store,
            authority,
            config,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Claim a handle for `owner`.
    ///
    /// Repeating the call with the same owner and idempotency key while the
    /// lease is live returns the original reservation with its remaining
    /// lease; any other claimant gets [`ReservationError::AlreadyReserved`].
    pub async fn validate(&self, request: ValidateRequest) -> Result<Validated> {
        let result = self.try_validate(request).await;
        record_outcome("handle_reservation_validate_total", &result);
        result
    }

    async fn try_validate(&self, request: ValidateRequest) -> Result<Validated> {
        let handle = Handle::parse(&request.handle)?;
        if handle.is_reserved() {
            return Err(ReservationError::SystemReserved { handle });
        }

        if let Some(ownership) = self.authority.lookup(&handle).await? {
            debug!(handle = %handle, owner = %ownership.owner, "handle already registered");
            return Err(ReservationError::AlreadyTaken { handle, ownership });
        }

        let ttl = self.config.reservation_ttl(request.ttl_secs);
        let idempotency_key = request
            .idempotency_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let reservation = Reservation::new(
            handle.clone(),
            request.owner.as_str(),
            request.external_name,
            idempotency_key.as_str(),
            unix_now(),
        );
        let key = handle.storage_key();
        let payload = encode(&key, &reservation)?;

        if self
            .store
            .create_if_absent(&key, &payload, Duration::from_secs(ttl))
            .await?
        {
            info!(handle = %handle, ttl_secs = ttl, "handle reserved");
            return Ok(Validated {
                handle,
                state: ReservationState::Reserved,
                expires_in_sec: ttl,
                idempotency_key,
            });
        }

        // Someone holds the key; decide between replay and conflict.
        let existing = self.load(&key).await?;
        let remaining = self.store.remaining_ttl(&key).await?;
        let (Some(existing), Some(remaining)) = (existing, remaining) else {
            debug!(handle = %handle, "reservation vanished during validate");
            return Err(ReservationError::TransientConflict { handle });
        };

        if existing.is_owned_by(&request.owner) && existing.idempotency_key == idempotency_key {
            debug!(handle = %handle, remaining_secs = remaining, "idempotent validate replay");
            // The lease is left untouched; the caller is promised no more than it asked for.
            return Ok(Validated {
                handle,
                state: existing.state,
                expires_in_sec: remaining.min(ttl),
                idempotency_key,
            });
        }

        Err(ReservationError::AlreadyReserved {
            handle,
            expires_in_sec: remaining,
        })
    }

    /// Record the submitted transaction and extend the lease to cover
    /// on-chain settlement.
    pub async fn confirm(&self, request: ConfirmRequest) -> Result<Confirmed> {
        let result = self.try_confirm(request).await;
        record_outcome("handle_reservation_confirm_total", &result);
        result
    }

    async fn try_confirm(&self, request: ConfirmRequest) -> Result<Confirmed> {
        let handle = Handle::parse(&request.handle)?;
        let tx_hash = request.tx_hash.trim();
        if tx_hash.is_empty() {
            return Err(ReservationError::InvalidTxHash);
        }

        let key = handle.storage_key();
        let Some(mut reservation) = self.load(&key).await? else {
            return Err(ReservationError::NotFound { handle });
        };
        if !reservation.is_owned_by(&request.owner) {
            return Err(ReservationError::NotOwner { handle });
        }
        if reservation.state != ReservationState::Reserved {
            return Err(ReservationError::InvalidState {
                handle,
                state: reservation.state,
            });
        }

        reservation.tx_hash = Some(tx_hash.to_string());
        reservation.state = ReservationState::PendingOnchain;

        let ttl = self.config.confirm_ttl(request.extend_ttl_secs);
        let payload = encode(&key, &reservation)?;
        self.store
            .put(&key, &payload, Duration::from_secs(ttl))
            .await?;

        info!(handle = %handle, tx_hash, ttl_secs = ttl, "reservation pending on-chain");
        Ok(Confirmed {
            handle,
            state: ReservationState::PendingOnchain,
            expires_in_sec: ttl,
        })
    }

    /// Drop the caller's reservation; releasing an absent one is a no-op.
    pub async fn release(&self, handle: &str, owner: &str) -> Result<Released> {
        let result = self.try_release(handle, owner).await;
        record_outcome("handle_reservation_release_total", &result);
        result
    }

    async fn try_release(&self, handle: &str, owner: &str) -> Result<Released> {
        let handle = Handle::parse(handle)?;
        let key = handle.storage_key();

        let Some(reservation) = self.load(&key).await? else {
            return Ok(Released::new(handle, false));
        };
        if !reservation.is_owned_by(owner) {
            return Err(ReservationError::NotOwner { handle });
        }

        let removed = self.store.delete(&key).await?;
        info!(handle = %handle, "reservation released");
        Ok(Released::new(handle, removed))
    }

    /// Combined view of a handle: confirmed ownership wins over any lease.
    pub async fn status(&self, handle: &str) -> Result<HandleStatus> {
        let handle = Handle::parse(handle)?;

        if let Some(ownership) = self.authority.lookup(&handle).await? {
            return Ok(HandleStatus::Taken { ownership });
        }

        let key = handle.storage_key();
        let Some(reservation) = self.load(&key).await? else {
            return Ok(HandleStatus::Available);
        };
        let expires_in_sec = self.store.remaining_ttl(&key).await?;
        let view = reservation.view();

        Ok(match reservation.state {
            ReservationState::Reserved => HandleStatus::Reserved {
                expires_in_sec,
                reservation: view,
            },
            ReservationState::PendingOnchain => HandleStatus::PendingOnchain {
                expires_in_sec,
                reservation: view,
            },
        })
    }

    async fn load(&self, key: &str) -> Result<Option<Reservation>> {
        load_reservation(self.store.as_ref(), key).await
    }
}

pub(crate) async fn load_reservation(
    store: &dyn LeaseStore,
    key: &str,
) -> Result<Option<Reservation>> {
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| ReservationError::Codec {
            key: key.to_string(),
            source,
        })
}

fn encode(key: &str, reservation: &Reservation) -> Result<Vec<u8>> {
    serde_json::to_vec(reservation).map_err(|source| ReservationError::Codec {
        key: key.to_string(),
        source,
    })
}

fn record_outcome<T>(metric: &'static str, result: &Result<T>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(err) => err.kind(),
    };
    counter!(metric, "outcome" => outcome).increment(1);
}
