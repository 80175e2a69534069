//! Types for handle reservations

use crate::handle::Handle;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a stored reservation.
///
/// Only ever advances `Reserved -> PendingOnchain`; absence of the entry
/// means the handle is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Reserved,
    PendingOnchain,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Reserved => "reserved",
            ReservationState::PendingOnchain => "pending_onchain",
        }
    }
}

/// Off-chain claim on a handle, stored as JSON under the handle's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub handle: Handle,
    /// Claimant's chain address
    pub owner: String,
    /// Name the handle will be attached to once registered on-chain
    pub external_name: String,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub state: ReservationState,
    /// Creation time, seconds since UNIX_EPOCH
    pub created_at: u64,
}

impl Reservation {
    /// New reservation in the `reserved` state.
    pub fn new(
        handle: Handle,
        owner: impl Into<String>,
        external_name: impl Into<String>,
        idempotency_key: impl Into<String>,
        created_at: u64,
    ) -> Self {
        Self {
            handle,
            owner: owner.into().trim().to_string(),
            external_name: external_name.into(),
            idempotency_key: idempotency_key.into(),
            tx_hash: None,
            state: ReservationState::Reserved,
            created_at,
        }
    }

    /// Chain addresses are compared without regard to ASCII case, so checksummed
    /// and lowercase spellings of the same address match.
    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner.eq_ignore_ascii_case(owner.trim())
    }

    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }

    /// Whether the reconciler should check this entry against the authority.
    pub fn awaits_settlement(&self) -> bool {
        self.state == ReservationState::PendingOnchain
            && self
                .tx_hash
                .as_deref()
                .is_some_and(|hash| !hash.trim().is_empty())
    }

    pub fn view(&self) -> ReservationView {
        ReservationView {
            handle: self.handle.clone(),
            external_name: self.external_name.clone(),
            idempotency_key: self.idempotency_key.clone(),
            tx_hash: self.tx_hash.clone(),
            state: self.state,
            created_at: self.created_at,
        }
    }
}

/// Public projection of a [`Reservation`]; the owner address is withheld.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationView {
    pub handle: Handle,
    pub external_name: String,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub state: ReservationState,
    pub created_at: u64,
}

/// Confirmed ownership as reported by the external authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub handle: String,
    pub owner: String,
    #[serde(alias = "externalName")]
    pub external_name: String,
}

/// Request to place a reservation on a handle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateRequest {
    /// Raw handle as typed by the user
    pub handle: String,
    pub external_name: String,
    pub owner: String,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Successful `validate`: the caller holds the lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validated {
    pub handle: Handle,
    pub state: ReservationState,
    pub expires_in_sec: u64,
    pub idempotency_key: String,
}

/// Request to attach a submitted transaction to a reservation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub handle: String,
    pub tx_hash: String,
    pub owner: String,
    #[serde(default)]
    pub extend_ttl_secs: Option<u64>,
}

/// Successful `confirm`: the lease now covers on-chain settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Confirmed {
    pub handle: Handle,
    pub state: ReservationState,
    pub expires_in_sec: u64,
}

/// Successful `release`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Released {
    pub handle: Handle,
    pub state: &'static str,
    /// False when there was nothing to release
    pub removed: bool,
}

impl Released {
    pub(crate) fn new(handle: Handle, removed: bool) -> Self {
        Self {
            handle,
            state: "released",
            removed,
        }
    }
}

/// Answer to a `status` query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HandleStatus {
    /// Neither confirmed externally nor reserved locally
    Available,
    Reserved {
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_in_sec: Option<u64>,
        reservation: ReservationView,
    },
    PendingOnchain {
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_in_sec: Option<u64>,
        reservation: ReservationView,
    },
    /// Confirmed by the external authority; always wins over local leases
    Taken { ownership: Ownership },
}

impl HandleStatus {
    pub fn label(&self) -> &'static str {
        match self {
            HandleStatus::Available => "available",
            HandleStatus::Reserved { .. } => "reserved",
            HandleStatus::PendingOnchain { .. } => "pending_onchain",
            HandleStatus::Taken { .. } => "taken",
        }
    }
}
