//! Error types for handle reservations

use crate::authority::AuthorityError;
use crate::handle::{Handle, HandleValidationError};
use crate::lease_store::LeaseStoreError;
use crate::types::{Ownership, ReservationState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReservationError {
    #[error("Invalid handle: {0}")]
    InvalidHandle(#[from] HandleValidationError),

    #[error("Handle is reserved by the system: {handle}")]
    SystemReserved { handle: Handle },

    #[error("Handle already taken on-chain: {handle}")]
    AlreadyTaken { handle: Handle, ownership: Ownership },

    #[error("Handle already reserved: {handle} (lease expires in {expires_in_sec}s)")]
    AlreadyReserved { handle: Handle, expires_in_sec: u64 },

    #[error("Reservation for {handle} changed concurrently, retry the request")]
    TransientConflict { handle: Handle },

    #[error("Reservation not found: {handle}")]
    NotFound { handle: Handle },

    #[error("Unauthorized: caller does not own the reservation for {handle}")]
    NotOwner { handle: Handle },

    #[error("Transaction hash must not be empty")]
    InvalidTxHash,

    #[error("Reservation for {handle} is {}, expected reserved", .state.as_str())]
    InvalidState {
        handle: Handle,
        state: ReservationState,
    },

    #[error("Ownership authority error: {0}")]
    Authority(#[from] AuthorityError),

    #[error("Lease store error: {0}")]
    Store(#[from] LeaseStoreError),

    #[error("Reservation record {key} could not be encoded or decoded: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ReservationError {
    /// HTTP-equivalent status code for transports that map outcomes 1:1.
    pub fn status_code(&self) -> u16 {
        match self {
            ReservationError::InvalidHandle(_) | ReservationError::InvalidTxHash => 400,
            ReservationError::NotOwner { .. } => 403,
            ReservationError::NotFound { .. } => 404,
            ReservationError::AlreadyTaken { .. }
            | ReservationError::AlreadyReserved { .. }
            | ReservationError::TransientConflict { .. }
            | ReservationError::InvalidState { .. } => 409,
            ReservationError::SystemReserved { .. } => 422,
            ReservationError::Authority(_) => 502,
            ReservationError::Store(_) | ReservationError::Codec { .. } => 500,
        }
    }

    /// Short machine-readable name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ReservationError::InvalidHandle(_) => "invalid_handle",
            ReservationError::SystemReserved { .. } => "system_reserved",
            ReservationError::AlreadyTaken { .. } => "already_taken",
            ReservationError::AlreadyReserved { .. } => "already_reserved",
            ReservationError::TransientConflict { .. } => "transient_conflict",
            ReservationError::NotFound { .. } => "not_found",
            ReservationError::NotOwner { .. } => "not_owner",
            ReservationError::InvalidTxHash => "invalid_tx_hash",
            ReservationError::InvalidState { .. } => "invalid_state",
            ReservationError::Authority(_) => "authority_unavailable",
            ReservationError::Store(_) => "store_error",
            ReservationError::Codec { .. } => "corrupt_record",
        }
    }

    /// Seconds the caller should wait before retrying, when known.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ReservationError::AlreadyReserved { expires_in_sec, .. } => Some(*expires_in_sec),
            ReservationError::TransientConflict { .. } => Some(0),
            _ => None,
        }
    }

    /// Whether repeating the same call can succeed without changing the input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReservationError::AlreadyReserved { .. }
                | ReservationError::TransientConflict { .. }
                | ReservationError::Authority(_)
                | ReservationError::Store(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ReservationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_carries_retry_hint() {
        let handle = Handle::parse("alice").unwrap();
        let err = ReservationError::AlreadyReserved {
            handle,
            expires_in_sec: 42,
        };
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.retry_after_secs(), Some(42));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("42s"));
    }

    #[test]
    fn taken_is_final() {
        let handle = Handle::parse("alice").unwrap();
        let err = ReservationError::AlreadyTaken {
            handle,
            ownership: Ownership {
                handle: "alice".into(),
                owner: "0xabc".into(),
                external_name: "alice.eth".into(),
            },
        };
        assert_eq!(err.kind(), "already_taken");
        assert_eq!(err.retry_after_secs(), None);
        assert!(!err.is_retryable());
    }

    #[test]
    fn confirming_twice_is_a_conflict() {
        let err = ReservationError::InvalidState {
            handle: Handle::parse("alice").unwrap(),
            state: ReservationState::PendingOnchain,
        };
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.kind(), "invalid_state");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("pending_onchain"));
    }

    #[test]
    fn validation_errors_convert() {
        let err: ReservationError = HandleValidationError::TooShort { len: 2 }.into();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.kind(), "invalid_handle");
    }
}
