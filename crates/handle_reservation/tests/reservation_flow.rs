//! End-to-end reservation flows across the guard, the lease stores and the
//! reconciler.

use ippan_handle_reservation::sled_store::LEASE_TREE;
use ippan_handle_reservation::{
    ConfirmRequest, GuardConfig, Handle, HandleStatus, LeaseStore, MemoryLeaseStore, Ownership,
    Reconciler, ReconcilerConfig, Reservation, ReservationError, ReservationGuard,
    ReservationState, SledLeaseStore, StubAuthority, ValidateRequest,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const OWNER_A: &str = "0xAAAA000000000000000000000000000000000001";
const OWNER_B: &str = "0xBBBB000000000000000000000000000000000002";

fn guard_over(store: Arc<dyn LeaseStore>, authority: &StubAuthority) -> ReservationGuard {
    ReservationGuard::new(store, Arc::new(authority.clone()), GuardConfig::default())
}

fn validate_request(handle: &str, owner: &str, key: Option<String>) -> ValidateRequest {
    ValidateRequest {
        handle: handle.to_string(),
        external_name: "x.eth".to_string(),
        owner: owner.to_string(),
        ttl_secs: None,
        idempotency_key: key,
    }
}

/// Encoded `pending_onchain` record created `age_secs` ago.
fn pending_record(handle: &Handle, age_secs: u64) -> Vec<u8> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let mut reservation =
        Reservation::new(handle.clone(), OWNER_A, "x.eth", "key-1", now - age_secs);
    reservation.state = ReservationState::PendingOnchain;
    reservation.tx_hash = Some("0xdeadbeef".to_string());
    serde_json::to_vec(&reservation).unwrap()
}

#[tokio::test(start_paused = true)]
async fn reserve_replay_conflict_confirm_and_status() {
    let store = MemoryLeaseStore::new();
    let authority = StubAuthority::new();
    let guard = guard_over(Arc::new(store.clone()), &authority);

    // fresh claim
    let first = guard
        .validate(validate_request("myhandle", OWNER_A, None))
        .await
        .unwrap();
    assert_eq!(first.state, ReservationState::Reserved);
    assert_eq!(first.expires_in_sec, 300);
    assert!(!first.idempotency_key.is_empty());
    assert_eq!(store.len(), 1);

    // replay with the generated key
    tokio::time::advance(Duration::from_secs(5)).await;
    let replay = guard
        .validate(validate_request(
            "@MyHandle",
            OWNER_A,
            Some(first.idempotency_key.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(replay.handle, first.handle);
    assert_eq!(replay.idempotency_key, first.idempotency_key);
    assert!(replay.expires_in_sec <= 300);
    assert_eq!(store.len(), 1);

    // competing claimant
    let err = guard
        .validate(validate_request("myhandle", OWNER_B, None))
        .await
        .unwrap_err();
    match err {
        ReservationError::AlreadyReserved { expires_in_sec, .. } => {
            assert_eq!(expires_in_sec, 295)
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // confirm moves the entry to pending
    let confirmed = guard
        .confirm(ConfirmRequest {
            handle: "myhandle".to_string(),
            tx_hash: "0xdeadbeef".to_string(),
            owner: OWNER_A.to_string(),
            extend_ttl_secs: None,
        })
        .await
        .unwrap();
    assert_eq!(confirmed.state, ReservationState::PendingOnchain);
    assert_eq!(confirmed.expires_in_sec, 900);

    let status = guard.status("myhandle").await.unwrap();
    assert_eq!(status.label(), "pending_onchain");
    match status {
        HandleStatus::PendingOnchain {
            expires_in_sec,
            reservation,
        } => {
            assert_eq!(expires_in_sec, Some(900));
            assert_eq!(reservation.tx_hash.as_deref(), Some("0xdeadbeef"));
        }
        other => panic!("unexpected status: {other:?}"),
    }
}

#[tokio::test]
async fn taken_handles_are_never_reserved() {
    let store = MemoryLeaseStore::new();
    let authority = StubAuthority::new();
    authority.confirm(Ownership {
        handle: "taken".to_string(),
        owner: OWNER_B.to_string(),
        external_name: "taken.eth".to_string(),
    });
    let guard = guard_over(Arc::new(store.clone()), &authority);

    let err = guard
        .validate(validate_request("taken", OWNER_A, None))
        .await
        .unwrap_err();
    assert!(matches!(err, ReservationError::AlreadyTaken { .. }));
    assert_eq!(err.status_code(), 409);
    assert!(store.is_empty());
}

#[tokio::test]
async fn reconciler_drops_entries_past_max_age() {
    let store = MemoryLeaseStore::new();
    let authority = StubAuthority::new();

    let handle = Handle::parse("myhandle").unwrap();
    store
        .put(
            &handle.storage_key(),
            &pending_record(&handle, 3_700),
            Duration::from_secs(900),
        )
        .await
        .unwrap();

    let reconciler = Reconciler::new(
        Arc::new(store.clone()),
        Arc::new(authority.clone()),
        ReconcilerConfig::default(),
    );
    let report = reconciler.tick().await.unwrap().expect("tick ran");

    assert_eq!(report.stale, 1);
    assert_eq!(authority.lookup_count(), 1);
    assert!(store.get(&handle.storage_key()).await.unwrap().is_none());

    let guard = guard_over(Arc::new(store.clone()), &authority);
    assert_eq!(guard.status("myhandle").await.unwrap(), HandleStatus::Available);
}

#[tokio::test]
async fn corrupt_sled_envelope_does_not_stall_reconciliation() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path().join("leases")).unwrap();
    db.open_tree(LEASE_TREE)
        .unwrap()
        .insert("handle:reservation:aaa", &[1u8][..])
        .unwrap();
    let store = SledLeaseStore::from_db(db).unwrap();

    let handle = Handle::parse("settled").unwrap();
    store
        .put(
            &handle.storage_key(),
            &pending_record(&handle, 60),
            Duration::from_secs(900),
        )
        .await
        .unwrap();
    let authority = StubAuthority::new();
    authority.confirm(Ownership {
        handle: "settled".to_string(),
        owner: OWNER_A.to_string(),
        external_name: "x.eth".to_string(),
    });

    let reconciler = Reconciler::new(
        Arc::new(store.clone()),
        Arc::new(authority),
        ReconcilerConfig::default(),
    );
    let report = reconciler.run_once().await.unwrap();

    assert_eq!(report.confirmed, 1);
    assert!(store.get(&handle.storage_key()).await.unwrap().is_none());
}

async fn race_for_handle(store: Arc<dyn LeaseStore>) {
    let authority = StubAuthority::new();
    let guard = guard_over(store, &authority);

    let contenders = 16;
    let mut tasks = Vec::with_capacity(contenders);
    for i in 0..contenders {
        let guard = guard.clone();
        tasks.push(tokio::spawn(async move {
            guard
                .validate(validate_request("contested", &format!("0xowner{i:02}"), None))
                .await
        }));
    }

    let mut winners = 0;
    let mut reserved = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(ReservationError::AlreadyReserved { .. }) => reserved += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(reserved, contenders - 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_one_winner_in_memory() {
    race_for_handle(Arc::new(MemoryLeaseStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_one_winner_in_sled() {
    let dir = tempfile::tempdir().unwrap();
    let store = SledLeaseStore::open(dir.path().join("leases")).unwrap();
    race_for_handle(Arc::new(store)).await;
}
