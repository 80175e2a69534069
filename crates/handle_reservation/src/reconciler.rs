//! Background reconciliation of pending reservations
//!
//! Each pass scans the reservation namespace and, for every entry waiting on
//! an on-chain registration, asks the authority whether the handle is now
//! confirmed. Confirmed or stale entries are deleted; long-pending ones get
//! their lease cut to a short grace window. Authority outages never delete an
//! entry before `error_max_age_secs`.

use crate::authority::OwnershipAuthority;
use crate::config::ReconcilerConfig;
use crate::errors::*;
use crate::guard::load_reservation;
use crate::handle::RESERVATION_KEY_PREFIX;
use crate::lease_store::LeaseStore;
use crate::unix_now;
use futures::stream::{self, StreamExt};
use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What a pass did with a single pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    /// Authority confirmed the handle; the lease was deleted
    Confirmed,
    /// Unconfirmed past the maximum age; deleted
    Stale,
    /// Unconfirmed past the mid threshold; lease cut to the grace window
    Shortened,
    /// Authority unreachable for too long; deleted
    AbandonedAfterErrors,
    Untouched,
}

impl ReconcileAction {
    fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::Confirmed => "confirmed",
            ReconcileAction::Stale => "stale",
            ReconcileAction::Shortened => "shortened",
            ReconcileAction::AbandonedAfterErrors => "abandoned_after_errors",
            ReconcileAction::Untouched => "untouched",
        }
    }
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Keys found in the reservation namespace
    pub scanned: usize,
    /// Entries pending on-chain with a transaction hash
    pub candidates: usize,
    pub confirmed: usize,
    pub stale: usize,
    pub shortened: usize,
    pub abandoned_after_errors: usize,
    pub untouched: usize,
    /// Entries whose processing failed; retried next pass
    pub failed: usize,
}

impl ReconcileReport {
    fn record(&mut self, action: ReconcileAction) {
        self.candidates += 1;
        match action {
            ReconcileAction::Confirmed => self.confirmed += 1,
            ReconcileAction::Stale => self.stale += 1,
            ReconcileAction::Shortened => self.shortened += 1,
            ReconcileAction::AbandonedAfterErrors => self.abandoned_after_errors += 1,
            ReconcileAction::Untouched => self.untouched += 1,
        }
    }

    /// Entries removed from the store during the pass.
    pub fn deleted(&self) -> usize {
        self.confirmed + self.stale + self.abandoned_after_errors
    }
}

/// Converges pending reservations with the ownership authority.
pub struct Reconciler {
    store: Arc<dyn LeaseStore>,
    authority: Arc<dyn OwnershipAuthority>,
    config: ReconcilerConfig,
    running: AtomicBool,
}

/// Clears the single-flight flag when a pass ends, even by panic.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        authority: Arc<dyn OwnershipAuthority>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            authority,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run a pass unless one is already in flight.
    ///
    /// Returns `Ok(None)` when the tick was skipped.
    pub async fn tick(&self) -> Result<Option<ReconcileReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("reconciliation still running, skipping tick");
            counter!("handle_reconciler_runs_total", "result" => "skipped").increment(1);
            return Ok(None);
        }
        let _flight = FlightGuard(&self.running);

        match self.run_once().await {
            Ok(report) => {
                counter!("handle_reconciler_runs_total", "result" => "completed").increment(1);
                Ok(Some(report))
            }
            Err(err) => {
                counter!("handle_reconciler_runs_total", "result" => "failed").increment(1);
                Err(err)
            }
        }
    }

    /// One full pass over the reservation namespace.
    ///
    /// Only a failed scan aborts the pass; per-entry failures are logged and
    /// counted in [`ReconcileReport::failed`].
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let keys = self.store.scan(RESERVATION_KEY_PREFIX).await?;
        let now = unix_now();
        let mut report = ReconcileReport {
            scanned: keys.len(),
            ..ReconcileReport::default()
        };

        let outcomes: Vec<(String, Result<Option<ReconcileAction>>)> = stream::iter(keys)
            .map(|key| async move {
                let outcome = self.reconcile_entry(&key, now).await;
                (key, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (key, outcome) in outcomes {
            match outcome {
                Ok(Some(action)) => {
                    counter!("handle_reconciler_actions_total", "action" => action.as_str())
                        .increment(1);
                    report.record(action);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to reconcile reservation");
                    report.failed += 1;
                }
            }
        }

        if report.deleted() > 0 || report.shortened > 0 || report.failed > 0 {
            info!(
                scanned = report.scanned,
                confirmed = report.confirmed,
                stale = report.stale,
                shortened = report.shortened,
                abandoned = report.abandoned_after_errors,
                failed = report.failed,
                "reconciliation pass finished"
            );
        } else {
            debug!(scanned = report.scanned, "reconciliation pass finished");
        }
        Ok(report)
    }

    /// `Ok(None)` means the entry is not waiting on the authority.
    async fn reconcile_entry(&self, key: &str, now: u64) -> Result<Option<ReconcileAction>> {
        let Some(reservation) = load_reservation(self.store.as_ref(), key).await? else {
            return Ok(None);
        };
        if !reservation.awaits_settlement() {
            return Ok(None);
        }

        let handle = &reservation.handle;
        let age = reservation.age_secs(now);

        let action = match self.authority.lookup(handle).await {
            Ok(Some(ownership)) => {
                if !reservation.is_owned_by(&ownership.owner) {
                    // The local claimant lost the race on-chain; their lease is
                    // dropped without notice.
                    warn!(
                        handle = %handle,
                        reserved_by = %reservation.owner,
                        confirmed_owner = %ownership.owner,
                        "handle confirmed for a different owner"
                    );
                }
                self.store.delete(key).await?;
                ReconcileAction::Confirmed
            }
            Ok(None) if age > self.config.max_age_secs => {
                self.store.delete(key).await?;
                ReconcileAction::Stale
            }
            Ok(None) if age > self.config.mid_age_secs => {
                let remaining = self.store.remaining_ttl(key).await?;
                match remaining {
                    Some(secs) if secs > self.config.grace_secs => {
                        if self.store.set_expiry(key, self.config.grace()).await? {
                            ReconcileAction::Shortened
                        } else {
                            ReconcileAction::Untouched
                        }
                    }
                    _ => ReconcileAction::Untouched,
                }
            }
            Ok(None) => ReconcileAction::Untouched,
            Err(err) if age > self.config.error_max_age_secs => {
                warn!(
                    handle = %handle,
                    age_secs = age,
                    error = %err,
                    "authority unreachable past error budget, dropping reservation"
                );
                self.store.delete(key).await?;
                ReconcileAction::AbandonedAfterErrors
            }
            Err(err) => {
                debug!(
                    handle = %handle,
                    age_secs = age,
                    error = %err,
                    "authority lookup failed, retrying next pass"
                );
                ReconcileAction::Untouched
            }
        };

        debug!(
            handle = %handle,
            age_secs = age,
            action = action.as_str(),
            "reconciled reservation"
        );
        Ok(Some(action))
    }

    /// Spawn the periodic driver.
    ///
    /// Every tick runs in its own task; while a pass is still in flight later
    /// ticks are skipped rather than queued.
    pub fn start(self: Arc<Self>) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = self.config.interval();

        let driver = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = period.as_secs(), "handle reconciler started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let reconciler = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(err) = reconciler.tick().await {
                                warn!(error = %err, "reconciliation pass failed");
                            }
                        });
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("handle reconciler stopped");
        });

        ReconcilerHandle {
            shutdown: shutdown_tx,
            driver,
        }
    }
}

/// Handle to a running reconciler driver.
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Stop scheduling new passes and wait for the driver to exit. A pass that
    /// is already running finishes in the background.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.driver.await {
            warn!(error = %err, "reconciler driver terminated abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }
}
