//! Dispatch supervisor: every `requested` trip gets exactly one dispatcher.
//!
//! An adaptive sweep (30 s when busy, backing off to 120 s when idle, with
//! jitter) lists requested trips outside the in-flight set and spawns a
//! dispatcher per trip, claiming the in-process lease *and* the persistent
//! `dispatching` flag before handoff. Intake and the cancellation path nudge
//! the supervisor through its wake channel so fresh work never waits out a
//! full sweep interval.
//!
//! Each sweep also restores orphaned leases: `requested` trips whose
//! `dispatching` flag is set but that no live dispatcher owns (a crash, or
//! a driver cancellation that re-pooled the trip with the flag pre-set) get
//! the flag cleared and are dispatched on the same pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{DispatchContext, DispatchOutcome, Dispatcher};
use crate::config::defaults::{SWEEP_MAX_SECS, SWEEP_MIN_SECS};
use crate::fsm;
use crate::notify::NotifyPort;
use crate::protocol::PassengerEvent;
use crate::store::TripStore;
use crate::types::Trip;

/// Wake-channel capacity; one queued nudge is enough to force a sweep.
const WAKE_BUFFER: usize = 8;

/// Cloneable nudge handle given to intake and the ride lifecycle.
#[derive(Clone)]
pub struct SupervisorHandle {
    wake_tx: mpsc::Sender<()>,
}

impl SupervisorHandle {
    /// Request an immediate sweep. Lossy: a full wake buffer means one is
    /// already on the way.
    pub fn nudge(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// A handle wired to nothing; nudges are no-ops. For tests and tools
    /// that construct services without a running supervisor.
    pub fn detached() -> Self {
        let (wake_tx, _) = mpsc::channel(1);
        Self { wake_tx }
    }
}

pub struct DispatchSupervisor {
    ctx: Arc<DispatchContext>,
    wake_rx: mpsc::Receiver<()>,
}

impl DispatchSupervisor {
    pub fn new(ctx: Arc<DispatchContext>) -> (Self, SupervisorHandle) {
        let (wake_tx, wake_rx) = mpsc::channel(WAKE_BUFFER);
        (Self { ctx, wake_rx }, SupervisorHandle { wake_tx })
    }

    /// Sweep until shutdown. The first sweep runs immediately so restarts
    /// restore dispatch without waiting an interval.
    pub async fn run(mut self) {
        info!("Dispatch supervisor started");
        let mut interval_secs = SWEEP_MIN_SECS;
        loop {
            if self.ctx.circuit.is_open() {
                debug!("Dispatch circuit open, skipping sweep");
            } else {
                let spawned = self.sweep().await;
                interval_secs = if spawned > 0 {
                    SWEEP_MIN_SECS
                } else {
                    (interval_secs * 2).min(SWEEP_MAX_SECS)
                };
            }

            let jitter = rand::thread_rng().gen_range(0..=5);
            tokio::select! {
                () = self.ctx.shutdown.cancelled() => break,
                _ = self.wake_rx.recv() => {
                    interval_secs = SWEEP_MIN_SECS;
                }
                () = tokio::time::sleep(Duration::from_secs(interval_secs + jitter)) => {}
            }
        }
        info!("Dispatch supervisor stopped");
    }

    /// One pass: restore orphans, expire overdue trips, spawn dispatchers.
    /// Returns how many dispatchers were spawned.
    pub async fn sweep(&self) -> usize {
        self.restore_orphaned_leases();

        let excluding = self.ctx.inflight.in_flight_ids();
        let requested = match self.ctx.trips.list_requested(&excluding) {
            Ok(trips) => trips,
            Err(err) => {
                warn!(error = %err, "Sweep could not list requested trips");
                return 0;
            }
        };

        let deadline_secs = self.ctx.settings.current().dispatch_deadline_secs();
        let mut spawned = 0;
        for trip in requested {
            let age_secs = (Utc::now() - trip.created_at).num_seconds().max(0) as u64;
            if age_secs > deadline_secs {
                self.expire_overdue(&trip, age_secs).await;
                continue;
            }
            if self.spawn_dispatcher(&trip) {
                spawned += 1;
            }
        }
        if spawned > 0 {
            info!(spawned = spawned, in_flight = self.ctx.inflight.len(), "Sweep spawned dispatchers");
        }
        spawned
    }

    /// Clear `dispatching` on requested trips no live dispatcher owns.
    fn restore_orphaned_leases(&self) {
        let excluding = self.ctx.inflight.in_flight_ids();
        let orphans = match self.ctx.trips.list_dispatching(&excluding) {
            Ok(trips) => trips,
            Err(err) => {
                warn!(error = %err, "Sweep could not list orphaned leases");
                return;
            }
        };
        for trip in orphans {
            let release = fsm::release_dispatch();
            match self.ctx.trips.cas_update(&trip.id, &release.pre, &release.patch) {
                Ok(_) => warn!(trip_id = %trip.id, "Orphaned dispatch lease restored"),
                Err(err) => debug!(trip_id = %trip.id, error = %err, "Lease restore skipped"),
            }
        }
    }

    /// A trip past `maxDispatchTime + grace` is rejected outright.
    async fn expire_overdue(&self, trip: &Trip, age_secs: u64) {
        let transition = fsm::not_approve();
        match self.ctx.trips.cas_update(&trip.id, &transition.pre, &transition.patch) {
            Ok(updated) => {
                warn!(trip_id = %trip.id, age_secs = age_secs, "Overdue trip rejected");
                self.ctx
                    .notifier
                    .notify_passenger(
                        &updated.passenger_id,
                        PassengerEvent::RideNotApproved {
                            ride_id: trip.id.clone(),
                            message: "No captain is available right now".to_owned(),
                        },
                    )
                    .await;
            }
            Err(err) => debug!(trip_id = %trip.id, error = %err, "Overdue rejection skipped"),
        }
    }

    /// Claim the trip (in-process lease, then the persistent flag) and spawn
    /// its dispatcher task. Returns whether a dispatcher started.
    fn spawn_dispatcher(&self, trip: &Trip) -> bool {
        let Some(entry) = self
            .ctx
            .inflight
            .claim(&trip.id, self.ctx.shutdown.child_token())
        else {
            return false;
        };

        let claim = fsm::claim_for_dispatch();
        if let Err(err) = self.ctx.trips.cas_update(&trip.id, &claim.pre, &claim.patch) {
            // Someone advanced the trip between listing and claiming.
            debug!(trip_id = %trip.id, error = %err, "Dispatch claim lost");
            self.ctx.inflight.release(&trip.id);
            return false;
        }

        let ctx = self.ctx.clone();
        let trip_id = trip.id.clone();
        tokio::spawn(async move {
            let outcome = Dispatcher::new(&trip_id, ctx.clone(), entry).run().await;
            match outcome {
                DispatchOutcome::Error => {
                    ctx.circuit.record_failure();
                }
                _ => ctx.circuit.record_success(),
            }
            ctx.inflight.release(&trip_id);
        });
        true
    }
}
