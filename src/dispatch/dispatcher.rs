//! Per-trip dispatcher: the expanding-radius state machine.
//!
//! ```text
//! INIT -> SEARCHING(r) -> WAITING(r) -> EXPAND -> SEARCHING(r + inc) ...
//!                                   \-> ACCEPTED | CANCELLED
//! past max radius      -> GRACE     -> ACCEPTED | CANCELLED | TIMEOUT
//! ```
//!
//! Each phase returns an explicit outcome; acceptance and cancellation are
//! observed through the trip-dispatch wake handle plus a store re-read, so
//! a concurrent accept never waits out a full notification window. Every
//! await in here is guarded by the trip-local cancellation token.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{DispatchContext, TripDispatch};
use crate::config::defaults::{
    GRACE_POLL_INTERVAL_SECS, RADIUS_EXPAND_PAUSE_MS, RADIUS_QUERY_LIMIT,
};
use crate::error::DispatchError;
use crate::fsm;
use crate::notify::NotifyPort;
use crate::protocol::{CaptainEvent, HideRideReason, PassengerEvent, RideOffer};
use crate::queue::QueuePort;
use crate::store::{StoreError, TripStore};
use crate::types::{GeoPoint, TripStatus};

/// Terminal disposition of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A captain owns the trip; everyone else got `hideRide(ride_taken)`.
    Accepted { driver_id: String },
    /// No captain accepted; the trip was moved to `notApprove`.
    NotApproved,
    /// External cancellation ended the search.
    Cancelled,
    /// The trip itself was unusable (bad origin); moved to `failed`.
    Failed,
    /// Shutdown drain: lease released, trip left `requested`.
    Drained,
    /// Unhandled internal error; counted by the circuit breaker.
    Error,
}

/// What a waiting phase resolved to.
enum PhaseWait {
    Accepted(String),
    StatusCancelled,
    ExternalCancel,
    Expired,
}

pub struct Dispatcher {
    trip_id: String,
    ctx: Arc<DispatchContext>,
    entry: Arc<TripDispatch>,
}

impl Dispatcher {
    pub fn new(trip_id: &str, ctx: Arc<DispatchContext>, entry: Arc<TripDispatch>) -> Self {
        Self { trip_id: trip_id.to_owned(), ctx, entry }
    }

    /// Drive the trip to a terminal disposition. Never panics the task:
    /// internal errors best-effort fail the trip and report `Error`.
    pub async fn run(self) -> DispatchOutcome {
        match self.dispatch().await {
            Ok(outcome) => {
                info!(trip_id = %self.trip_id, outcome = ?outcome, "Dispatch finished");
                outcome
            }
            Err(err) => {
                warn!(trip_id = %self.trip_id, error = %err, "Dispatch aborted on internal error");
                self.fail_trip("dispatch could not be processed").await;
                DispatchOutcome::Error
            }
        }
    }

    async fn dispatch(&self) -> Result<DispatchOutcome, DispatchError> {
        let settings = self.ctx.settings.current();
        let trip = self
            .ctx
            .trips
            .by_id(&self.trip_id)?
            .ok_or(DispatchError::Store(StoreError::NotFound))?;

        let Some(origin) = trip.origin() else {
            warn!(trip_id = %self.trip_id, "Trip origin has invalid coordinates");
            self.fail_trip("pickup coordinates are invalid").await;
            return Ok(DispatchOutcome::Failed);
        };
        let offer = RideOffer::from_trip(&trip);

        let deadline = Instant::now() + Duration::from_secs(settings.max_dispatch_time_sec);
        let notification_window = Duration::from_secs(settings.notification_timeout_sec);
        let mut radius = settings.initial_radius_km;

        info!(
            trip_id = %self.trip_id,
            initial_radius_km = radius,
            max_radius_km = settings.max_radius_km,
            fare = trip.fare.amount,
            "Dispatch started"
        );

        loop {
            if self.entry.cancel.is_cancelled() {
                return Ok(self.on_external_cancel().await);
            }

            // SEARCHING(r)
            let newly_notified = self.search_radius(&offer, origin, radius).await;
            debug!(
                trip_id = %self.trip_id,
                radius_km = radius,
                newly_notified = newly_notified,
                "Search pass complete"
            );

            // WAITING(r) — skipped when this pass notified nobody new.
            if newly_notified > 0 {
                match self.wait_for_resolution(notification_window, deadline).await? {
                    PhaseWait::Accepted(driver_id) => {
                        return Ok(self.on_accepted(&driver_id).await);
                    }
                    PhaseWait::StatusCancelled => return Ok(self.on_cancelled().await),
                    PhaseWait::ExternalCancel => return Ok(self.on_external_cancel().await),
                    PhaseWait::Expired => {}
                }
            }

            // EXPAND: hide from the current ring only; the global set keeps
            // them out of later passes.
            self.hide_current_radius(HideRideReason::Expanding).await;
            radius += settings.radius_increment_km;
            if radius > settings.max_radius_km + f64::EPSILON {
                break;
            }
            if Instant::now() >= deadline {
                return Ok(self.on_timeout(HideRideReason::DispatchTimeout).await?);
            }
            // Backpressure between rings.
            match self
                .wait_for_resolution(Duration::from_millis(RADIUS_EXPAND_PAUSE_MS), deadline)
                .await?
            {
                PhaseWait::Accepted(driver_id) => return Ok(self.on_accepted(&driver_id).await),
                PhaseWait::StatusCancelled => return Ok(self.on_cancelled().await),
                PhaseWait::ExternalCancel => return Ok(self.on_external_cancel().await),
                PhaseWait::Expired => {}
            }
        }

        // GRACE: the search is exhausted, poll for a late acceptance.
        let grace = Duration::from_secs(settings.grace_after_max_radius_sec);
        let grace_end = Instant::now() + grace;
        info!(trip_id = %self.trip_id, grace_secs = grace.as_secs(), "Max radius reached, entering grace period");
        loop {
            if Instant::now() >= grace_end {
                return Ok(self.on_timeout(HideRideReason::MaxRadiusReached).await?);
            }
            if Instant::now() >= deadline {
                return Ok(self.on_timeout(HideRideReason::DispatchTimeout).await?);
            }
            let poll = Duration::from_secs(GRACE_POLL_INTERVAL_SECS)
                .min(grace_end.saturating_duration_since(Instant::now()));
            match self.wait_for_resolution(poll, deadline).await? {
                PhaseWait::Accepted(driver_id) => return Ok(self.on_accepted(&driver_id).await),
                PhaseWait::StatusCancelled => return Ok(self.on_cancelled().await),
                PhaseWait::ExternalCancel => return Ok(self.on_external_cancel().await),
                PhaseWait::Expired => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------

    /// Notify every fresh, online, eligible captain inside `radius_km`.
    /// Returns how many were newly notified (sent or queued).
    async fn search_radius(&self, offer: &RideOffer, origin: GeoPoint, radius_km: f64) -> usize {
        let candidates = self.ctx.location.radius(origin, radius_km, RADIUS_QUERY_LIMIT);
        let mut notified = 0;
        for (captain_id, distance_km) in candidates {
            if self.entry.was_notified(&captain_id) {
                continue;
            }
            if !self.ctx.presence.is_captain_online(&captain_id).await {
                continue;
            }
            if let Err(err) = self.ctx.eligibility.check(&captain_id) {
                debug!(
                    trip_id = %self.trip_id,
                    captain_id = %captain_id,
                    reason = %err,
                    "Candidate skipped"
                );
                continue;
            }
            let outcome = self.ctx.queue.send_ride(&captain_id, offer.clone()).await;
            match outcome {
                crate::queue::SendOutcome::Dropped => {
                    debug!(trip_id = %self.trip_id, captain_id = %captain_id, "Offer dropped at send");
                }
                outcome => {
                    self.entry.lock_tracking().record(&captain_id);
                    notified += 1;
                    debug!(
                        trip_id = %self.trip_id,
                        captain_id = %captain_id,
                        distance_km = distance_km,
                        outcome = ?outcome,
                        "Captain notified"
                    );
                }
            }
        }
        notified
    }

    /// Wait up to `window` (bounded by the dispatch deadline) for the trip
    /// to resolve, reacting to wake pings and external cancellation.
    async fn wait_for_resolution(
        &self,
        window: Duration,
        deadline: Instant,
    ) -> Result<PhaseWait, DispatchError> {
        let end = (Instant::now() + window).min(deadline);
        loop {
            if let Some(resolution) = self.check_status()? {
                return Ok(resolution);
            }
            let now = Instant::now();
            if now >= end {
                return Ok(PhaseWait::Expired);
            }
            tokio::select! {
                () = self.entry.cancel.cancelled() => return Ok(PhaseWait::ExternalCancel),
                () = self.entry.wake.notified() => {}
                () = tokio::time::sleep(end - now) => {
                    // Final re-read before declaring the window over.
                    if let Some(resolution) = self.check_status()? {
                        return Ok(resolution);
                    }
                    return Ok(PhaseWait::Expired);
                }
            }
        }
    }

    /// Non-`requested` statuses resolve the wait.
    fn check_status(&self) -> Result<Option<PhaseWait>, DispatchError> {
        let Some(trip) = self.ctx.trips.by_id(&self.trip_id)? else {
            return Ok(Some(PhaseWait::StatusCancelled));
        };
        Ok(match trip.status {
            TripStatus::Requested => None,
            TripStatus::Cancelled => Some(PhaseWait::StatusCancelled),
            _ => trip.driver_id.map(PhaseWait::Accepted).or(Some(PhaseWait::StatusCancelled)),
        })
    }

    // ------------------------------------------------------------------
    // Terminal dispositions
    // ------------------------------------------------------------------

    async fn on_accepted(&self, driver_id: &str) -> DispatchOutcome {
        let others = self.entry.lock_tracking().all_notified_except(driver_id);
        self.hide_from(&others, HideRideReason::RideTaken).await;
        info!(
            trip_id = %self.trip_id,
            driver_id = %driver_id,
            hidden_from = others.len(),
            "Trip accepted"
        );
        DispatchOutcome::Accepted { driver_id: driver_id.to_owned() }
    }

    async fn on_cancelled(&self) -> DispatchOutcome {
        let notified = self.entry.lock_tracking().all_notified();
        self.hide_from(&notified, HideRideReason::Cancelled).await;
        DispatchOutcome::Cancelled
    }

    async fn on_external_cancel(&self) -> DispatchOutcome {
        if self.ctx.shutdown.is_cancelled() {
            // Drain: put the lease back and clear captain screens.
            let release = fsm::release_dispatch();
            if let Err(err) = self.ctx.trips.cas_update(&self.trip_id, &release.pre, &release.patch)
            {
                debug!(trip_id = %self.trip_id, error = %err, "Lease release skipped");
            }
            let notified = self.entry.lock_tracking().all_notified();
            self.hide_from(&notified, HideRideReason::EmergencyStop).await;
            return DispatchOutcome::Drained;
        }
        self.on_cancelled().await
    }

    /// `reason` distinguishes the overall deadline from the exhausted-radius
    /// grace expiry.
    async fn on_timeout(&self, reason: HideRideReason) -> Result<DispatchOutcome, DispatchError> {
        let transition = fsm::not_approve();
        match self
            .ctx
            .trips
            .cas_update(&self.trip_id, &transition.pre, &transition.patch)
        {
            Ok(trip) => {
                let notified = self.entry.lock_tracking().all_notified();
                self.hide_from(&notified, reason).await;
                self.ctx
                    .notifier
                    .notify_passenger(
                        &trip.passenger_id,
                        PassengerEvent::RideNotApproved {
                            ride_id: self.trip_id.clone(),
                            message: "No captain is available right now".to_owned(),
                        },
                    )
                    .await;
                info!(trip_id = %self.trip_id, reason = ?reason, "Dispatch timed out");
                Ok(DispatchOutcome::NotApproved)
            }
            // Lost the race to a late acceptance or cancellation.
            Err(StoreError::CasConflict) => match self.check_status()? {
                Some(PhaseWait::Accepted(driver_id)) => Ok(self.on_accepted(&driver_id).await),
                _ => Ok(self.on_cancelled().await),
            },
            Err(err) => Err(err.into()),
        }
    }

    async fn fail_trip(&self, message: &str) {
        let transition = fsm::fail();
        let passenger_id = match self
            .ctx
            .trips
            .cas_update(&self.trip_id, &transition.pre, &transition.patch)
        {
            Ok(trip) => Some(trip.passenger_id),
            Err(err) => {
                debug!(trip_id = %self.trip_id, error = %err, "Fail transition skipped");
                None
            }
        };
        let notified = self.entry.lock_tracking().all_notified();
        self.hide_from(&notified, HideRideReason::DispatchError).await;
        if let Some(passenger_id) = passenger_id {
            self.ctx
                .notifier
                .notify_passenger(
                    &passenger_id,
                    PassengerEvent::RideError {
                        ride_id: Some(self.trip_id.clone()),
                        code: "dispatch_error".to_owned(),
                        message: message.to_owned(),
                    },
                )
                .await;
        }
    }

    async fn hide_current_radius(&self, reason: HideRideReason) {
        let ring = self.entry.lock_tracking().drain_current_radius();
        self.hide_from(&ring, reason).await;
    }

    async fn hide_from(&self, captains: &[String], reason: HideRideReason) {
        for captain_id in captains {
            self.ctx
                .notifier
                .notify_captain(captain_id, CaptainEvent::hide_ride(&self.trip_id, reason))
                .await;
        }
    }
}
