//! Ride lifecycle: captain and passenger events against the trip FSM.
//!
//! Every handler follows the same shape: read the trip, verify the caller
//! may act on it, run any payment interlock, commit the transition through
//! the store CAS, then emit the resulting events. A failed CAS is always
//! reported as `ride_not_available` — the caller raced another event and
//! lost, and no state was changed by this handler (acceptance rolls its
//! vault debit back).
//!
//! The service also maintains the in-process active-ride map
//! (captain -> passenger of their live trip) that location forwarding
//! uses; it is rebuilt from the trip store on startup.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::supervisor::SupervisorHandle;
use super::InflightRegistry;
use crate::error::DispatchError;
use crate::fsm;
use crate::notify::NotifyPort;
use crate::payment::{PaymentInterlock, Settlement};
use crate::protocol::{CaptainEvent, PassengerEvent, RideOffer};
use crate::queue::{QueuePort, RejectReason};
use crate::store::{captains::DriverInfo, CaptainDirectory, EligibilityService, StoreError, TripStore};
use crate::types::{CaptainId, Trip, TripStatus};

/// The captain's live trip, tracked for location forwarding.
#[derive(Debug, Clone)]
pub struct ActiveRide {
    pub trip_id: String,
    pub passenger_id: String,
}

pub struct RideLifecycle {
    trips: Arc<dyn TripStore>,
    queue: Arc<dyn QueuePort>,
    notifier: Arc<dyn NotifyPort>,
    payment: Arc<PaymentInterlock>,
    eligibility: Arc<EligibilityService>,
    directory: Arc<CaptainDirectory>,
    inflight: Arc<InflightRegistry>,
    supervisor: SupervisorHandle,
    active: std::sync::RwLock<HashMap<CaptainId, ActiveRide>>,
}

impl RideLifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trips: Arc<dyn TripStore>,
        queue: Arc<dyn QueuePort>,
        notifier: Arc<dyn NotifyPort>,
        payment: Arc<PaymentInterlock>,
        eligibility: Arc<EligibilityService>,
        directory: Arc<CaptainDirectory>,
        inflight: Arc<InflightRegistry>,
        supervisor: SupervisorHandle,
    ) -> Self {
        Self {
            trips,
            queue,
            notifier,
            payment,
            eligibility,
            directory,
            inflight,
            supervisor,
            active: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the active-ride map from persisted state after a restart.
    pub fn restore_active_rides(&self) -> Result<usize, StoreError> {
        let trips = self.trips.list_active()?;
        let mut active = self.lock_active();
        active.clear();
        for trip in &trips {
            if let Some(driver_id) = &trip.driver_id {
                active.insert(
                    driver_id.clone(),
                    ActiveRide {
                        trip_id: trip.id.clone(),
                        passenger_id: trip.passenger_id.clone(),
                    },
                );
            }
        }
        if !active.is_empty() {
            info!(restored = active.len(), "Active rides restored from store");
        }
        Ok(trips.len())
    }

    /// The captain's live trip, if any.
    pub fn active_ride_for(&self, captain_id: &str) -> Option<ActiveRide> {
        let active = match self.active.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.get(captain_id).cloned()
    }

    // ------------------------------------------------------------------
    // Captain events
    // ------------------------------------------------------------------

    /// `acceptRide`: notified-set check, eligibility, vault debit, CAS,
    /// queue clearing, dispatcher wake, confirmations.
    pub async fn accept_ride(&self, captain_id: &str, trip_id: &str) -> Result<Trip, DispatchError> {
        let trip = self
            .trips
            .by_id(trip_id)?
            .ok_or(DispatchError::RideNotAvailable)?;
        if trip.status != TripStatus::Requested {
            return Err(DispatchError::RideNotAvailable);
        }

        let notified = self
            .inflight
            .get(trip_id)
            .is_some_and(|entry| entry.was_notified(captain_id));
        if !notified {
            return Err(DispatchError::NotNotified);
        }

        self.eligibility.check(captain_id)?;

        let debit = match self.payment.vault_debit(&trip, captain_id) {
            Ok(debit) => debit,
            Err(err @ DispatchError::InsufficientFunds { .. }) => {
                // Refused acceptance frees the captain's pending slot so the
                // queue advances to their next candidate.
                self.queue
                    .on_reject(captain_id, trip_id, RejectReason::Declined)
                    .await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let transition = fsm::accept(captain_id, debit);
        let updated = match self.trips.cas_update(trip_id, &transition.pre, &transition.patch) {
            Ok(updated) => updated,
            Err(StoreError::CasConflict | StoreError::NotFound) => {
                self.payment.refund_vault_debit(trip_id, captain_id, debit)?;
                return Err(DispatchError::RideNotAvailable);
            }
            Err(err) => {
                self.payment.refund_vault_debit(trip_id, captain_id, debit)?;
                return Err(err.into());
            }
        };

        self.queue.on_accept(captain_id, trip_id).await;
        self.inflight.wake(trip_id);
        self.lock_active().insert(
            captain_id.to_owned(),
            ActiveRide {
                trip_id: trip_id.to_owned(),
                passenger_id: updated.passenger_id.clone(),
            },
        );

        self.notifier
            .notify_captain(
                captain_id,
                CaptainEvent::RideAcceptedConfirmation {
                    ride_id: trip_id.to_owned(),
                    status: updated.status.to_string(),
                    ride: RideOffer::from_trip(&updated),
                },
            )
            .await;
        let driver_info = self.driver_info(captain_id)?;
        self.notifier
            .notify_passenger(
                &updated.passenger_id,
                PassengerEvent::RideAccepted {
                    ride_id: trip_id.to_owned(),
                    driver_info,
                },
            )
            .await;

        info!(trip_id = %trip_id, captain_id = %captain_id, debit = debit, "Ride accepted");
        Ok(updated)
    }

    /// `rejectRide`: clears the pending slot and lets the queue advance.
    /// Idempotent on the queue: a reject for a ride that is not the
    /// captain's pending offer reports `not_notified` and advances nothing.
    pub async fn reject_ride(
        &self,
        captain_id: &str,
        trip_id: &str,
        reason: Option<&str>,
    ) -> Result<(), DispatchError> {
        let matched = self
            .queue
            .on_reject(captain_id, trip_id, RejectReason::Declined)
            .await;
        if !matched {
            return Err(DispatchError::NotNotified);
        }
        debug!(
            trip_id = %trip_id,
            captain_id = %captain_id,
            reason = reason.unwrap_or("unspecified"),
            "Ride rejected"
        );
        Ok(())
    }

    /// `cancelRide` from the assigned captain: the trip returns to the
    /// dispatch pool and a fresh dispatcher is spawned on the next nudge.
    pub async fn captain_cancel(&self, captain_id: &str, trip_id: &str) -> Result<Trip, DispatchError> {
        let trip = self
            .trips
            .by_id(trip_id)?
            .ok_or(DispatchError::RideNotAvailable)?;
        if trip.driver_id.as_deref() != Some(captain_id) || !fsm::driver_cancellable(trip.status) {
            return Err(DispatchError::RideNotAvailable);
        }

        let transition = fsm::driver_cancel(captain_id, trip.status);
        let updated = self
            .trips
            .cas_update(trip_id, &transition.pre, &transition.patch)
            .map_err(into_unavailable)?;

        self.lock_active().remove(captain_id);
        self.notifier
            .notify_captain(
                captain_id,
                CaptainEvent::RideCancelledConfirmation { ride_id: trip_id.to_owned() },
            )
            .await;
        self.notifier
            .notify_passenger(
                &updated.passenger_id,
                PassengerEvent::RideCanceled {
                    ride_id: trip_id.to_owned(),
                    reason: "captain_canceled".to_owned(),
                },
            )
            .await;
        self.supervisor.nudge();

        info!(trip_id = %trip_id, captain_id = %captain_id, "Captain cancelled accepted ride, re-dispatching");
        Ok(updated)
    }

    /// `arrived`.
    pub async fn mark_arrived(&self, captain_id: &str, trip_id: &str) -> Result<Trip, DispatchError> {
        let transition = fsm::arrive(captain_id);
        let updated = self
            .trips
            .cas_update(trip_id, &transition.pre, &transition.patch)
            .map_err(into_unavailable)?;
        self.status_update(captain_id, &updated).await;
        self.notifier
            .notify_passenger(
                &updated.passenger_id,
                PassengerEvent::DriverArrived { ride_id: trip_id.to_owned() },
            )
            .await;
        Ok(updated)
    }

    /// `startRide`.
    pub async fn start_ride(&self, captain_id: &str, trip_id: &str) -> Result<Trip, DispatchError> {
        let transition = fsm::start_ride(captain_id);
        let updated = self
            .trips
            .cas_update(trip_id, &transition.pre, &transition.patch)
            .map_err(into_unavailable)?;
        self.status_update(captain_id, &updated).await;
        self.notifier
            .notify_passenger(
                &updated.passenger_id,
                PassengerEvent::RideStarted { ride_id: trip_id.to_owned() },
            )
            .await;
        Ok(updated)
    }

    /// `endRide`: the trip moves to `awaiting_payment` and both sides learn
    /// the expected amount.
    pub async fn end_ride(&self, captain_id: &str, trip_id: &str) -> Result<Trip, DispatchError> {
        let transition = fsm::end_ride(captain_id);
        let updated = self
            .trips
            .cas_update(trip_id, &transition.pre, &transition.patch)
            .map_err(into_unavailable)?;
        self.lock_active().remove(captain_id);
        self.notifier
            .notify_captain(
                captain_id,
                CaptainEvent::PaymentRequired {
                    ride_id: trip_id.to_owned(),
                    expected_amount: updated.fare.amount,
                    currency: updated.fare.currency.clone(),
                },
            )
            .await;
        self.notifier
            .notify_passenger(
                &updated.passenger_id,
                PassengerEvent::RideAwaitingPayment {
                    ride_id: trip_id.to_owned(),
                    expected_amount: updated.fare.amount,
                    currency: updated.fare.currency.clone(),
                },
            )
            .await;
        Ok(updated)
    }

    /// `submitPayment`: settle commission and overage, then complete.
    pub async fn submit_payment(
        &self,
        captain_id: &str,
        trip_id: &str,
        received: i64,
    ) -> Result<(Trip, Settlement), DispatchError> {
        if received < 0 {
            return Err(DispatchError::InvalidAmount(received));
        }
        let trip = self
            .trips
            .by_id(trip_id)?
            .ok_or(DispatchError::RideNotAvailable)?;
        if trip.status != TripStatus::AwaitingPayment
            || trip.driver_id.as_deref() != Some(captain_id)
        {
            return Err(DispatchError::RideNotAvailable);
        }

        let settlement = self.payment.settle(&trip, captain_id, received)?;

        let transition = fsm::complete(captain_id, received);
        let updated = match self.trips.cas_update(trip_id, &transition.pre, &transition.patch) {
            Ok(updated) => updated,
            Err(err) => {
                // The transfers landed but the document moved under us; a
                // concurrent duplicate submit won the CAS.
                warn!(trip_id = %trip_id, error = %err, "Completion CAS failed after settlement");
                return Err(into_unavailable(err));
            }
        };

        self.status_update(captain_id, &updated).await;
        self.notifier
            .notify_passenger(
                &updated.passenger_id,
                PassengerEvent::RideCompleted { ride_id: trip_id.to_owned() },
            )
            .await;
        Ok((updated, settlement))
    }

    // ------------------------------------------------------------------
    // Passenger events
    // ------------------------------------------------------------------

    /// `cancelRide` from the passenger, legal in `requested` and any active
    /// status. A requested trip's dispatcher is aborted and fans out the
    /// hide-ride itself.
    pub async fn passenger_cancel(
        &self,
        passenger_id: &str,
        trip_id: &str,
    ) -> Result<Trip, DispatchError> {
        let trip = self
            .trips
            .by_id(trip_id)?
            .ok_or(DispatchError::RideNotAvailable)?;
        if trip.passenger_id != passenger_id || !fsm::passenger_cancellable(trip.status) {
            return Err(DispatchError::RideNotAvailable);
        }

        let transition = fsm::passenger_cancel(trip.status);
        let updated = self
            .trips
            .cas_update(trip_id, &transition.pre, &transition.patch)
            .map_err(into_unavailable)?;

        if self.inflight.cancel_dispatch(trip_id) {
            debug!(trip_id = %trip_id, "Dispatcher aborted by passenger cancel");
        }
        if let Some(driver_id) = &updated.driver_id {
            self.lock_active().remove(driver_id);
            self.notifier
                .notify_captain(
                    driver_id,
                    CaptainEvent::RideStatusUpdate {
                        ride_id: trip_id.to_owned(),
                        status: updated.status.to_string(),
                    },
                )
                .await;
        }
        self.notifier
            .notify_passenger(
                passenger_id,
                PassengerEvent::RideCanceled {
                    ride_id: trip_id.to_owned(),
                    reason: "passenger_canceled".to_owned(),
                },
            )
            .await;

        info!(trip_id = %trip_id, from = %trip.status, "Passenger cancelled trip");
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn status_update(&self, captain_id: &str, trip: &Trip) {
        self.notifier
            .notify_captain(
                captain_id,
                CaptainEvent::RideStatusUpdate {
                    ride_id: trip.id.clone(),
                    status: trip.status.to_string(),
                },
            )
            .await;
    }

    fn driver_info(&self, captain_id: &str) -> Result<DriverInfo, DispatchError> {
        let profile = self
            .directory
            .get(captain_id)?
            .ok_or(DispatchError::RideNotAvailable)?;
        Ok(DriverInfo::from(&profile))
    }

    fn lock_active(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<CaptainId, ActiveRide>> {
        match self.active.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn into_unavailable(err: StoreError) -> DispatchError {
    match err {
        StoreError::CasConflict | StoreError::NotFound => DispatchError::RideNotAvailable,
        other => other.into(),
    }
}
