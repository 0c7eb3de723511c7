//! Dispatch engine: per-trip expanding-radius search and its supervision.
//!
//! - [`dispatcher`]: the per-trip state machine
//! - [`supervisor`]: the background sweep ensuring every requested trip has
//!   exactly one dispatcher
//! - [`lifecycle`]: captain/passenger ride events (accept, reject, cancel,
//!   arrive, start, end, payment) driving the trip FSM
//! - [`tracking`]: per-trip notified-set bookkeeping
//! - [`circuit`]: the failure circuit breaker guarding new dispatch starts
//!
//! One dispatcher per trip is enforced twice: persistently by the trip's
//! `dispatching` flag, and in-process by [`InflightRegistry`], whose claim
//! is an atomic set-add.

pub mod circuit;
pub mod dispatcher;
pub mod lifecycle;
pub mod supervisor;
pub mod tracking;

pub use circuit::CircuitBreaker;
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use lifecycle::RideLifecycle;
pub use supervisor::{DispatchSupervisor, SupervisorHandle};
pub use tracking::RideNotificationTracking;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::SettingsHandle;
use crate::geo::LocationIndex;
use crate::notify::NotifyPort;
use crate::payment::PaymentInterlock;
use crate::presence::PresenceRegistry;
use crate::queue::QueuePort;
use crate::store::{EligibilityService, TripStore};
use crate::types::TripId;

// ============================================================================
// Shared context
// ============================================================================

/// Everything a dispatcher (and the supervisor spawning it) needs, behind
/// ports where the collaborator is a realtime component. Constructed once
/// at startup.
pub struct DispatchContext {
    pub trips: Arc<dyn TripStore>,
    pub location: Arc<LocationIndex>,
    pub presence: Arc<PresenceRegistry>,
    pub notifier: Arc<dyn NotifyPort>,
    pub queue: Arc<dyn QueuePort>,
    pub eligibility: Arc<EligibilityService>,
    pub payment: Arc<PaymentInterlock>,
    pub settings: SettingsHandle,
    pub inflight: Arc<InflightRegistry>,
    pub circuit: Arc<CircuitBreaker>,
    /// Process-wide shutdown; every per-trip token is a child of it.
    pub shutdown: CancellationToken,
}

// ============================================================================
// In-flight registry
// ============================================================================

/// Live dispatch state for one trip, shared between its dispatcher task and
/// the ride event handlers.
pub struct TripDispatch {
    /// Trip-local cancellation; child of the process shutdown token.
    pub cancel: CancellationToken,
    /// Pinged on acceptance/cancellation so the dispatcher re-reads the
    /// trip instead of sleeping out its window.
    pub wake: Notify,
    /// Captains notified for this trip, at any radius and at the current one.
    pub tracking: std::sync::Mutex<RideNotificationTracking>,
}

impl TripDispatch {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            wake: Notify::new(),
            tracking: std::sync::Mutex::new(RideNotificationTracking::new()),
        }
    }

    /// Whether this captain was ever notified for the trip.
    pub fn was_notified(&self, captain_id: &str) -> bool {
        self.lock_tracking().was_notified(captain_id)
    }

    pub fn lock_tracking(&self) -> std::sync::MutexGuard<'_, RideNotificationTracking> {
        match self.tracking.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Process-local set of trips that currently have a dispatcher.
///
/// `claim` is the atomic set-add establishing dispatcher uniqueness; a
/// second claim for the same trip is refused.
#[derive(Default)]
pub struct InflightRegistry {
    inner: std::sync::Mutex<HashMap<TripId, Arc<TripDispatch>>>,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a trip. `None` when another dispatcher already owns it.
    pub fn claim(&self, trip_id: &str, cancel: CancellationToken) -> Option<Arc<TripDispatch>> {
        let mut inner = self.lock();
        if inner.contains_key(trip_id) {
            return None;
        }
        let entry = Arc::new(TripDispatch::new(cancel));
        inner.insert(trip_id.to_owned(), entry.clone());
        Some(entry)
    }

    pub fn release(&self, trip_id: &str) {
        self.lock().remove(trip_id);
    }

    pub fn get(&self, trip_id: &str) -> Option<Arc<TripDispatch>> {
        self.lock().get(trip_id).cloned()
    }

    pub fn contains(&self, trip_id: &str) -> bool {
        self.lock().contains_key(trip_id)
    }

    /// Abort a trip's dispatcher (external cancellation). Returns whether a
    /// dispatcher was in flight.
    pub fn cancel_dispatch(&self, trip_id: &str) -> bool {
        match self.get(trip_id) {
            Some(entry) => {
                entry.cancel.cancel();
                entry.wake.notify_one();
                true
            }
            None => false,
        }
    }

    /// Ping a trip's dispatcher to re-read store state.
    pub fn wake(&self, trip_id: &str) {
        if let Some(entry) = self.get(trip_id) {
            entry.wake.notify_one();
        }
    }

    pub fn in_flight_ids(&self) -> HashSet<TripId> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TripId, Arc<TripDispatch>>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_is_refused_until_release() {
        let registry = InflightRegistry::new();
        let first = registry.claim("t1", CancellationToken::new());
        assert!(first.is_some());
        assert!(registry.claim("t1", CancellationToken::new()).is_none());
        registry.release("t1");
        assert!(registry.claim("t1", CancellationToken::new()).is_some());
    }

    #[test]
    fn cancel_dispatch_fires_the_trip_token() {
        let registry = InflightRegistry::new();
        let entry = registry.claim("t1", CancellationToken::new()).unwrap();
        assert!(registry.cancel_dispatch("t1"));
        assert!(entry.cancel.is_cancelled());
        assert!(!registry.cancel_dispatch("t2"));
    }
}
