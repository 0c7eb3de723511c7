//! Trip store: the only writer of trip documents.
//!
//! Every status transition goes through [`TripStore::cas_update`] — a
//! compare-and-set whose preconditions encode the legal transition being
//! attempted. A conflicting concurrent update (another captain accepted
//! first, the passenger cancelled, a duplicate delivery) surfaces as
//! [`StoreError::CasConflict`], which callers report as `ride_not_available`.
//!
//! Two backends implement the contract: [`SledTripStore`] for the running
//! service and [`MemoryTripStore`] for tests and minimal deployments, in the
//! manner of the pluggable persistence layer elsewhere in the platform.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::StoreError;
use crate::types::{CancellationReason, Trip, TripId, TripStatus};

// ============================================================================
// Preconditions & patch
// ============================================================================

/// What the caller expects the driver slot to hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverExpectation {
    /// `driverId` must be unset.
    Unset,
    /// `driverId` must equal this captain.
    Is(String),
}

/// Preconditions a CAS verifies against the stored document before applying
/// its patch. Unset fields are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct TripPreconditions {
    pub status: Option<TripStatus>,
    pub driver: Option<DriverExpectation>,
    pub dispatching: Option<bool>,
}

impl TripPreconditions {
    pub fn holds_for(&self, trip: &Trip) -> bool {
        if let Some(status) = self.status {
            if trip.status != status {
                return false;
            }
        }
        match &self.driver {
            Some(DriverExpectation::Unset) if trip.driver_id.is_some() => return false,
            Some(DriverExpectation::Is(id)) if trip.driver_id.as_deref() != Some(id) => {
                return false
            }
            _ => {}
        }
        if let Some(dispatching) = self.dispatching {
            if trip.dispatching != dispatching {
                return false;
            }
        }
        true
    }
}

/// Field updates applied when the preconditions hold.
///
/// `driver_id` is doubly optional: `None` leaves the slot untouched,
/// `Some(None)` clears it (driver cancel), `Some(Some(id))` assigns it.
#[derive(Debug, Clone, Default)]
pub struct TripPatch {
    pub status: Option<TripStatus>,
    pub driver_id: Option<Option<String>>,
    pub dispatching: Option<bool>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub dispatch_ended_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<CancellationReason>,
    pub payment_received: Option<i64>,
    pub main_vault_deducted: Option<bool>,
    pub main_vault_deduction_amount: Option<i64>,
}

impl TripPatch {
    pub fn apply_to(&self, trip: &mut Trip) {
        if let Some(status) = self.status {
            trip.status = status;
        }
        if let Some(ref driver_id) = self.driver_id {
            trip.driver_id = driver_id.clone();
        }
        if let Some(dispatching) = self.dispatching {
            trip.dispatching = dispatching;
        }
        if let Some(at) = self.accepted_at {
            trip.accepted_at = Some(at);
        }
        if let Some(at) = self.arrived_at {
            trip.arrived_at = Some(at);
        }
        if let Some(at) = self.started_at {
            trip.started_at = Some(at);
        }
        if let Some(at) = self.ended_at {
            trip.ended_at = Some(at);
        }
        if let Some(at) = self.dispatch_ended_at {
            trip.dispatch_ended_at = Some(at);
        }
        if let Some(ref reason) = self.cancellation_reason {
            trip.cancellation_reason = Some(reason.clone());
        }
        if let Some(received) = self.payment_received {
            trip.payment_received = Some(received);
        }
        if let Some(deducted) = self.main_vault_deducted {
            trip.main_vault_deducted = deducted;
        }
        if let Some(amount) = self.main_vault_deduction_amount {
            trip.main_vault_deduction_amount = Some(amount);
        }
    }
}

// ============================================================================
// Store contract
// ============================================================================

/// Trip persistence contract.
///
/// Implementations must be thread-safe (Send + Sync) for shared access
/// across async tasks.
pub trait TripStore: Send + Sync {
    /// Persist a freshly created trip. Fails if the id already exists.
    fn create(&self, trip: &Trip) -> Result<(), StoreError>;

    fn by_id(&self, trip_id: &str) -> Result<Option<Trip>, StoreError>;

    /// Atomically verify `pre` and apply `patch`, returning the updated
    /// document. [`StoreError::CasConflict`] when the preconditions no
    /// longer hold; [`StoreError::NotFound`] for an unknown id.
    fn cas_update(
        &self,
        trip_id: &str,
        pre: &TripPreconditions,
        patch: &TripPatch,
    ) -> Result<Trip, StoreError>;

    /// Trips in `requested` that no dispatcher owns, excluding the given
    /// in-flight set.
    fn list_requested(&self, excluding: &HashSet<TripId>) -> Result<Vec<Trip>, StoreError>;

    /// Trips in `requested` with `dispatching=true`, excluding the given
    /// in-flight set. Non-empty only for orphaned leases: a crash mid-
    /// dispatch, or a driver cancellation that returned the trip with its
    /// flag pre-set.
    fn list_dispatching(&self, excluding: &HashSet<TripId>) -> Result<Vec<Trip>, StoreError>;

    /// How many trips this driver currently owns in `accepted|arrived|onRide`.
    fn active_ride_count(&self, driver_id: &str) -> Result<usize, StoreError>;

    /// Every trip in `accepted|arrived|onRide` (restart restoration of the
    /// in-process active-ride map).
    fn list_active(&self) -> Result<Vec<Trip>, StoreError>;
}

// ============================================================================
// Sled backend
// ============================================================================

/// Sled-backed trip store. Key: trip id bytes; value: JSON document.
pub struct SledTripStore {
    tree: sled::Tree,
}

impl SledTripStore {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }
}

impl TripStore for SledTripStore {
    fn create(&self, trip: &Trip) -> Result<(), StoreError> {
        let value = serde_json::to_vec(trip)?;
        let prior = self
            .tree
            .compare_and_swap(trip.id.as_bytes(), None::<&[u8]>, Some(value))?;
        match prior {
            Ok(()) => Ok(()),
            Err(_) => Err(StoreError::CasConflict),
        }
    }

    fn by_id(&self, trip_id: &str) -> Result<Option<Trip>, StoreError> {
        let Some(bytes) = self.tree.get(trip_id.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn cas_update(
        &self,
        trip_id: &str,
        pre: &TripPreconditions,
        patch: &TripPatch,
    ) -> Result<Trip, StoreError> {
        // Retry only on physical conflicts (a concurrent writer slipped in
        // between read and swap); logical precondition failures are final.
        loop {
            let Some(old_bytes) = self.tree.get(trip_id.as_bytes())? else {
                return Err(StoreError::NotFound);
            };
            let mut trip: Trip = serde_json::from_slice(&old_bytes)?;
            if !pre.holds_for(&trip) {
                return Err(StoreError::CasConflict);
            }
            patch.apply_to(&mut trip);
            let new_bytes = serde_json::to_vec(&trip)?;
            let swap = self.tree.compare_and_swap(
                trip_id.as_bytes(),
                Some(&old_bytes[..]),
                Some(new_bytes),
            )?;
            if swap.is_ok() {
                return Ok(trip);
            }
        }
    }

    fn list_requested(&self, excluding: &HashSet<TripId>) -> Result<Vec<Trip>, StoreError> {
        let mut out = Vec::new();
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            let trip: Trip = serde_json::from_slice(&bytes)?;
            if trip.status == TripStatus::Requested
                && !trip.dispatching
                && !excluding.contains(&trip.id)
            {
                out.push(trip);
            }
        }
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }

    fn list_dispatching(&self, excluding: &HashSet<TripId>) -> Result<Vec<Trip>, StoreError> {
        let mut out = Vec::new();
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            let trip: Trip = serde_json::from_slice(&bytes)?;
            if trip.status == TripStatus::Requested
                && trip.dispatching
                && !excluding.contains(&trip.id)
            {
                out.push(trip);
            }
        }
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }

    fn active_ride_count(&self, driver_id: &str) -> Result<usize, StoreError> {
        let mut count = 0;
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            let trip: Trip = serde_json::from_slice(&bytes)?;
            if trip.status.is_active_for_driver() && trip.driver_id.as_deref() == Some(driver_id) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn list_active(&self) -> Result<Vec<Trip>, StoreError> {
        let mut out = Vec::new();
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            let trip: Trip = serde_json::from_slice(&bytes)?;
            if trip.status.is_active_for_driver() {
                out.push(trip);
            }
        }
        Ok(out)
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-memory trip store for tests and minimal deployments.
///
/// Thread-safe via a mutex; mutations are serialized, which trivially gives
/// the CAS its atomicity.
#[derive(Default)]
pub struct MemoryTripStore {
    trips: std::sync::Mutex<HashMap<TripId, Trip>>,
}

impl MemoryTripStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TripId, Trip>> {
        match self.trips.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TripStore for MemoryTripStore {
    fn create(&self, trip: &Trip) -> Result<(), StoreError> {
        let mut trips = self.lock();
        if trips.contains_key(&trip.id) {
            return Err(StoreError::CasConflict);
        }
        trips.insert(trip.id.clone(), trip.clone());
        Ok(())
    }

    fn by_id(&self, trip_id: &str) -> Result<Option<Trip>, StoreError> {
        Ok(self.lock().get(trip_id).cloned())
    }

    fn cas_update(
        &self,
        trip_id: &str,
        pre: &TripPreconditions,
        patch: &TripPatch,
    ) -> Result<Trip, StoreError> {
        let mut trips = self.lock();
        let trip = trips.get_mut(trip_id).ok_or(StoreError::NotFound)?;
        if !pre.holds_for(trip) {
            return Err(StoreError::CasConflict);
        }
        patch.apply_to(trip);
        Ok(trip.clone())
    }

    fn list_requested(&self, excluding: &HashSet<TripId>) -> Result<Vec<Trip>, StoreError> {
        let trips = self.lock();
        let mut out: Vec<Trip> = trips
            .values()
            .filter(|t| {
                t.status == TripStatus::Requested && !t.dispatching && !excluding.contains(&t.id)
            })
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }

    fn list_dispatching(&self, excluding: &HashSet<TripId>) -> Result<Vec<Trip>, StoreError> {
        let trips = self.lock();
        let mut out: Vec<Trip> = trips
            .values()
            .filter(|t| {
                t.status == TripStatus::Requested && t.dispatching && !excluding.contains(&t.id)
            })
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }

    fn active_ride_count(&self, driver_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .lock()
            .values()
            .filter(|t| {
                t.status.is_active_for_driver() && t.driver_id.as_deref() == Some(driver_id)
            })
            .count())
    }

    fn list_active(&self) -> Result<Vec<Trip>, StoreError> {
        Ok(self
            .lock()
            .values()
            .filter(|t| t.status.is_active_for_driver())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fare, TripLocation};

    fn sample_trip(id: &str) -> Trip {
        Trip {
            id: id.to_owned(),
            passenger_id: "p1".to_owned(),
            passenger_name: Some("Huda".to_owned()),
            passenger_phone: Some("+9647700000009".to_owned()),
            driver_id: None,
            pickup: TripLocation {
                lat: 33.315,
                lon: 44.366,
                name: "Karrada".to_owned(),
            },
            dropoff: TripLocation {
                lat: 33.34,
                lon: 44.40,
                name: "Mansour".to_owned(),
            },
            fare: Fare {
                amount: 5000,
                currency: "IQD".to_owned(),
            },
            distance_km: 4.2,
            duration_sec: 900,
            status: TripStatus::Requested,
            dispatching: false,
            payment_method: "cash".to_owned(),
            created_at: Utc::now(),
            accepted_at: None,
            arrived_at: None,
            started_at: None,
            ended_at: None,
            dispatch_ended_at: None,
            cancellation_reason: None,
            payment_received: None,
            main_vault_deducted: false,
            main_vault_deduction_amount: None,
        }
    }

    fn accept_patch(driver: &str) -> (TripPreconditions, TripPatch) {
        (
            TripPreconditions {
                status: Some(TripStatus::Requested),
                driver: Some(DriverExpectation::Unset),
                dispatching: None,
            },
            TripPatch {
                status: Some(TripStatus::Accepted),
                driver_id: Some(Some(driver.to_owned())),
                dispatching: Some(false),
                accepted_at: Some(Utc::now()),
                ..TripPatch::default()
            },
        )
    }

    fn stores() -> Vec<Box<dyn TripStore>> {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        // tempdir is dropped but sled keeps the fd; fine for a unit test
        std::mem::forget(dir);
        vec![
            Box::new(MemoryTripStore::new()),
            Box::new(SledTripStore::new(db.open_tree("trips").unwrap())),
        ]
    }

    #[test]
    fn create_then_read_roundtrips() {
        for store in stores() {
            let trip = sample_trip("t1");
            store.create(&trip).unwrap();
            assert_eq!(store.by_id("t1").unwrap(), Some(trip));
        }
    }

    #[test]
    fn duplicate_create_conflicts() {
        for store in stores() {
            store.create(&sample_trip("t1")).unwrap();
            assert!(matches!(
                store.create(&sample_trip("t1")),
                Err(StoreError::CasConflict)
            ));
        }
    }

    #[test]
    fn second_accept_fails_with_conflict() {
        for store in stores() {
            store.create(&sample_trip("t1")).unwrap();
            let (pre, patch) = accept_patch("c1");
            let updated = store.cas_update("t1", &pre, &patch).unwrap();
            assert_eq!(updated.status, TripStatus::Accepted);
            assert_eq!(updated.driver_id.as_deref(), Some("c1"));

            let (pre2, patch2) = accept_patch("c2");
            assert!(matches!(
                store.cas_update("t1", &pre2, &patch2),
                Err(StoreError::CasConflict)
            ));
        }
    }

    #[test]
    fn unknown_trip_is_not_found() {
        for store in stores() {
            let (pre, patch) = accept_patch("c1");
            assert!(matches!(
                store.cas_update("missing", &pre, &patch),
                Err(StoreError::NotFound)
            ));
        }
    }

    #[test]
    fn list_requested_skips_dispatching_and_excluded() {
        for store in stores() {
            store.create(&sample_trip("t1")).unwrap();
            store.create(&sample_trip("t2")).unwrap();
            let mut dispatching = sample_trip("t3");
            dispatching.dispatching = true;
            store.create(&dispatching).unwrap();

            let excluding: HashSet<String> = ["t2".to_owned()].into();
            let listed = store.list_requested(&excluding).unwrap();
            let ids: Vec<&str> = listed.iter().map(|t| t.id.as_str()).collect();
            assert_eq!(ids, vec!["t1"]);
        }
    }

    #[test]
    fn active_ride_count_tracks_driver_states() {
        for store in stores() {
            store.create(&sample_trip("t1")).unwrap();
            assert_eq!(store.active_ride_count("c1").unwrap(), 0);
            let (pre, patch) = accept_patch("c1");
            store.cas_update("t1", &pre, &patch).unwrap();
            assert_eq!(store.active_ride_count("c1").unwrap(), 1);
            assert_eq!(store.active_ride_count("c2").unwrap(), 0);
        }
    }
}
