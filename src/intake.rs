//! Trip intake: turn a ride request into a `requested` trip.
//!
//! Validates coordinates, estimates distance and duration, prices the fare
//! inside the configured clamps, persists the document, and nudges the
//! dispatch supervisor so the search starts without waiting for a sweep.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::config::SettingsHandle;
use crate::dispatch::SupervisorHandle;
use crate::error::DispatchError;
use crate::protocol::RequestedLocation;
use crate::store::TripStore;
use crate::types::{Fare, GeoPoint, Trip, TripLocation, TripStatus};

/// Average urban speed used for the duration estimate.
const AVERAGE_SPEED_KMH: f64 = 28.0;

/// Who is asking for the ride. The websocket path fills this from the
/// authenticated principal; the REST path from the request body.
#[derive(Debug, Clone)]
pub struct PassengerRef {
    pub id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
}

pub struct TripIntake {
    trips: Arc<dyn TripStore>,
    settings: SettingsHandle,
    supervisor: SupervisorHandle,
}

impl TripIntake {
    pub fn new(
        trips: Arc<dyn TripStore>,
        settings: SettingsHandle,
        supervisor: SupervisorHandle,
    ) -> Self {
        Self { trips, settings, supervisor }
    }

    /// Create a trip in `requested` and wake the supervisor.
    pub fn create_trip(
        &self,
        passenger: &PassengerRef,
        pickup: &RequestedLocation,
        dropoff: &RequestedLocation,
        payment_method: Option<&str>,
    ) -> Result<Trip, DispatchError> {
        let pickup_point = validated(pickup, "pickup")?;
        let dropoff_point = validated(dropoff, "dropoff")?;

        let settings = self.settings.current();
        let distance_km = pickup_point.distance_km(&dropoff_point);
        let duration_sec = (distance_km / AVERAGE_SPEED_KMH * 3600.0).round() as u64;
        let fare = self.price(distance_km);

        let trip = Trip {
            id: Uuid::new_v4().to_string(),
            passenger_id: passenger.id.clone(),
            passenger_name: passenger.name.clone(),
            passenger_phone: passenger.phone.clone(),
            driver_id: None,
            pickup: TripLocation {
                lat: pickup.lat,
                lon: pickup.lon,
                name: pickup.name.clone().unwrap_or_default(),
            },
            dropoff: TripLocation {
                lat: dropoff.lat,
                lon: dropoff.lon,
                name: dropoff.name.clone().unwrap_or_default(),
            },
            fare: Fare { amount: fare, currency: settings.currency.clone() },
            distance_km,
            duration_sec,
            status: TripStatus::Requested,
            dispatching: false,
            payment_method: payment_method.unwrap_or("cash").to_owned(),
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
        };

        self.trips.create(&trip)?;
        self.supervisor.nudge();
        info!(
            trip_id = %trip.id,
            passenger_id = %passenger.id,
            fare = trip.fare.amount,
            distance_km = distance_km,
            "Trip created"
        );
        Ok(trip)
    }

    /// Base plus per-kilometre, clamped to the configured price band.
    fn price(&self, distance_km: f64) -> i64 {
        let settings = self.settings.current();
        let raw = settings.base_fare as f64 + settings.price_per_km as f64 * distance_km;
        (raw.round() as i64).clamp(settings.min_ride_price, settings.max_ride_price)
    }
}

fn validated(location: &RequestedLocation, which: &str) -> Result<GeoPoint, DispatchError> {
    GeoPoint::new(location.lat, location.lon).ok_or_else(|| {
        DispatchError::InvalidCoordinates(format!(
            "{which}: lat={} lon={}",
            location.lat, location.lon
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchSettings;
    use crate::store::MemoryTripStore;

    fn intake() -> (TripIntake, Arc<MemoryTripStore>, SettingsHandle) {
        let trips = Arc::new(MemoryTripStore::new());
        let settings = SettingsHandle::new(DispatchSettings::default());
        (
            TripIntake::new(trips.clone(), settings.clone(), SupervisorHandle::detached()),
            trips,
            settings,
        )
    }

    fn loc(lat: f64, lon: f64) -> RequestedLocation {
        RequestedLocation { lat, lon, name: Some("X".to_owned()) }
    }

    fn passenger() -> PassengerRef {
        PassengerRef {
            id: "p1".to_owned(),
            name: Some("Huda".to_owned()),
            phone: Some("+9647700000009".to_owned()),
        }
    }

    #[test]
    fn rejects_invalid_coordinates() {
        let (intake, trips, _) = intake();
        let err = intake
            .create_trip(&passenger(), &loc(99.0, 44.4), &loc(33.3, 44.5), None)
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidCoordinates(_)));
        assert!(trips.list_requested(&Default::default()).unwrap().is_empty());
    }

    #[test]
    fn creates_requested_trip_with_estimates() {
        let (intake, trips, _) = intake();
        let trip = intake
            .create_trip(&passenger(), &loc(33.315, 44.366), &loc(33.345, 44.366), Some("cash"))
            .unwrap();
        assert_eq!(trip.status, TripStatus::Requested);
        assert!(!trip.dispatching);
        assert!(trip.distance_km > 3.0 && trip.distance_km < 4.0);
        assert!(trip.duration_sec > 0);
        assert_eq!(trip.fare.currency, "IQD");
        assert_eq!(trips.by_id(&trip.id).unwrap().unwrap(), trip);
    }

    #[test]
    fn fare_is_clamped_to_the_price_band() {
        let (intake, _, settings) = intake();
        // A few hundred metres: raw price falls below the minimum.
        let short = intake
            .create_trip(&passenger(), &loc(33.3150, 44.366), &loc(33.3160, 44.366), None)
            .unwrap();
        assert_eq!(short.fare.amount, settings.current().min_ride_price);

        // Across the whole country: raw price exceeds the maximum.
        let long = intake
            .create_trip(&passenger(), &loc(30.5, 47.8), &loc(36.9, 42.9), None)
            .unwrap();
        assert_eq!(long.fare.amount, settings.current().max_ride_price);
    }
}
