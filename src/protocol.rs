//! Wire protocol: event names and payload shapes for the three realtime
//! namespaces (`/ws/captain`, `/ws/customer`, `/ws/admin`).
//!
//! Every frame is a JSON object `{ "event": <name>, "data": <payload> }`.
//! Captain and customer events use camelCase names; the admin namespace
//! keeps its historical snake_case names. Unknown inbound events are
//! answered with an `error` frame and otherwise ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::captains::DriverInfo;
use crate::types::Trip;

// ============================================================================
// Shared payload fragments
// ============================================================================

/// Passenger contact block included in ride offers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PassengerInfo {
    pub id: String,
    pub name: String,
    pub phone_number: String,
}

/// The `newRide` payload offered to captains.
///
/// Coordinates are `[lon, lat]` pairs, matching the client map SDKs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideOffer {
    pub ride_id: String,
    pub pickup: [f64; 2],
    pub dropoff: [f64; 2],
    pub fare: i64,
    pub currency: String,
    pub distance: f64,
    pub duration: u64,
    pub payment_method: String,
    pub pickup_name: String,
    pub dropoff_name: String,
    pub passenger_info: PassengerInfo,
}

impl RideOffer {
    pub fn from_trip(trip: &Trip) -> Self {
        Self {
            ride_id: trip.id.clone(),
            pickup: [trip.pickup.lon, trip.pickup.lat],
            dropoff: [trip.dropoff.lon, trip.dropoff.lat],
            fare: trip.fare.amount,
            currency: trip.fare.currency.clone(),
            distance: trip.distance_km,
            duration: trip.duration_sec,
            payment_method: trip.payment_method.clone(),
            pickup_name: trip.pickup.name.clone(),
            dropoff_name: trip.dropoff.name.clone(),
            passenger_info: PassengerInfo {
                id: trip.passenger_id.clone(),
                name: trip.passenger_name.clone().unwrap_or_default(),
                phone_number: trip.passenger_phone.clone().unwrap_or_default(),
            },
        }
    }
}

/// Why a previously offered ride must disappear from a captain's screen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HideRideReason {
    RideTaken,
    DispatchTimeout,
    MaxRadiusReached,
    DispatchError,
    EmergencyStop,
    Expanding,
    Cancelled,
}

impl HideRideReason {
    /// Human-readable line shown under the dismissal toast.
    pub fn message(self) -> &'static str {
        match self {
            Self::RideTaken => "Another captain accepted this ride",
            Self::DispatchTimeout => "The request expired",
            Self::MaxRadiusReached => "The request expired",
            Self::DispatchError => "The request could not be processed",
            Self::EmergencyStop => "Dispatch was interrupted",
            Self::Expanding => "Searching a wider area",
            Self::Cancelled => "The passenger cancelled",
        }
    }
}

/// Position datum fanned out to tracking admins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaptainLocationData {
    pub captain_id: String,
    pub lat: f64,
    pub lon: f64,
    pub updated_at: DateTime<Utc>,
}

/// Body of `captain_location_update`: either a fresh position or an expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocationUpdatePayload {
    LocationUpdate { data: CaptainLocationData },
    #[serde(rename_all = "camelCase")]
    LocationRemoved { captain_id: String },
}

/// Tracking-hub statistics block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackingStats {
    pub active_sessions: usize,
    pub tracked_captains: usize,
    pub max_sessions: usize,
    pub location_expiry_sec: u64,
}

// ============================================================================
// Server -> captain
// ============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum CaptainEvent {
    NewRide(RideOffer),
    #[serde(rename_all = "camelCase")]
    HideRide {
        ride_id: String,
        reason: HideRideReason,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    RideAcceptedConfirmation {
        ride_id: String,
        status: String,
        ride: RideOffer,
    },
    #[serde(rename_all = "camelCase")]
    RideCancelledConfirmation {
        ride_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RideStatusUpdate {
        ride_id: String,
        status: String,
    },
    #[serde(rename_all = "camelCase")]
    PaymentRequired {
        ride_id: String,
        expected_amount: i64,
        currency: String,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionEstablished {
        session_id: String,
        server_time: DateTime<Utc>,
    },
    ConnectionReplaced {
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    RideError {
        #[serde(skip_serializing_if = "Option::is_none")]
        ride_id: Option<String>,
        code: String,
        message: String,
    },
    SettingsUpdated(crate::config::DispatchSettings),
}

impl CaptainEvent {
    pub fn hide_ride(ride_id: &str, reason: HideRideReason) -> Self {
        Self::HideRide {
            ride_id: ride_id.to_owned(),
            reason,
            message: reason.message().to_owned(),
        }
    }

    pub fn ride_error(ride_id: Option<&str>, code: &str, message: &str) -> Self {
        Self::RideError {
            ride_id: ride_id.map(ToOwned::to_owned),
            code: code.to_owned(),
            message: message.to_owned(),
        }
    }
}

// ============================================================================
// Server -> passenger
// ============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum PassengerEvent {
    #[serde(rename_all = "camelCase")]
    RideRequested {
        ride_id: String,
        fare: i64,
        currency: String,
    },
    #[serde(rename_all = "camelCase")]
    RideAccepted {
        ride_id: String,
        driver_info: DriverInfo,
    },
    #[serde(rename_all = "camelCase")]
    DriverArrived {
        ride_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RideStarted {
        ride_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RideAwaitingPayment {
        ride_id: String,
        expected_amount: i64,
        currency: String,
    },
    #[serde(rename_all = "camelCase")]
    RideCompleted {
        ride_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RideCanceled {
        ride_id: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    RideNotApproved {
        ride_id: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    DriverLocationUpdate {
        lat: f64,
        lon: f64,
        ts: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionEstablished {
        session_id: String,
        server_time: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    RideError {
        #[serde(skip_serializing_if = "Option::is_none")]
        ride_id: Option<String>,
        code: String,
        message: String,
    },
}

// ============================================================================
// Server -> admin
// ============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum AdminEvent {
    AdminConnected {
        user_info: AdminUserInfo,
        stats: TrackingStats,
    },
    CaptainLocationsInitial {
        data: Vec<CaptainLocationData>,
        count: usize,
    },
    CaptainLocationUpdate(LocationUpdatePayload),
    TrackingStats(TrackingStats),
    Error {
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdminUserInfo {
    pub id: String,
    pub role: String,
}

// ============================================================================
// Outbound wrapper
// ============================================================================

/// Any server->client event, so one connection channel type serves all
/// three namespaces. Serialization is delegated untouched to the inner
/// role-specific enum.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum OutboundEvent {
    Captain(CaptainEvent),
    Passenger(PassengerEvent),
    Admin(AdminEvent),
}

impl From<CaptainEvent> for OutboundEvent {
    fn from(event: CaptainEvent) -> Self {
        Self::Captain(event)
    }
}

impl From<PassengerEvent> for OutboundEvent {
    fn from(event: PassengerEvent) -> Self {
        Self::Passenger(event)
    }
}

impl From<AdminEvent> for OutboundEvent {
    fn from(event: AdminEvent) -> Self {
        Self::Admin(event)
    }
}

// ============================================================================
// Client -> server
// ============================================================================

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum CaptainClientEvent {
    UpdateLocation {
        lat: f64,
        lon: f64,
    },
    #[serde(rename_all = "camelCase")]
    AcceptRide {
        ride_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RejectRide {
        ride_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CancelRide {
        ride_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Arrived {
        ride_id: String,
    },
    #[serde(rename_all = "camelCase")]
    StartRide {
        ride_id: String,
    },
    #[serde(rename_all = "camelCase")]
    EndRide {
        ride_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SubmitPayment {
        ride_id: String,
        received_amount: i64,
        #[serde(default)]
        notes: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum CustomerClientEvent {
    #[serde(rename_all = "camelCase")]
    RequestRide {
        pickup: RequestedLocation,
        dropoff: RequestedLocation,
        #[serde(default)]
        payment_method: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CancelRide {
        ride_id: String,
    },
}

/// Location block of a ride request.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RequestedLocation {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum AdminClientEvent {
    StartLocationTracking,
    StopLocationTracking,
    GetCurrentLocations,
    GetTrackingStats,
    #[serde(rename_all = "camelCase")]
    FocusCaptain {
        captain_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captain_events_use_wire_names() {
        let event = CaptainEvent::hide_ride("t1", HideRideReason::RideTaken);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "hideRide");
        assert_eq!(json["data"]["rideId"], "t1");
        assert_eq!(json["data"]["reason"], "ride_taken");
    }

    #[test]
    fn admin_events_keep_snake_case_names() {
        let event = AdminEvent::CaptainLocationUpdate(LocationUpdatePayload::LocationRemoved {
            captain_id: "c9".to_owned(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "captain_location_update");
        assert_eq!(json["data"]["type"], "location_removed");
        assert_eq!(json["data"]["captainId"], "c9");
    }

    #[test]
    fn outbound_wrapper_serializes_transparently() {
        let event: OutboundEvent = CaptainEvent::ConnectionReplaced {
            reason: "newer_connection".to_owned(),
        }
        .into();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "connectionReplaced");
    }

    #[test]
    fn captain_client_events_parse() {
        let frame = r#"{"event":"acceptRide","data":{"rideId":"t1"}}"#;
        let parsed: CaptainClientEvent = serde_json::from_str(frame).unwrap();
        assert_eq!(parsed, CaptainClientEvent::AcceptRide { ride_id: "t1".to_owned() });

        let frame = r#"{"event":"updateLocation","data":{"lat":33.3,"lon":44.4}}"#;
        let parsed: CaptainClientEvent = serde_json::from_str(frame).unwrap();
        assert!(matches!(parsed, CaptainClientEvent::UpdateLocation { .. }));
    }

    #[test]
    fn admin_client_events_parse_snake_case() {
        let frame = r#"{"event":"focus_captain","data":{"captainId":"c1"}}"#;
        let parsed: AdminClientEvent = serde_json::from_str(frame).unwrap();
        assert_eq!(parsed, AdminClientEvent::FocusCaptain { captain_id: "c1".to_owned() });
    }
}
