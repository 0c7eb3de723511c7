//! Trip document: the persisted record of one passenger request.
//!
//! A trip is created in `Requested` by intake and advanced exclusively
//! through compare-and-set updates in the trip store. The field layout
//! matches the persisted JSON document one-to-one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::geo::GeoPoint;

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of a trip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TripStatus {
    /// Waiting for a captain; the only status in which dispatch runs.
    Requested,
    /// A captain accepted and the vault deduction succeeded.
    Accepted,
    /// The captain reported arrival at the pickup point.
    Arrived,
    /// The ride is underway.
    OnRide,
    /// The captain ended the ride; payment has not been submitted yet.
    #[serde(rename = "awaiting_payment")]
    AwaitingPayment,
    /// Payment submitted and settled; terminal.
    Completed,
    /// Dispatch gave up without an accepting captain; terminal.
    NotApprove,
    /// Dispatch aborted on an internal error; terminal.
    Failed,
    /// Cancelled by the passenger; terminal.
    Cancelled,
}

impl TripStatus {
    /// Statuses in which the trip has exactly one owning driver.
    pub fn has_driver(self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::Arrived | Self::OnRide | Self::AwaitingPayment | Self::Completed
        )
    }

    /// Statuses counting toward a captain's active-ride limit.
    pub fn is_active_for_driver(self) -> bool {
        matches!(self, Self::Accepted | Self::Arrived | Self::OnRide)
    }

    /// Terminal statuses: no further transitions exist.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::NotApprove | Self::Failed | Self::Cancelled
        )
    }
}

impl std::fmt::Display for TripStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::Accepted => write!(f, "accepted"),
            Self::Arrived => write!(f, "arrived"),
            Self::OnRide => write!(f, "onRide"),
            Self::AwaitingPayment => write!(f, "awaiting_payment"),
            Self::Completed => write!(f, "completed"),
            Self::NotApprove => write!(f, "notApprove"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Who or what terminated a trip prematurely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    PassengerCanceled,
    CaptainCanceled,
    DispatchTimeout,
    DispatchError,
}

impl std::fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PassengerCanceled => write!(f, "passenger_canceled"),
            Self::CaptainCanceled => write!(f, "captain_canceled"),
            Self::DispatchTimeout => write!(f, "dispatch_timeout"),
            Self::DispatchError => write!(f, "dispatch_error"),
        }
    }
}

// ============================================================================
// Fare & locations
// ============================================================================

/// Monetary amount in integer minor units plus its currency code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fare {
    /// Integer minor units (e.g. 5000 = 5000 IQD).
    pub amount: i64,
    pub currency: String,
}

/// A named pickup or dropoff location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TripLocation {
    pub lat: f64,
    pub lon: f64,
    pub name: String,
}

impl TripLocation {
    /// The coordinate part, validated.
    pub fn point(&self) -> Option<GeoPoint> {
        GeoPoint::new(self.lat, self.lon)
    }
}

/// Whether a submitted payment covered the expected fare.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentClassification {
    Full,
    Partial,
}

// ============================================================================
// Trip document
// ============================================================================

/// One passenger request and its lifecycle document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: String,
    pub passenger_id: String,
    /// Contact snapshot taken at request time for the captain-facing offer.
    #[serde(default)]
    pub passenger_name: Option<String>,
    #[serde(default)]
    pub passenger_phone: Option<String>,
    /// Set exactly when `status.has_driver()`.
    #[serde(default)]
    pub driver_id: Option<String>,
    pub pickup: TripLocation,
    pub dropoff: TripLocation,
    pub fare: Fare,
    pub distance_km: f64,
    pub duration_sec: u64,
    pub status: TripStatus,
    /// True iff a dispatcher currently owns this trip.
    #[serde(default)]
    pub dispatching: bool,
    pub payment_method: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub arrived_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dispatch_ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancellation_reason: Option<CancellationReason>,
    /// Amount the passenger actually handed over, recorded at completion.
    #[serde(default)]
    pub payment_received: Option<i64>,
    #[serde(default)]
    pub main_vault_deducted: bool,
    #[serde(default)]
    pub main_vault_deduction_amount: Option<i64>,
}

impl Trip {
    /// The pickup coordinate, validated; `None` means the document carries
    /// an origin dispatch cannot work with.
    pub fn origin(&self) -> Option<GeoPoint> {
        self.pickup.point()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_with_wire_names() {
        let j = |s: TripStatus| serde_json::to_string(&s).unwrap();
        assert_eq!(j(TripStatus::Requested), "\"requested\"");
        assert_eq!(j(TripStatus::OnRide), "\"onRide\"");
        assert_eq!(j(TripStatus::AwaitingPayment), "\"awaiting_payment\"");
        assert_eq!(j(TripStatus::NotApprove), "\"notApprove\"");
    }

    #[test]
    fn driver_presence_matches_status_family() {
        assert!(!TripStatus::Requested.has_driver());
        assert!(TripStatus::Accepted.has_driver());
        assert!(TripStatus::AwaitingPayment.has_driver());
        assert!(TripStatus::Completed.has_driver());
        assert!(!TripStatus::Cancelled.has_driver());
    }

    #[test]
    fn active_statuses_are_the_three_pre_payment_driver_states() {
        for s in [TripStatus::Accepted, TripStatus::Arrived, TripStatus::OnRide] {
            assert!(s.is_active_for_driver());
        }
        for s in [
            TripStatus::Requested,
            TripStatus::AwaitingPayment,
            TripStatus::Completed,
            TripStatus::NotApprove,
        ] {
            assert!(!s.is_active_for_driver());
        }
    }
}
