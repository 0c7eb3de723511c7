//! Dispatch-wide error kinds.
//!
//! Boundary errors (invalid inputs, ineligible captains, CAS conflicts) are
//! reported to the caller with no state change. Internal errors during a
//! dispatch are logged; unrecoverable ones mark the trip failed and notify
//! the passenger.

use crate::types::EligibilityFailure;

/// Dispatch phase a timeout occurred in, carried by [`DispatchError::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// A single captain's notification window elapsed.
    Notification,
    /// The per-trip `max_dispatch_time_sec` cap was hit.
    DispatchMax,
    /// The post-max-radius grace window elapsed.
    Grace,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Notification => write!(f, "notification"),
            Self::DispatchMax => write!(f, "dispatch_max"),
            Self::Grace => write!(f, "grace"),
        }
    }
}

/// Error kinds surfaced by the dispatch core.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid coordinates: {0}")]
    InvalidCoordinates(String),

    #[error("captain not eligible: {0}")]
    NotEligible(EligibilityFailure),

    /// The CAS failed: status changed under the caller or the driver slot
    /// was already taken.
    #[error("ride not available")]
    RideNotAvailable,

    /// A captain tried to act on a trip they were never notified for.
    #[error("captain was not notified for this ride")]
    NotNotified,

    #[error("insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: i64, required: i64 },

    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("timeout in {0} phase")]
    Timeout(TimeoutPhase),

    /// Delivery returned false; never retried here.
    #[error("transport delivery failed")]
    TransportFailure,

    #[error("store failure: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("ledger failure: {0}")]
    Ledger(#[from] crate::store::LedgerError),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl DispatchError {
    /// Stable machine-readable code used in wire `rideError` payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCoordinates(_) => "invalid_coordinates",
            Self::NotEligible(_) => "not_eligible",
            Self::RideNotAvailable => "ride_not_available",
            Self::NotNotified => "not_notified",
            Self::InsufficientFunds { .. } => "insufficient_balance",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::Timeout(_) => "timeout",
            Self::TransportFailure => "transport_failure",
            Self::Store(_) => "store_failure",
            Self::Ledger(_) => "ledger_failure",
            Self::ConfigInvalid(_) => "config_invalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_wire_names() {
        assert_eq!(DispatchError::RideNotAvailable.code(), "ride_not_available");
        assert_eq!(
            DispatchError::InsufficientFunds { balance: 200, required: 500 }.code(),
            "insufficient_balance"
        );
        assert_eq!(DispatchError::NotNotified.code(), "not_notified");
    }
}
