//! Captain profiles and in-process session records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Profile
// ============================================================================

/// Persisted captain profile backing the eligibility predicate.
///
/// `wallet_balance` is intentionally absent: the wallet lives in the ledger
/// and is read there at eligibility-check time so the two can never drift.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaptainProfile {
    pub id: String,
    pub name: String,
    pub phone_number: String,
    pub rating: f64,
    pub is_active: bool,
    pub is_verified: bool,
    #[serde(default)]
    pub last_active_at: Option<DateTime<Utc>>,
}

/// Why a captain failed the eligibility predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EligibilityFailure {
    Inactive,
    Unverified,
    RatingBelowMinimum,
    WalletBelowMinimum,
    TooManyActiveRides,
    UnknownCaptain,
}

impl std::fmt::Display for EligibilityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::Unverified => write!(f, "unverified"),
            Self::RatingBelowMinimum => write!(f, "rating_below_minimum"),
            Self::WalletBelowMinimum => write!(f, "wallet_below_minimum"),
            Self::TooManyActiveRides => write!(f, "too_many_active_rides"),
            Self::UnknownCaptain => write!(f, "unknown_captain"),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// In-process record of one authenticated captain connection.
///
/// Created on connect, destroyed on disconnect. Closed sessions are retained
/// for 30 seconds for analytics before the registry drops them.
#[derive(Debug, Clone)]
pub struct CaptainSession {
    pub captain_id: String,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl CaptainSession {
    pub fn new(captain_id: &str, session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            captain_id: captain_id.to_owned(),
            session_id: session_id.to_owned(),
            connected_at: now,
            last_activity: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}
