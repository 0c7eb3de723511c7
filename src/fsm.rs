//! Trip state machine.
//!
//! Every legal transition is expressed as a named constructor returning the
//! CAS preconditions and patch the trip store verifies and applies
//! atomically. Nothing else in the codebase builds raw patches for status
//! changes, so the set of reachable status sequences is exactly the table
//! below:
//!
//! ```text
//! requested        -> accepted          (driver accept; vault debit succeeded)
//! requested        -> notApprove        (dispatch timeout / no captain)
//! requested        -> failed            (dispatch error)
//! requested        -> cancelled         (passenger cancel)
//! accepted         -> arrived           (driver)
//! accepted         -> requested         (driver cancel; clears driver, re-dispatches)
//! arrived          -> onRide            (driver)
//! arrived          -> requested         (driver cancel)
//! onRide           -> awaiting_payment  (driver ends ride)
//! awaiting_payment -> completed         (driver submits payment)
//! accepted|arrived|onRide -> cancelled  (passenger cancel during active ride)
//! ```

use chrono::Utc;

use crate::store::{DriverExpectation, TripPatch, TripPreconditions};
use crate::types::{CancellationReason, TripStatus};

/// A named, ready-to-commit transition.
#[derive(Debug, Clone)]
pub struct Transition {
    pub name: &'static str,
    pub pre: TripPreconditions,
    pub patch: TripPatch,
}

/// Statuses a passenger may cancel from.
pub fn passenger_cancellable(status: TripStatus) -> bool {
    matches!(
        status,
        TripStatus::Requested | TripStatus::Accepted | TripStatus::Arrived | TripStatus::OnRide
    )
}

/// Statuses a driver may cancel from (before the ride starts).
pub fn driver_cancellable(status: TripStatus) -> bool {
    matches!(status, TripStatus::Accepted | TripStatus::Arrived)
}

/// Whether `from -> to` appears in the transition table at all.
pub fn is_legal(from: TripStatus, to: TripStatus) -> bool {
    use TripStatus::{
        Accepted, Arrived, AwaitingPayment, Cancelled, Completed, Failed, NotApprove, OnRide,
        Requested,
    };
    matches!(
        (from, to),
        (Requested, Accepted)
            | (Requested, NotApprove)
            | (Requested, Failed)
            | (Requested, Cancelled)
            | (Accepted, Arrived)
            | (Accepted, Requested)
            | (Arrived, OnRide)
            | (Arrived, Requested)
            | (OnRide, AwaitingPayment)
            | (AwaitingPayment, Completed)
            | (Accepted, Cancelled)
            | (Arrived, Cancelled)
            | (OnRide, Cancelled)
    )
}

/// Driver accepted; the vault debit already succeeded for `deduction`.
pub fn accept(driver_id: &str, deduction: i64) -> Transition {
    Transition {
        name: "accept",
        pre: TripPreconditions {
            status: Some(TripStatus::Requested),
            driver: Some(DriverExpectation::Unset),
            dispatching: None,
        },
        patch: TripPatch {
            status: Some(TripStatus::Accepted),
            driver_id: Some(Some(driver_id.to_owned())),
            dispatching: Some(false),
            accepted_at: Some(Utc::now()),
            main_vault_deducted: Some(true),
            main_vault_deduction_amount: Some(deduction),
            ..TripPatch::default()
        },
    }
}

/// Dispatch gave up without an accepting captain.
pub fn not_approve() -> Transition {
    Transition {
        name: "not_approve",
        pre: TripPreconditions {
            status: Some(TripStatus::Requested),
            ..TripPreconditions::default()
        },
        patch: TripPatch {
            status: Some(TripStatus::NotApprove),
            dispatching: Some(false),
            dispatch_ended_at: Some(Utc::now()),
            cancellation_reason: Some(CancellationReason::DispatchTimeout),
            ..TripPatch::default()
        },
    }
}

/// Dispatch aborted on an unrecoverable error.
pub fn fail() -> Transition {
    Transition {
        name: "fail",
        pre: TripPreconditions {
            status: Some(TripStatus::Requested),
            ..TripPreconditions::default()
        },
        patch: TripPatch {
            status: Some(TripStatus::Failed),
            dispatching: Some(false),
            dispatch_ended_at: Some(Utc::now()),
            cancellation_reason: Some(CancellationReason::DispatchError),
            ..TripPatch::default()
        },
    }
}

/// Passenger cancelled from `from` (must satisfy [`passenger_cancellable`]).
pub fn passenger_cancel(from: TripStatus) -> Transition {
    Transition {
        name: "passenger_cancel",
        pre: TripPreconditions {
            status: Some(from),
            ..TripPreconditions::default()
        },
        patch: TripPatch {
            status: Some(TripStatus::Cancelled),
            dispatching: Some(false),
            dispatch_ended_at: Some(Utc::now()),
            cancellation_reason: Some(CancellationReason::PassengerCanceled),
            ..TripPatch::default()
        },
    }
}

/// Driver cancelled after acceptance: the trip returns to the dispatch pool
/// with the driver slot cleared and the dispatching flag already set, so the
/// supervisor's next tick owns it immediately.
pub fn driver_cancel(driver_id: &str, from: TripStatus) -> Transition {
    Transition {
        name: "driver_cancel",
        pre: TripPreconditions {
            status: Some(from),
            driver: Some(DriverExpectation::Is(driver_id.to_owned())),
            dispatching: None,
        },
        patch: TripPatch {
            status: Some(TripStatus::Requested),
            driver_id: Some(None),
            dispatching: Some(true),
            cancellation_reason: Some(CancellationReason::CaptainCanceled),
            ..TripPatch::default()
        },
    }
}

/// Driver reported arrival at the pickup point.
pub fn arrive(driver_id: &str) -> Transition {
    Transition {
        name: "arrive",
        pre: TripPreconditions {
            status: Some(TripStatus::Accepted),
            driver: Some(DriverExpectation::Is(driver_id.to_owned())),
            dispatching: None,
        },
        patch: TripPatch {
            status: Some(TripStatus::Arrived),
            arrived_at: Some(Utc::now()),
            ..TripPatch::default()
        },
    }
}

/// Driver started the ride.
pub fn start_ride(driver_id: &str) -> Transition {
    Transition {
        name: "start_ride",
        pre: TripPreconditions {
            status: Some(TripStatus::Arrived),
            driver: Some(DriverExpectation::Is(driver_id.to_owned())),
            dispatching: None,
        },
        patch: TripPatch {
            status: Some(TripStatus::OnRide),
            started_at: Some(Utc::now()),
            ..TripPatch::default()
        },
    }
}

/// Driver ended the ride; payment is now owed.
pub fn end_ride(driver_id: &str) -> Transition {
    Transition {
        name: "end_ride",
        pre: TripPreconditions {
            status: Some(TripStatus::OnRide),
            driver: Some(DriverExpectation::Is(driver_id.to_owned())),
            dispatching: None,
        },
        patch: TripPatch {
            status: Some(TripStatus::AwaitingPayment),
            ended_at: Some(Utc::now()),
            ..TripPatch::default()
        },
    }
}

/// Driver submitted the payment; settlement already ran.
pub fn complete(driver_id: &str, received: i64) -> Transition {
    Transition {
        name: "complete",
        pre: TripPreconditions {
            status: Some(TripStatus::AwaitingPayment),
            driver: Some(DriverExpectation::Is(driver_id.to_owned())),
            dispatching: None,
        },
        patch: TripPatch {
            status: Some(TripStatus::Completed),
            payment_received: Some(received),
            ..TripPatch::default()
        },
    }
}

/// Supervisor claims a requested trip for dispatch.
pub fn claim_for_dispatch() -> Transition {
    Transition {
        name: "claim_for_dispatch",
        pre: TripPreconditions {
            status: Some(TripStatus::Requested),
            dispatching: Some(false),
            ..TripPreconditions::default()
        },
        patch: TripPatch {
            dispatching: Some(true),
            ..TripPatch::default()
        },
    }
}

/// Dispatcher releases its lease without a terminal disposition (shutdown
/// drain); the trip stays `requested` for the next supervisor pass.
pub fn release_dispatch() -> Transition {
    Transition {
        name: "release_dispatch",
        pre: TripPreconditions {
            status: Some(TripStatus::Requested),
            dispatching: Some(true),
            ..TripPreconditions::default()
        },
        patch: TripPatch {
            dispatching: Some(false),
            ..TripPatch::default()
        },
    }
}
