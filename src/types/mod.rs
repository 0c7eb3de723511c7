//! Core domain types shared across the dispatch engine.
//!
//! Organized by concern:
//! - [`trip`]: the trip document, its status machine vocabulary and fare
//! - [`captain`]: captain profiles, sessions and eligibility inputs
//! - [`geo`]: coordinate primitives shared by the location index and intake

pub mod captain;
pub mod geo;
pub mod trip;

pub use captain::{CaptainProfile, CaptainSession, EligibilityFailure};
pub use geo::GeoPoint;
pub use trip::{
    CancellationReason, Fare, PaymentClassification, Trip, TripLocation, TripStatus,
};

/// Identifier newtypes are intentionally avoided: every id in the system is
/// an opaque string minted elsewhere (auth principal ids) or a UUID minted
/// here (trip ids). Aliases keep signatures readable.
pub type TripId = String;
pub type CaptainId = String;
pub type PassengerId = String;
pub type AdminId = String;
