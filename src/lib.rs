//! Tarhal Dispatch Core
//!
//! The ride dispatch engine of the Tarhal ride-hailing backend: given a
//! passenger's requested trip, find a captain to accept it by notifying an
//! expanding ring of nearby captains, process captain responses under
//! strict concurrency and timing constraints, and keep the trip state
//! machine correct through acceptance, cancellation, and completion.
//!
//! ## Architecture
//!
//! - **LocationIndex**: geospatial store of captain positions
//! - **TripStore**: trip documents, advanced only by compare-and-set
//! - **CaptainQueueManager**: per-captain single-flight offer + bounded queue
//! - **Dispatcher / DispatchSupervisor**: expanding-radius search per trip
//! - **PaymentInterlock / Ledger**: vault debit, commission, overage
//! - **PresenceRegistry / Notifier**: live WebSocket fan-out
//! - **AdminTrackingHub**: staff live-tracking subscriptions

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fsm;
pub mod geo;
pub mod intake;
pub mod notify;
pub mod payment;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod store;
pub mod tracking;
pub mod types;
pub mod ws;

// Re-export the types the binary and integration tests reach for first.
pub use app::{build, App, BuiltApp};
pub use config::{AppConfig, DispatchSettings, SettingsHandle};
pub use error::DispatchError;
pub use types::{Trip, TripStatus};
