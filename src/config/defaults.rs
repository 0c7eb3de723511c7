//! Default values and fixed operational constants.
//!
//! Everything operator-tunable lives in [`super::DispatchSettings`] with the
//! defaults below; the remaining constants are protocol-level behaviour the
//! dispatch loop relies on and are deliberately not configurable.

// ============================================================================
// Dispatch radius & timing defaults
// ============================================================================

pub const INITIAL_RADIUS_KM: f64 = 2.0;
pub const MAX_RADIUS_KM: f64 = 10.0;
pub const RADIUS_INCREMENT_KM: f64 = 1.0;
pub const NOTIFICATION_TIMEOUT_SEC: u64 = 15;
pub const MAX_DISPATCH_TIME_SEC: u64 = 300;
pub const GRACE_AFTER_MAX_RADIUS_SEC: u64 = 30;

// ============================================================================
// Captain queue defaults
// ============================================================================

pub const MAX_QUEUE_LENGTH: usize = 10;
pub const QUEUE_PROCESSING_DELAY_MS: u64 = 2000;
pub const QUEUE_TIMEOUT_MULTIPLIER: f64 = 1.5;
/// Hard cap on the effective queue timeout multiplier.
pub const QUEUE_TIMEOUT_MULTIPLIER_CAP: f64 = 2.0;
/// Items queued longer than this get the stretched timeout.
pub const QUEUE_AGED_THRESHOLD_SECS: u64 = 30;

// ============================================================================
// Eligibility defaults
// ============================================================================

pub const MIN_RATING: f64 = 3.5;
pub const MIN_WALLET_BALANCE: i64 = 0;
pub const MAX_ACTIVE_RIDES: usize = 1;

// ============================================================================
// Payment defaults
// ============================================================================

pub const MAIN_VAULT_DEDUCTION_RATE: f64 = 0.20;
pub const COMMISSION_RATE: f64 = 0.15;
pub const PENDING_TRANSFER_RETRY_SECS: u64 = 300;

// ============================================================================
// Pricing defaults (minor units)
// ============================================================================

pub const BASE_FARE: i64 = 1000;
pub const PRICE_PER_KM: i64 = 500;
pub const MIN_RIDE_PRICE: i64 = 2000;
pub const MAX_RIDE_PRICE: i64 = 50_000;
pub const CURRENCY: &str = "IQD";

// ============================================================================
// Tracking defaults
// ============================================================================

pub const LOCATION_EXPIRY_SEC: u64 = 60;
pub const MAX_TRACKING_SESSIONS: usize = 10;

// ============================================================================
// Fixed operational constants (not operator-tunable)
// ============================================================================

/// Pause between radius expansions to cap notification burst rate.
pub const RADIUS_EXPAND_PAUSE_MS: u64 = 2000;

/// Sub-interval of the grace-period poll, bounding cancel latency.
pub const GRACE_POLL_INTERVAL_SECS: u64 = 5;

/// Radius query result cap.
pub const RADIUS_QUERY_LIMIT: usize = 50;

/// Supervisor sweep interval bounds; the sweep adapts within them.
pub const SWEEP_MIN_SECS: u64 = 30;
pub const SWEEP_MAX_SECS: u64 = 120;

/// Consecutive dispatcher failures before the circuit opens.
pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
/// How long new dispatch starts stay suspended once the circuit opens.
pub const CIRCUIT_SUSPENSION_SECS: u64 = 300;

/// Closed captain sessions are retained this long for analytics.
pub const SESSION_RETENTION_SECS: u64 = 30;

/// Outbound per-connection channel capacity before events are dropped.
pub const CONNECTION_BUFFER_SIZE: usize = 256;

/// Default HTTP/WebSocket bind address.
pub const SERVER_ADDR: &str = "0.0.0.0:8080";

/// Default data directory for the sled stores.
pub const DATA_DIR: &str = "./data";
