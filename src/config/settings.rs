//! Typed application configuration loaded from TOML.
//!
//! Layout mirrors the config file sections:
//!
//! ```toml
//! [server]
//! addr = "0.0.0.0:8080"
//! data_dir = "./data"
//!
//! [dispatch]
//! initial_radius_km = 2.0
//! max_radius_km = 10.0
//! ...
//! ```
//!
//! The `[dispatch]` block — [`DispatchSettings`] — is the runtime-mutable
//! part: it is persisted as the `ride_settings` singleton, swappable through
//! the settings endpoint, and broadcast to connected captains on change.

use serde::{Deserialize, Serialize};

use super::defaults;

// ============================================================================
// Top-level file
// ============================================================================

/// Whole configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

/// `[server]` section: process-level, immutable after startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_addr() -> String {
    defaults::SERVER_ADDR.to_owned()
}

fn default_data_dir() -> String {
    defaults::DATA_DIR.to_owned()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            data_dir: default_data_dir(),
        }
    }
}

// ============================================================================
// Dispatch settings (runtime-mutable)
// ============================================================================

/// `[dispatch]` section: every operator-tunable dispatch parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DispatchSettings {
    // --- radius & timing ---
    #[serde(default = "d_initial_radius_km")]
    pub initial_radius_km: f64,
    #[serde(default = "d_max_radius_km")]
    pub max_radius_km: f64,
    #[serde(default = "d_radius_increment_km")]
    pub radius_increment_km: f64,
    #[serde(default = "d_notification_timeout_sec")]
    pub notification_timeout_sec: u64,
    #[serde(default = "d_max_dispatch_time_sec")]
    pub max_dispatch_time_sec: u64,
    #[serde(default = "d_grace_after_max_radius_sec")]
    pub grace_after_max_radius_sec: u64,

    // --- captain queue ---
    #[serde(default = "d_max_queue_length")]
    pub max_queue_length: usize,
    #[serde(default = "d_queue_processing_delay_ms")]
    pub queue_processing_delay_ms: u64,
    #[serde(default = "d_queue_timeout_multiplier")]
    pub queue_timeout_multiplier: f64,

    // --- eligibility ---
    #[serde(default = "d_min_rating")]
    pub min_rating: f64,
    #[serde(default = "d_min_wallet_balance")]
    pub min_wallet_balance: i64,
    #[serde(default = "d_max_active_rides")]
    pub max_active_rides: usize,

    // --- payment ---
    #[serde(default = "d_main_vault_deduction_rate")]
    pub main_vault_deduction_rate: f64,
    #[serde(default = "d_commission_rate")]
    pub commission_rate: f64,
    #[serde(default = "d_pending_transfer_retry_sec")]
    pub pending_transfer_retry_sec: u64,

    // --- pricing clamps (minor units) ---
    #[serde(default = "d_base_fare")]
    pub base_fare: i64,
    #[serde(default = "d_price_per_km")]
    pub price_per_km: i64,
    #[serde(default = "d_min_ride_price")]
    pub min_ride_price: i64,
    #[serde(default = "d_max_ride_price")]
    pub max_ride_price: i64,
    #[serde(default = "d_currency")]
    pub currency: String,

    // --- admin tracking ---
    #[serde(default = "d_location_expiry_sec")]
    pub location_expiry_sec: u64,
    #[serde(default = "d_max_tracking_sessions")]
    pub max_tracking_sessions: usize,
}

fn d_initial_radius_km() -> f64 {
    defaults::INITIAL_RADIUS_KM
}
fn d_max_radius_km() -> f64 {
    defaults::MAX_RADIUS_KM
}
fn d_radius_increment_km() -> f64 {
    defaults::RADIUS_INCREMENT_KM
}
fn d_notification_timeout_sec() -> u64 {
    defaults::NOTIFICATION_TIMEOUT_SEC
}
fn d_max_dispatch_time_sec() -> u64 {
    defaults::MAX_DISPATCH_TIME_SEC
}
fn d_grace_after_max_radius_sec() -> u64 {
    defaults::GRACE_AFTER_MAX_RADIUS_SEC
}
fn d_max_queue_length() -> usize {
    defaults::MAX_QUEUE_LENGTH
}
fn d_queue_processing_delay_ms() -> u64 {
    defaults::QUEUE_PROCESSING_DELAY_MS
}
fn d_queue_timeout_multiplier() -> f64 {
    defaults::QUEUE_TIMEOUT_MULTIPLIER
}
fn d_min_rating() -> f64 {
    defaults::MIN_RATING
}
fn d_min_wallet_balance() -> i64 {
    defaults::MIN_WALLET_BALANCE
}
fn d_max_active_rides() -> usize {
    defaults::MAX_ACTIVE_RIDES
}
fn d_main_vault_deduction_rate() -> f64 {
    defaults::MAIN_VAULT_DEDUCTION_RATE
}
fn d_commission_rate() -> f64 {
    defaults::COMMISSION_RATE
}
fn d_pending_transfer_retry_sec() -> u64 {
    defaults::PENDING_TRANSFER_RETRY_SECS
}
fn d_base_fare() -> i64 {
    defaults::BASE_FARE
}
fn d_price_per_km() -> i64 {
    defaults::PRICE_PER_KM
}
fn d_min_ride_price() -> i64 {
    defaults::MIN_RIDE_PRICE
}
fn d_max_ride_price() -> i64 {
    defaults::MAX_RIDE_PRICE
}
fn d_currency() -> String {
    defaults::CURRENCY.to_owned()
}
fn d_location_expiry_sec() -> u64 {
    defaults::LOCATION_EXPIRY_SEC
}
fn d_max_tracking_sessions() -> usize {
    defaults::MAX_TRACKING_SESSIONS
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            initial_radius_km: d_initial_radius_km(),
            max_radius_km: d_max_radius_km(),
            radius_increment_km: d_radius_increment_km(),
            notification_timeout_sec: d_notification_timeout_sec(),
            max_dispatch_time_sec: d_max_dispatch_time_sec(),
            grace_after_max_radius_sec: d_grace_after_max_radius_sec(),
            max_queue_length: d_max_queue_length(),
            queue_processing_delay_ms: d_queue_processing_delay_ms(),
            queue_timeout_multiplier: d_queue_timeout_multiplier(),
            min_rating: d_min_rating(),
            min_wallet_balance: d_min_wallet_balance(),
            max_active_rides: d_max_active_rides(),
            main_vault_deduction_rate: d_main_vault_deduction_rate(),
            commission_rate: d_commission_rate(),
            pending_transfer_retry_sec: d_pending_transfer_retry_sec(),
            base_fare: d_base_fare(),
            price_per_km: d_price_per_km(),
            min_ride_price: d_min_ride_price(),
            max_ride_price: d_max_ride_price(),
            currency: d_currency(),
            location_expiry_sec: d_location_expiry_sec(),
            max_tracking_sessions: d_max_tracking_sessions(),
        }
    }
}

impl DispatchSettings {
    /// Effective queue timeout multiplier, hard-capped at 2x.
    pub fn effective_queue_timeout_multiplier(&self) -> f64 {
        self.queue_timeout_multiplier
            .min(defaults::QUEUE_TIMEOUT_MULTIPLIER_CAP)
    }

    /// Upper bound on the trip's whole dispatch attempt, after which the
    /// supervisor rejects it outright.
    pub fn dispatch_deadline_secs(&self) -> u64 {
        self.max_dispatch_time_sec + self.grace_after_max_radius_sec
    }
}
