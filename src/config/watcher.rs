//! Polling-based config file watcher.
//!
//! Checks the config file's mtime every 2 seconds. When a change is
//! detected, debounces for 500ms (editors often write in stages), reloads
//! and validates the file, swaps the live dispatch settings, and reports
//! the result on an mpsc channel. The consumer persists the new settings
//! and broadcasts `settingsUpdated` to connected captains; the watcher
//! itself stays decoupled from the realtime layer.
//!
//! A reload that fails validation keeps the previous settings active.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{AppConfig, DispatchSettings, SettingsHandle};

/// Interval between mtime checks.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Debounce delay after detecting a change.
const DEBOUNCE_DELAY: Duration = Duration::from_millis(500);

/// One field that changed in a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingChange {
    pub key: &'static str,
    pub old: String,
    pub new: String,
}

impl std::fmt::Display for SettingChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} -> {}", self.key, self.old, self.new)
    }
}

/// Events emitted by the config watcher.
#[derive(Debug)]
pub enum SettingsEvent {
    /// Settings were reloaded and swapped live, with these changes.
    Reloaded(Vec<SettingChange>),
    /// Reload was attempted but failed (old settings remain active).
    Error(String),
}

/// Field-by-field diff of two settings generations.
pub fn diff_settings(old: &DispatchSettings, new: &DispatchSettings) -> Vec<SettingChange> {
    let mut changes = Vec::new();
    let mut push = |key: &'static str, old: String, new: String| {
        if old != new {
            changes.push(SettingChange { key, old, new });
        }
    };
    push("initialRadiusKm", old.initial_radius_km.to_string(), new.initial_radius_km.to_string());
    push("maxRadiusKm", old.max_radius_km.to_string(), new.max_radius_km.to_string());
    push(
        "radiusIncrementKm",
        old.radius_increment_km.to_string(),
        new.radius_increment_km.to_string(),
    );
    push(
        "notificationTimeoutSec",
        old.notification_timeout_sec.to_string(),
        new.notification_timeout_sec.to_string(),
    );
    push(
        "maxDispatchTimeSec",
        old.max_dispatch_time_sec.to_string(),
        new.max_dispatch_time_sec.to_string(),
    );
    push(
        "graceAfterMaxRadiusSec",
        old.grace_after_max_radius_sec.to_string(),
        new.grace_after_max_radius_sec.to_string(),
    );
    push("maxQueueLength", old.max_queue_length.to_string(), new.max_queue_length.to_string());
    push(
        "queueProcessingDelayMs",
        old.queue_processing_delay_ms.to_string(),
        new.queue_processing_delay_ms.to_string(),
    );
    push(
        "queueTimeoutMultiplier",
        old.queue_timeout_multiplier.to_string(),
        new.queue_timeout_multiplier.to_string(),
    );
    push("minRating", old.min_rating.to_string(), new.min_rating.to_string());
    push(
        "minWalletBalance",
        old.min_wallet_balance.to_string(),
        new.min_wallet_balance.to_string(),
    );
    push("maxActiveRides", old.max_active_rides.to_string(), new.max_active_rides.to_string());
    push(
        "mainVaultDeductionRate",
        old.main_vault_deduction_rate.to_string(),
        new.main_vault_deduction_rate.to_string(),
    );
    push("commissionRate", old.commission_rate.to_string(), new.commission_rate.to_string());
    push(
        "pendingTransferRetrySec",
        old.pending_transfer_retry_sec.to_string(),
        new.pending_transfer_retry_sec.to_string(),
    );
    push("baseFare", old.base_fare.to_string(), new.base_fare.to_string());
    push("pricePerKm", old.price_per_km.to_string(), new.price_per_km.to_string());
    push("minRidePrice", old.min_ride_price.to_string(), new.min_ride_price.to_string());
    push("maxRidePrice", old.max_ride_price.to_string(), new.max_ride_price.to_string());
    push("currency", old.currency.clone(), new.currency.clone());
    push(
        "locationExpirySec",
        old.location_expiry_sec.to_string(),
        new.location_expiry_sec.to_string(),
    );
    push(
        "maxTrackingSessions",
        old.max_tracking_sessions.to_string(),
        new.max_tracking_sessions.to_string(),
    );
    changes
}

fn get_mtime(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Run the config file watcher loop until cancelled.
pub async fn run_config_watcher(
    path: PathBuf,
    settings: SettingsHandle,
    tx: mpsc::Sender<SettingsEvent>,
    cancel: CancellationToken,
) {
    info!(path = %path.display(), "Config watcher started");
    let mut last_mtime = get_mtime(&path);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let current = match get_mtime(&path) {
            Some(t) => t,
            None => {
                // Only warn once when the file disappears; keep polling.
                if last_mtime.is_some() {
                    warn!(
                        path = %path.display(),
                        "Config file not accessible, keeping current settings"
                    );
                    last_mtime = None;
                }
                continue;
            }
        };

        let changed = match last_mtime {
            Some(prev) => current != prev,
            None => true,
        };
        if !changed {
            continue;
        }

        // Debounce: wait, then re-check that the write has settled.
        tokio::time::sleep(DEBOUNCE_DELAY).await;
        if get_mtime(&path) != Some(current) {
            continue;
        }
        last_mtime = Some(current);

        let event = match reload(&path, &settings) {
            Ok(changes) if changes.is_empty() => continue,
            Ok(changes) => SettingsEvent::Reloaded(changes),
            Err(err) => {
                error!(error = %err, "Config hot-reload failed, keeping previous settings");
                SettingsEvent::Error(err)
            }
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
    info!("Config watcher stopped");
}

/// Parse, validate, diff and swap. Returns the applied changes.
fn reload(path: &PathBuf, settings: &SettingsHandle) -> Result<Vec<SettingChange>, String> {
    let path_str = path.to_string_lossy();
    let config = AppConfig::load_from(&path_str).map_err(|e| e.to_string())?;
    let current = settings.current();
    let changes = diff_settings(&current, &config.dispatch);
    if !changes.is_empty() {
        settings.swap(config.dispatch);
        for change in &changes {
            info!(change = %change, "Dispatch setting reloaded");
        }
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_reports_only_changed_fields() {
        let old = DispatchSettings::default();
        let mut new = DispatchSettings::default();
        new.max_queue_length = 5;
        new.commission_rate = 0.10;
        let changes = diff_settings(&old, &new);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().any(|c| c.key == "maxQueueLength" && c.new == "5"));
        assert!(changes.iter().any(|c| c.key == "commissionRate" && c.new == "0.1"));
    }

    #[test]
    fn identical_settings_diff_empty() {
        let settings = DispatchSettings::default();
        assert!(diff_settings(&settings, &settings.clone()).is_empty());
    }

    #[test]
    fn reload_swaps_valid_file_and_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.toml");
        let handle = SettingsHandle::new(DispatchSettings::default());

        std::fs::write(&path, "[dispatch]\nmaxQueueLength = 7\n").unwrap();
        let changes = reload(&path, &handle).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(handle.current().max_queue_length, 7);

        // Out-of-range file: error, live settings untouched.
        std::fs::write(&path, "[dispatch]\nnotificationTimeoutSec = 2\n").unwrap();
        assert!(reload(&path, &handle).is_err());
        assert_eq!(handle.current().notification_timeout_sec, 15);
        assert_eq!(handle.current().max_queue_length, 7);
    }
}
