//! Application configuration.
//!
//! Replaces hardcoded dispatch parameters with operator-tunable values.
//!
//! ## Loading Order
//!
//! 1. `TARHAL_CONFIG` environment variable (path to TOML file)
//! 2. `dispatch.toml` in the current working directory
//! 3. Built-in defaults
//!
//! A configuration that fails range validation is a fatal startup error:
//! the service refuses to accept traffic rather than dispatch with broken
//! radii or timeouts. After startup, the persisted `ride_settings` row (if
//! any) overrides the file and the `[dispatch]` section becomes mutable at
//! runtime through [`SettingsHandle`] — an `ArcSwap`, so readers on the hot
//! path never take a lock.

pub mod defaults;
mod settings;
pub mod validation;
pub mod watcher;

pub use settings::{AppConfig, DispatchSettings, ServerConfig};

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{info, warn};

use validation::{validate_ranges, validate_unknown_keys, RangeViolation};

/// Default config file name, next to the working directory.
const CONFIG_FILE: &str = "dispatch.toml";
/// Environment variable overriding the config file path.
const CONFIG_ENV: &str = "TARHAL_CONFIG";

/// Errors produced while loading or applying configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {}", format_violations(.0))]
    Invalid(Vec<RangeViolation>),
}

fn format_violations(violations: &[RangeViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// The config file path after applying the env override.
pub fn config_path() -> String {
    std::env::var(CONFIG_ENV).unwrap_or_else(|_| CONFIG_FILE.to_owned())
}

impl AppConfig {
    /// Load the configuration following the documented precedence.
    ///
    /// Missing file is not an error (defaults apply); an unreadable,
    /// unparseable, or out-of-range file is.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path();
        if !Path::new(&path).exists() {
            info!(path = %path, "No config file found, using built-in defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load and validate a specific config file.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;

        for warning in validate_unknown_keys(&raw) {
            warn!(field = %warning.field, "Config warning: {warning}");
        }

        let config: Self = toml::from_str(&raw)?;
        config.dispatch.validated()?;
        info!(path = %path, "Configuration loaded");
        Ok(config)
    }
}

impl DispatchSettings {
    /// Fail-closed range validation.
    pub fn validated(&self) -> Result<(), ConfigError> {
        let violations = validate_ranges(self);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(violations))
        }
    }
}

// ============================================================================
// Runtime handle
// ============================================================================

/// Shared, swappable handle to the live dispatch settings.
///
/// Readers call [`current()`](Self::current) per decision point and hold the
/// returned `Arc` for the duration of that decision, so one operation never
/// observes two different generations of settings.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<ArcSwap<DispatchSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: DispatchSettings) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    /// Snapshot of the live settings.
    pub fn current(&self) -> Arc<DispatchSettings> {
        self.inner.load_full()
    }

    /// Replace the live settings. Caller is responsible for validation and
    /// for broadcasting the change to connected captains.
    pub fn swap(&self, settings: DispatchSettings) {
        self.inner.store(Arc::new(settings));
    }
}

impl std::fmt::Debug for SettingsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsHandle").finish_non_exhaustive()
    }
}
