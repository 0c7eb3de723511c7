//! Config validation: unknown-key detection with Levenshtein suggestions
//! and range checks on the dispatch settings.
//!
//! Two-pass parse approach: first deserialize raw TOML into `toml::Value`,
//! walk the key tree, compare against known field names, and emit warnings
//! with "did you mean?" suggestions. Range violations are hard errors — the
//! service fails closed on an invalid configuration rather than dispatching
//! with nonsense radii or timeouts.

use std::collections::HashSet;

use super::settings::DispatchSettings;

/// A non-fatal config warning (typo, suspicious value).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " — did you mean '{s}'?")?;
        }
        Ok(())
    }
}

/// A fatal range violation. The service refuses to start (or to apply a
/// runtime update) while any of these exist.
#[derive(Debug, Clone)]
pub struct RangeViolation {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for RangeViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Complete set of valid dotted key paths for the config file.
///
/// Maintained manually to match the struct hierarchy in settings.rs; any new
/// field added there must be added here too.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [server]
        "server",
        "server.addr",
        "server.data_dir",
        // [dispatch]
        "dispatch",
        "dispatch.initialRadiusKm",
        "dispatch.maxRadiusKm",
        "dispatch.radiusIncrementKm",
        "dispatch.notificationTimeoutSec",
        "dispatch.maxDispatchTimeSec",
        "dispatch.graceAfterMaxRadiusSec",
        "dispatch.maxQueueLength",
        "dispatch.queueProcessingDelayMs",
        "dispatch.queueTimeoutMultiplier",
        "dispatch.minRating",
        "dispatch.minWalletBalance",
        "dispatch.maxActiveRides",
        "dispatch.mainVaultDeductionRate",
        "dispatch.commissionRate",
        "dispatch.pendingTransferRetrySec",
        "dispatch.baseFare",
        "dispatch.pricePerKm",
        "dispatch.minRidePrice",
        "dispatch.maxRidePrice",
        "dispatch.currency",
        "dispatch.locationExpirySec",
        "dispatch.maxTrackingSessions",
    ];
    keys.iter().copied().collect()
}

// ============================================================================
// Unknown-key detection
// ============================================================================

/// Walk the TOML key tree and warn on keys the settings structs don't know.
pub fn validate_unknown_keys(toml_str: &str) -> Vec<ValidationWarning> {
    let value: toml::Value = match toml_str.parse() {
        Ok(v) => v,
        // A syntactically broken file fails later at deserialization; the
        // typo pass only applies to parseable input.
        Err(_) => return Vec::new(),
    };

    let known = known_config_keys();
    let mut warnings = Vec::new();
    walk_keys(&value, "", &known, &mut warnings);
    warnings
}

fn walk_keys(
    value: &toml::Value,
    prefix: &str,
    known: &HashSet<&'static str>,
    warnings: &mut Vec<ValidationWarning>,
) {
    let toml::Value::Table(table) = value else {
        return;
    };
    for (key, child) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        if known.contains(path.as_str()) {
            walk_keys(child, &path, known, warnings);
        } else {
            let suggestion = suggest_correction(&path, known);
            warnings.push(ValidationWarning {
                field: path.clone(),
                message: format!("unknown config key '{path}'"),
                suggestion,
            });
        }
    }
}

/// Suggest the closest known key when the edit distance is small enough.
pub fn suggest_correction(path: &str, known: &HashSet<&'static str>) -> Option<String> {
    let leaf = path.rsplit('.').next().unwrap_or(path);
    known
        .iter()
        .filter_map(|candidate| {
            let cand_leaf = candidate.rsplit('.').next().unwrap_or(candidate);
            let dist = levenshtein(leaf, cand_leaf);
            (dist > 0 && dist <= 2).then_some((dist, *candidate))
        })
        .min_by_key(|(dist, _)| *dist)
        .map(|(_, candidate)| candidate.to_owned())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

// ============================================================================
// Range checks
// ============================================================================

/// Check every dispatch setting against its documented range.
pub fn validate_ranges(s: &DispatchSettings) -> Vec<RangeViolation> {
    let mut violations = Vec::new();
    let mut fail = |field: &str, message: String| {
        violations.push(RangeViolation {
            field: format!("dispatch.{field}"),
            message,
        });
    };

    if !(0.5..=5.0).contains(&s.initial_radius_km) {
        fail(
            "initialRadiusKm",
            format!("{} outside [0.5, 5.0]", s.initial_radius_km),
        );
    }
    if s.max_radius_km < s.initial_radius_km || s.max_radius_km > 50.0 {
        fail(
            "maxRadiusKm",
            format!(
                "{} must be >= initialRadiusKm ({}) and <= 50",
                s.max_radius_km, s.initial_radius_km
            ),
        );
    }
    if s.radius_increment_km <= 0.0 {
        fail(
            "radiusIncrementKm",
            format!("{} must be > 0", s.radius_increment_km),
        );
    }
    if !(5..=60).contains(&s.notification_timeout_sec) {
        fail(
            "notificationTimeoutSec",
            format!("{} outside [5, 60]", s.notification_timeout_sec),
        );
    }
    if !(60..=1800).contains(&s.max_dispatch_time_sec) {
        fail(
            "maxDispatchTimeSec",
            format!("{} outside [60, 1800]", s.max_dispatch_time_sec),
        );
    }
    if !(1..=20).contains(&s.max_queue_length) {
        fail(
            "maxQueueLength",
            format!("{} outside [1, 20]", s.max_queue_length),
        );
    }
    if !(1000..=10_000).contains(&s.queue_processing_delay_ms) {
        fail(
            "queueProcessingDelayMs",
            format!("{} outside [1000, 10000]", s.queue_processing_delay_ms),
        );
    }
    if s.queue_timeout_multiplier < 1.0 {
        fail(
            "queueTimeoutMultiplier",
            format!("{} must be >= 1.0", s.queue_timeout_multiplier),
        );
    }
    if !(0.0..=5.0).contains(&s.min_rating) {
        fail("minRating", format!("{} outside [0, 5]", s.min_rating));
    }
    if s.min_wallet_balance < 0 {
        fail(
            "minWalletBalance",
            format!("{} must be >= 0", s.min_wallet_balance),
        );
    }
    if s.max_active_rides == 0 {
        fail("maxActiveRides", "must be >= 1".to_owned());
    }
    if !(0.0..=1.0).contains(&s.main_vault_deduction_rate) {
        fail(
            "mainVaultDeductionRate",
            format!("{} outside [0, 1]", s.main_vault_deduction_rate),
        );
    }
    if !(0.0..=1.0).contains(&s.commission_rate) {
        fail(
            "commissionRate",
            format!("{} outside [0, 1]", s.commission_rate),
        );
    }
    if s.base_fare < 0 || s.price_per_km < 0 {
        fail("baseFare", "fare components must be >= 0".to_owned());
    }
    if s.min_ride_price < 0 || s.max_ride_price < s.min_ride_price {
        fail(
            "minRidePrice",
            format!(
                "require 0 <= minRidePrice ({}) <= maxRidePrice ({})",
                s.min_ride_price, s.max_ride_price
            ),
        );
    }
    if s.location_expiry_sec == 0 {
        fail("locationExpirySec", "must be >= 1".to_owned());
    }
    if s.max_tracking_sessions == 0 {
        fail("maxTrackingSessions", "must be >= 1".to_owned());
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typo_in_dispatch_key_warns_with_suggestion() {
        let warnings = validate_unknown_keys(
            r#"
[dispatch]
notificationTimoutSec = 20
"#,
        );
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].field.contains("notificationTimoutSec"));
        assert_eq!(
            warnings[0].suggestion.as_deref(),
            Some("dispatch.notificationTimeoutSec")
        );
    }

    #[test]
    fn valid_file_produces_zero_warnings() {
        let warnings = validate_unknown_keys(
            r#"
[server]
addr = "127.0.0.1:9000"

[dispatch]
initialRadiusKm = 2.0
maxQueueLength = 5
"#,
        );
        assert!(warnings.is_empty(), "unexpected: {warnings:?}");
    }

    #[test]
    fn default_settings_pass_range_validation() {
        assert!(validate_ranges(&DispatchSettings::default()).is_empty());
    }

    #[test]
    fn max_radius_below_initial_is_rejected() {
        let mut s = DispatchSettings::default();
        s.initial_radius_km = 4.0;
        s.max_radius_km = 3.0;
        let violations = validate_ranges(&s);
        assert!(violations.iter().any(|v| v.field.contains("maxRadiusKm")));
    }

    #[test]
    fn equal_initial_and_max_radius_is_legal() {
        let mut s = DispatchSettings::default();
        s.initial_radius_km = 4.0;
        s.max_radius_km = 4.0;
        assert!(validate_ranges(&s).is_empty());
    }

    #[test]
    fn notification_timeout_bounds_enforced() {
        let mut s = DispatchSettings::default();
        s.notification_timeout_sec = 4;
        assert!(!validate_ranges(&s).is_empty());
        s.notification_timeout_sec = 61;
        assert!(!validate_ranges(&s).is_empty());
        s.notification_timeout_sec = 5;
        assert!(validate_ranges(&s).is_empty());
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("abc", "abc"), 0);
        assert_eq!(levenshtein("abc", "abd"), 1);
        assert_eq!(levenshtein("maxRadius", "maxRadiusKm"), 2);
    }
}
