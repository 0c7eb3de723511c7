//! Per-trip notified-set bookkeeping.
//!
//! Two sets per trip: everyone notified at any radius (drives avoidance and
//! the terminal hide-ride fan-out) and everyone notified at the current
//! radius only (drives the `expanding` hide-ride between passes).

use std::collections::HashSet;

use crate::types::CaptainId;

#[derive(Debug, Default)]
pub struct RideNotificationTracking {
    global: HashSet<CaptainId>,
    current_radius: HashSet<CaptainId>,
}

impl RideNotificationTracking {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a notification at the current radius.
    pub fn record(&mut self, captain_id: &str) {
        self.global.insert(captain_id.to_owned());
        self.current_radius.insert(captain_id.to_owned());
    }

    pub fn was_notified(&self, captain_id: &str) -> bool {
        self.global.contains(captain_id)
    }

    /// Captains to hide from when expanding past the current radius. The
    /// returned set is drained; the global set keeps them for avoidance.
    pub fn drain_current_radius(&mut self) -> Vec<CaptainId> {
        self.current_radius.drain().collect()
    }

    /// Everyone notified over the trip's lifetime.
    pub fn all_notified(&self) -> Vec<CaptainId> {
        self.global.iter().cloned().collect()
    }

    /// Everyone except the accepting captain (ride-taken fan-out).
    pub fn all_notified_except(&self, captain_id: &str) -> Vec<CaptainId> {
        self.global
            .iter()
            .filter(|id| id.as_str() != captain_id)
            .cloned()
            .collect()
    }

    pub fn notified_count(&self) -> usize {
        self.global.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_keeps_global_set() {
        let mut tracking = RideNotificationTracking::new();
        tracking.record("c1");
        tracking.record("c2");
        let mut drained = tracking.drain_current_radius();
        drained.sort();
        assert_eq!(drained, vec!["c1", "c2"]);
        assert!(tracking.was_notified("c1"));
        assert!(tracking.drain_current_radius().is_empty());
        assert_eq!(tracking.notified_count(), 2);
    }

    #[test]
    fn except_filters_the_accepter() {
        let mut tracking = RideNotificationTracking::new();
        tracking.record("c1");
        tracking.record("c2");
        let others = tracking.all_notified_except("c1");
        assert_eq!(others, vec!["c2"]);
    }
}
