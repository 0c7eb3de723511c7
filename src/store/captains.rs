//! Captain directory: persisted profiles and the eligibility predicate.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use super::{Ledger, LedgerError, Party, StoreError, TripStore};
use crate::config::{DispatchSettings, SettingsHandle};
use crate::error::DispatchError;
use crate::types::{CaptainProfile, EligibilityFailure};

/// Sled-backed captain profiles, keyed by captain id.
pub struct CaptainDirectory {
    tree: sled::Tree,
}

impl CaptainDirectory {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    pub fn get(&self, captain_id: &str) -> Result<Option<CaptainProfile>, StoreError> {
        let Some(bytes) = self.tree.get(captain_id.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn upsert(&self, profile: &CaptainProfile) -> Result<(), StoreError> {
        self.tree
            .insert(profile.id.as_bytes(), serde_json::to_vec(profile)?)?;
        Ok(())
    }

    /// Flip the operator activity flag, stamping `last_active_at`.
    pub fn set_active(&self, captain_id: &str, active: bool) -> Result<(), StoreError> {
        let mut profile = self.get(captain_id)?.ok_or(StoreError::NotFound)?;
        profile.is_active = active;
        profile.last_active_at = Some(Utc::now());
        self.upsert(&profile)
    }

    /// Stamp `last_active_at` without touching the operator flag.
    pub fn touch(&self, captain_id: &str) -> Result<(), StoreError> {
        let mut profile = self.get(captain_id)?.ok_or(StoreError::NotFound)?;
        profile.last_active_at = Some(Utc::now());
        self.upsert(&profile)
    }

    pub fn list(&self) -> Result<Vec<CaptainProfile>, StoreError> {
        let mut out = Vec::new();
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }
}

/// Public view of a profile exposed on passenger events, without the
/// operational flags.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverInfo {
    pub id: String,
    pub name: String,
    pub phone_number: String,
    pub rating: f64,
}

impl From<&CaptainProfile> for DriverInfo {
    fn from(profile: &CaptainProfile) -> Self {
        Self {
            id: profile.id.clone(),
            name: profile.name.clone(),
            phone_number: profile.phone_number.clone(),
            rating: profile.rating,
        }
    }
}

/// The eligibility predicate.
///
/// Pure over its inputs so every caller (dispatcher candidate filter, queue
/// pop re-check, acceptance guard) applies exactly the same rule. Wallet
/// balance comes from the ledger, active-ride count from the trip store.
pub fn check_eligibility(
    profile: &CaptainProfile,
    wallet_balance: i64,
    active_rides: usize,
    settings: &DispatchSettings,
) -> Result<(), EligibilityFailure> {
    if !profile.is_active {
        return Err(EligibilityFailure::Inactive);
    }
    if !profile.is_verified {
        return Err(EligibilityFailure::Unverified);
    }
    if profile.rating < settings.min_rating {
        return Err(EligibilityFailure::RatingBelowMinimum);
    }
    if wallet_balance < settings.min_wallet_balance {
        return Err(EligibilityFailure::WalletBelowMinimum);
    }
    if active_rides >= settings.max_active_rides {
        return Err(EligibilityFailure::TooManyActiveRides);
    }
    Ok(())
}

/// Eligibility evaluation over live stores.
///
/// One service so the dispatcher candidate filter, the queue pop re-check
/// and the acceptance guard all read the same profile, wallet and
/// active-ride inputs.
pub struct EligibilityService {
    directory: Arc<CaptainDirectory>,
    ledger: Arc<Ledger>,
    trips: Arc<dyn TripStore>,
    settings: SettingsHandle,
}

impl EligibilityService {
    pub fn new(
        directory: Arc<CaptainDirectory>,
        ledger: Arc<Ledger>,
        trips: Arc<dyn TripStore>,
        settings: SettingsHandle,
    ) -> Self {
        Self { directory, ledger, trips, settings }
    }

    /// Evaluate the full predicate for one captain.
    pub fn check(&self, captain_id: &str) -> Result<(), DispatchError> {
        let profile = self
            .directory
            .get(captain_id)?
            .ok_or(DispatchError::NotEligible(EligibilityFailure::UnknownCaptain))?;
        let balance = self.ledger.balance(&Party::captain(captain_id))?;
        let active = self.trips.active_ride_count(captain_id)?;
        let settings = self.settings.current();
        check_eligibility(&profile, balance, active, &settings)
            .map_err(DispatchError::NotEligible)
    }

    pub fn profile(&self, captain_id: &str) -> Result<Option<CaptainProfile>, StoreError> {
        self.directory.get(captain_id)
    }

    pub fn wallet_balance(&self, captain_id: &str) -> Result<i64, LedgerError> {
        self.ledger.balance(&Party::captain(captain_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> CaptainProfile {
        CaptainProfile {
            id: "c1".to_owned(),
            name: "Ali".to_owned(),
            phone_number: "+9647700000001".to_owned(),
            rating: 4.6,
            is_active: true,
            is_verified: true,
            last_active_at: None,
        }
    }

    #[test]
    fn eligible_captain_passes() {
        let settings = DispatchSettings::default();
        assert!(check_eligibility(&profile(), 1000, 0, &settings).is_ok());
    }

    #[test]
    fn each_gate_fails_with_its_reason() {
        let settings = DispatchSettings::default();

        let mut p = profile();
        p.is_active = false;
        assert_eq!(
            check_eligibility(&p, 1000, 0, &settings),
            Err(EligibilityFailure::Inactive)
        );

        let mut p = profile();
        p.is_verified = false;
        assert_eq!(
            check_eligibility(&p, 1000, 0, &settings),
            Err(EligibilityFailure::Unverified)
        );

        let mut p = profile();
        p.rating = 3.0;
        assert_eq!(
            check_eligibility(&p, 1000, 0, &settings),
            Err(EligibilityFailure::RatingBelowMinimum)
        );

        assert_eq!(
            check_eligibility(&profile(), -1, 0, &settings),
            Err(EligibilityFailure::WalletBelowMinimum)
        );

        assert_eq!(
            check_eligibility(&profile(), 1000, 1, &settings),
            Err(EligibilityFailure::TooManyActiveRides)
        );
    }

    #[test]
    fn directory_roundtrip_and_set_active() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        std::mem::forget(dir);
        let directory = CaptainDirectory::new(db.open_tree("captains").unwrap());

        directory.upsert(&profile()).unwrap();
        assert_eq!(directory.get("c1").unwrap().unwrap().name, "Ali");

        directory.set_active("c1", false).unwrap();
        let stored = directory.get("c1").unwrap().unwrap();
        assert!(!stored.is_active);
        assert!(stored.last_active_at.is_some());

        assert!(matches!(
            directory.set_active("missing", true),
            Err(StoreError::NotFound)
        ));
    }
}
