//! Persistent storage layer.
//!
//! One embedded sled database with a tree per concern:
//!
//! - `trips` — trip documents, advanced only through compare-and-set
//! - `accounts` / `transfers` / `pending_transfers` — the double-entry ledger
//! - `captains` — captain profiles
//! - `ride_settings` — the persisted dispatch settings singleton
//!
//! Values are JSON-serialized documents. Sled provides durability via
//! background flushing; on crash at most the last few writes may be lost,
//! and the dispatch supervisor re-derives in-flight state from the trip
//! documents on startup.

pub mod captains;
pub mod ledger;
pub mod settings;
pub mod trips;

pub use captains::{check_eligibility, CaptainDirectory, EligibilityService};
pub use ledger::{
    AccountKind, Ledger, LedgerError, MoneyTransfer, Party, PartyRole, TransferKind,
    TransferStatus,
};
pub use settings::SettingsRepo;
pub use trips::{
    DriverExpectation, MemoryTripStore, SledTripStore, TripPatch, TripPreconditions, TripStore,
};

use std::path::Path;
use std::sync::Arc;

use tracing::info;

/// Storage errors shared by the sled-backed stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not found")]
    NotFound,
    /// Preconditions did not hold at commit time.
    #[error("compare-and-set conflict")]
    CasConflict,
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Handle bundling every persistent store over one sled database.
#[derive(Clone)]
pub struct Storage {
    pub trips: Arc<SledTripStore>,
    pub ledger: Arc<Ledger>,
    pub captains: Arc<CaptainDirectory>,
    pub settings: Arc<SettingsRepo>,
}

impl Storage {
    /// Open (or create) the database at `path` and all trees.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        let storage = Self {
            trips: Arc::new(SledTripStore::new(db.open_tree("trips")?)),
            ledger: Arc::new(Ledger::new(
                db.open_tree("accounts")?,
                db.open_tree("transfers")?,
                db.open_tree("pending_transfers")?,
            )),
            captains: Arc::new(CaptainDirectory::new(db.open_tree("captains")?)),
            settings: Arc::new(SettingsRepo::new(db.open_tree("ride_settings")?)),
        };
        info!(path = %path.as_ref().display(), "Storage opened");
        Ok(storage)
    }
}
