//! Persisted dispatch settings: the `ride_settings` singleton.
//!
//! A single row named `default` holding the serialized [`DispatchSettings`].
//! On startup the persisted row (if any) overrides the config file, so
//! runtime changes made through the settings endpoint survive restarts.

use tracing::info;

use super::StoreError;
use crate::config::DispatchSettings;

const SINGLETON_KEY: &str = "default";

pub struct SettingsRepo {
    tree: sled::Tree,
}

impl SettingsRepo {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    /// The persisted settings row, if one was ever saved.
    pub fn load(&self) -> Result<Option<DispatchSettings>, StoreError> {
        let Some(bytes) = self.tree.get(SINGLETON_KEY.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Replace the persisted row.
    pub fn save(&self, settings: &DispatchSettings) -> Result<(), StoreError> {
        self.tree
            .insert(SINGLETON_KEY.as_bytes(), serde_json::to_vec(settings)?)?;
        info!("Dispatch settings persisted");
        Ok(())
    }
}
