//! `localStorage`-backed settings

use stow_core::{SettingsError, SettingsStore};
use web_sys::Storage;

use crate::error::{IdbError, Result};

/// Settings kept in the window's `localStorage`.
#[derive(Debug, Clone)]
pub struct LocalStorageSettings {
    storage: Storage,
}

impl LocalStorageSettings {
    /// Settings over `window.localStorage`.
    pub fn new() -> Result<Self> {
        let window =
            web_sys::window().ok_or_else(|| IdbError::NotAvailable("no window".into()))?;
        let storage = window
            .local_storage()?
            .ok_or_else(|| IdbError::NotAvailable("localStorage is disabled".into()))?;
        Ok(Self { storage })
    }
}

impl SettingsStore for LocalStorageSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.storage.get_item(key).ok().flatten()
    }

    fn set(&self, key: &str, value: &str) -> std::result::Result<(), SettingsError> {
        self.storage
            .set_item(key, value)
            .map_err(|e| SettingsError::Write {
                key: key.to_string(),
                reason: IdbError::from(e).to_string(),
            })
    }
}
