//! Durable key/value settings
//!
//! The client remembers the selected database name and the last version
//! used per database in two small entries that survive reloads. In the
//! browser these live in `localStorage`; elsewhere any [`SettingsStore`]
//! will do.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use thiserror::Error;
use tracing::warn;

/// Errors writing a setting
#[derive(Debug, Clone, Error)]
pub enum SettingsError {
    /// The backing storage is missing
    #[error("settings storage not available: {0}")]
    NotAvailable(String),

    /// The write was rejected (quota, privacy mode, ...)
    #[error("failed to write setting '{key}': {reason}")]
    Write { key: String, reason: String },
}

/// Small string key/value storage that survives reloads.
pub trait SettingsStore {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError>;
}

/// In-memory settings. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemorySettings {
    entries: Rc<RefCell<HashMap<String, String>>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create settings pre-populated with `entries`.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let settings = Self::new();
        settings.entries.borrow_mut().extend(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value.into())),
        );
        settings
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Read the database name → version map stored under `key`.
///
/// A missing or malformed entry reads as an empty map.
pub fn load_versions<S: SettingsStore + ?Sized>(settings: &S, key: &str) -> BTreeMap<String, u32> {
    let Some(raw) = settings.get(key) else {
        return BTreeMap::new();
    };
    match serde_json::from_str(&raw) {
        Ok(versions) => versions,
        Err(e) => {
            warn!("ignoring malformed version map in '{}': {}", key, e);
            BTreeMap::new()
        }
    }
}

/// Record `version` for `database` in the map stored under `key`.
pub fn save_version<S: SettingsStore + ?Sized>(
    settings: &S,
    key: &str,
    database: &str,
    version: u32,
) -> Result<(), SettingsError> {
    let mut versions = load_versions(settings, key);
    if versions.get(database) == Some(&version) {
        return Ok(());
    }
    versions.insert(database.to_string(), version);
    let json = serde_json::to_string(&versions).map_err(|e| SettingsError::Write {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    settings.set(key, &json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_roundtrip_through_json() {
        let settings = MemorySettings::new();
        save_version(&settings, "versions", "notes", 3).unwrap();
        save_version(&settings, "versions", "files", 1).unwrap();

        assert_eq!(
            settings.get("versions").as_deref(),
            Some(r#"{"files":1,"notes":3}"#)
        );
        let versions = load_versions(&settings, "versions");
        assert_eq!(versions.get("notes"), Some(&3));
    }

    #[test]
    fn test_malformed_versions_read_as_empty() {
        let settings = MemorySettings::with_entries([("versions", "not json")]);
        assert!(load_versions(&settings, "versions").is_empty());
    }

    #[test]
    fn test_clones_share_entries() {
        let settings = MemorySettings::new();
        let other = settings.clone();
        settings.set("a", "1").unwrap();
        assert_eq!(other.get("a").as_deref(), Some("1"));
    }
}
