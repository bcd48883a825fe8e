//! Client configuration

use serde::{Deserialize, Serialize};

/// Database name used when nothing has ever been selected.
pub const DEFAULT_DATABASE: &str = "stow";

/// Schema version used when no version is known for a database.
pub const DEFAULT_VERSION: u32 = 1;

/// Settings for a [`crate::StorageClient`].
///
/// All fields have defaults, so partial JSON is accepted:
///
/// ```rust
/// use stow_core::ClientConfig;
///
/// let config = ClientConfig::from_json(r#"{"default_database": "notes"}"#).unwrap();
/// assert_eq!(config.default_database, "notes");
/// assert_eq!(config.default_version, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Database opened when none was chosen with `set_database`
    pub default_database: String,
    /// Version used when none was given or persisted
    pub default_version: u32,
    /// Settings key holding the selected database name (raw string)
    pub database_key: String,
    /// Settings key holding the JSON map of database name to version
    pub versions_key: String,
    /// Log each store's key path and indexes the first time it is used
    pub log_store_metadata: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_database: DEFAULT_DATABASE.to_string(),
            default_version: DEFAULT_VERSION,
            database_key: "stow.database".to_string(),
            versions_key: "stow.versions".to_string(),
            log_store_metadata: true,
        }
    }
}

impl ClientConfig {
    /// Parse a configuration from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_is_default() {
        assert_eq!(ClientConfig::from_json("{}").unwrap(), ClientConfig::default());
    }

    #[test]
    fn test_invalid_json() {
        assert!(ClientConfig::from_json(r#"{"default_version": "two"}"#).is_err());
    }
}
