//! Schema upgrades and connection lifecycle logging
//!
//! [`SchemaUpgrade`] is handed to the engine on every open. When the engine
//! reports that the requested version is newer than the stored one, every
//! registered template whose store does not exist yet is created together
//! with its indexes. Existing stores are left untouched: no index migration,
//! no store removal.

use tracing::{error, info, warn};

use crate::engine::{Connection, ConnectionEvents};
use crate::logging::prefix;
use crate::schema::StoreTemplate;

/// Connection hooks for one open request.
#[derive(Debug, Clone, Default)]
pub struct SchemaUpgrade {
    templates: Vec<(String, StoreTemplate)>,
}

impl SchemaUpgrade {
    pub fn new(templates: Vec<(String, StoreTemplate)>) -> Self {
        Self { templates }
    }

    /// Create every missing store. A failure for one store is logged and the
    /// rest are still attempted. Returns the names created.
    pub fn apply(&self, connection: &dyn Connection) -> Vec<String> {
        let existing = connection.store_names();
        let mut created = Vec::new();

        for (name, template) in &self.templates {
            if existing.iter().any(|s| s == name) {
                continue;
            }
            match connection.create_object_store(name, &template.store_params()) {
                Ok(()) => {
                    info!(
                        "{} created store '{}' in '{}' ({} indexes)",
                        prefix::DB,
                        name,
                        connection.name(),
                        template.index_defs().len()
                    );
                    created.push(name.clone());
                }
                Err(e) => error!(
                    "{} failed to create store '{}' in '{}': {}",
                    prefix::DB,
                    name,
                    connection.name(),
                    e
                ),
            }
        }
        created
    }
}

impl ConnectionEvents for SchemaUpgrade {
    fn upgrade_needed(&self, connection: &dyn Connection, old_version: u32, new_version: u32) {
        info!(
            "{} upgrading '{}' from v{} to v{}",
            prefix::DB,
            connection.name(),
            old_version,
            new_version
        );
        self.apply(connection);
    }

    fn blocked(&self, old_version: u32, new_version: Option<u32>) {
        warn!(
            "{} open blocked: v{} is still open elsewhere (requested {:?}); close other tabs using this database",
            prefix::DB,
            old_version,
            new_version
        );
    }

    fn version_change(&self, connection: &dyn Connection, old_version: u32, new_version: Option<u32>) {
        warn!(
            "{} '{}' v{} is being changed to {:?} by another session",
            prefix::DB,
            connection.name(),
            old_version,
            new_version
        );
        self.apply(connection);
    }

    fn closed(&self, connection: &dyn Connection) {
        warn!("{} '{}' was closed unexpectedly", prefix::DB, connection.name());
    }

    fn error(&self, connection: &dyn Connection, message: &str) {
        error!("{} '{}' error: {}", prefix::DB, connection.name(), message);
    }

    fn abort(&self, connection: &dyn Connection, message: &str) {
        warn!("{} '{}' transaction aborted: {}", prefix::DB, connection.name(), message);
    }
}
