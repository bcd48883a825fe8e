//! Storage client: schema registry plus the single active connection
//!
//! A [`StorageClient`] owns everything a page needs to talk to one object
//! database: the store templates, the selected database name and version
//! (remembered across reloads through a [`SettingsStore`]) and at most one
//! live connection handle. Record operations live in `crud.rs`.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::context::{self, OperationContext, ResolvedContext};
use crate::engine::{Connection, Engine, ObjectStore};
use crate::error::{EngineError, StoreError, StoreResult};
use crate::logging::prefix;
use crate::schema::{SchemaRegistry, StoreTemplate};
use crate::settings::{self, MemorySettings, SettingsStore};
use crate::upgrade::SchemaUpgrade;

/// Lifecycle of the client's connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    #[default]
    Closed,
    Opening,
    Open,
}

#[derive(Default)]
struct ConnectionState {
    name: Option<String>,
    version: Option<u32>,
    phase: ConnectionPhase,
    handle: Option<Rc<dyn Connection>>,
}

/// A registered template with its store name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedTemplate {
    pub name: String,
    pub template: StoreTemplate,
}

/// Snapshot of the client's current settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageProperties {
    pub name: String,
    pub version: u32,
    pub default_store: Option<String>,
    pub templates: Vec<NamedTemplate>,
}

/// Client for one object database.
///
/// ```rust
/// use stow_core::{MemoryEngine, MemorySettings, StorageClient};
///
/// let client = StorageClient::new(MemoryEngine::new(), MemorySettings::new());
/// client.set_database("notes", Some(2));
/// assert_eq!(client.properties().version, 2);
/// ```
pub struct StorageClient<E, S = MemorySettings> {
    engine: E,
    settings: S,
    config: ClientConfig,
    schema: RefCell<SchemaRegistry>,
    state: RefCell<ConnectionState>,
    described: RefCell<HashSet<String>>,
}

impl<E, S> fmt::Debug for StorageClient<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("StorageClient")
            .field("config", &self.config)
            .field("schema", &self.schema.borrow())
            .field("database", &state.name)
            .field("version", &state.version)
            .field("phase", &state.phase)
            .finish()
    }
}

impl<E: Engine, S: SettingsStore> StorageClient<E, S> {
    pub fn new(engine: E, settings: S) -> Self {
        Self::with_config(engine, settings, ClientConfig::default())
    }

    pub fn with_config(engine: E, settings: S, config: ClientConfig) -> Self {
        Self {
            engine,
            settings,
            config,
            schema: RefCell::new(SchemaRegistry::new()),
            state: RefCell::new(ConnectionState::default()),
            described: RefCell::new(HashSet::new()),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn settings(&self) -> &S {
        &self.settings
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // ---- Schema registry ----

    /// Register one template. An already registered name is kept.
    pub fn add_store_template(&self, name: impl Into<String>, template: StoreTemplate) -> bool {
        self.schema.borrow_mut().add_template(name, template)
    }

    /// Register several templates and return the current mapping.
    pub fn add_store_templates<I, N>(&self, templates: I) -> Vec<(String, StoreTemplate)>
    where
        I: IntoIterator<Item = (N, StoreTemplate)>,
        N: Into<String>,
    {
        self.schema.borrow_mut().add_templates(templates).to_vec()
    }

    /// Template for `name`, or for the default store.
    pub fn store_template(&self, name: Option<&str>) -> Option<StoreTemplate> {
        self.schema.borrow().template(name).cloned()
    }

    pub fn default_store(&self) -> Option<String> {
        self.schema.borrow().default_store().map(str::to_string)
    }

    pub fn set_default_store(&self, name: &str) -> bool {
        self.schema.borrow_mut().set_default_store(name)
    }

    /// Complete a partial record with the defaults and derived fields of a
    /// store's template.
    pub fn build_record(&self, store_name: Option<&str>, partial: Value) -> StoreResult<Value> {
        let schema = self.schema.borrow();
        let template = schema.template(store_name).ok_or_else(|| {
            match store_name.or_else(|| schema.default_store()) {
                Some(name) => StoreError::UnknownStore(name.to_string()),
                None => StoreError::NoDefaultStore,
            }
        })?;
        Ok(template.build_record(partial))
    }

    // ---- Database selection ----

    /// Select the database to open next and remember the choice.
    ///
    /// Without a version the last version used for `name` applies, falling
    /// back to the configured default.
    pub fn set_database(&self, name: &str, version: Option<u32>) {
        {
            let mut state = self.state.borrow_mut();
            state.name = Some(name.to_string());
            state.version = version;
        }
        if let Err(e) = self.settings.set(&self.config.database_key, name) {
            warn!("could not persist database name '{}': {}", name, e);
        }
        if let Some(version) = version {
            self.persist_version(name, version);
        }
        debug!("{} selected database '{}' ({:?})", prefix::DB, name, version);
    }

    /// Effective database name: selected, persisted, then configured default.
    pub fn database_name(&self) -> String {
        if let Some(name) = &self.state.borrow().name {
            return name.clone();
        }
        self.settings
            .get(&self.config.database_key)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.config.default_database.clone())
    }

    /// Effective version for the effective database name.
    pub fn database_version(&self) -> u32 {
        if let Some(version) = self.state.borrow().version {
            return version;
        }
        let name = self.database_name();
        settings::load_versions(&self.settings, &self.config.versions_key)
            .get(&name)
            .copied()
            .unwrap_or(self.config.default_version)
    }

    pub fn properties(&self) -> StorageProperties {
        let schema = self.schema.borrow();
        StorageProperties {
            name: self.database_name(),
            version: self.database_version(),
            default_store: schema.default_store().map(str::to_string),
            templates: schema
                .templates()
                .iter()
                .map(|(name, template)| NamedTemplate {
                    name: name.clone(),
                    template: template.clone(),
                })
                .collect(),
        }
    }

    fn persist_version(&self, name: &str, version: u32) {
        if let Err(e) =
            settings::save_version(&self.settings, &self.config.versions_key, name, version)
        {
            warn!("could not persist version {} of '{}': {}", version, name, e);
        }
    }

    // ---- Connection ----

    pub fn phase(&self) -> ConnectionPhase {
        self.state.borrow().phase
    }

    /// The active connection, if one is open.
    pub fn database(&self) -> Option<Rc<dyn Connection>> {
        self.state
            .borrow()
            .handle
            .as_ref()
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Open the effective database, creating missing stores on upgrade.
    ///
    /// A live handle to the same name and version is reused; any other
    /// handle is closed before the new open is issued. `store_name` is only
    /// checked for existence after the open.
    pub async fn open_object_store(
        &self,
        store_name: Option<&str>,
    ) -> StoreResult<Rc<dyn Connection>> {
        let name = self.database_name();
        let version = self.database_version();

        if let Some(handle) = self.database() {
            if handle.name() == name && handle.version() == version {
                return Ok(handle);
            }
        }
        if self.state.borrow().handle.is_some() {
            self.close_database("open_object_store");
        }

        let templates = self.schema.borrow().templates().to_vec();
        if templates.is_empty() {
            warn!("{} opening '{}' with no store templates registered", prefix::DB, name);
        }
        self.state.borrow_mut().phase = ConnectionPhase::Opening;
        debug!("{} opening '{}' v{}", prefix::DB, name, version);

        let events = Rc::new(SchemaUpgrade::new(templates));
        let opened = self.engine.open(&name, version, events).await;

        let connection = match opened {
            Ok(connection) => connection,
            Err(EngineError::Blocked(_)) => {
                self.state.borrow_mut().phase = ConnectionPhase::Closed;
                warn!(
                    "{} open of '{}' v{} blocked by another connection",
                    prefix::DB,
                    name,
                    version
                );
                return Err(StoreError::Blocked { name, version });
            }
            Err(source) => {
                self.state.borrow_mut().phase = ConnectionPhase::Closed;
                error!("{} open of '{}' v{} failed: {}", prefix::DB, name, version, source);
                return Err(StoreError::Open { name, source });
            }
        };

        let previous = {
            let mut state = self.state.borrow_mut();
            state.phase = ConnectionPhase::Open;
            state.handle.replace(connection.clone())
        };
        if let Some(previous) = previous {
            // Another open finished while this one was pending.
            if !Rc::ptr_eq(&previous, &connection) {
                previous.close();
            }
        }

        self.persist_version(&name, connection.version());
        info!(
            "{} opened '{}' v{} ({} stores)",
            prefix::DB,
            name,
            connection.version(),
            connection.store_names().len()
        );

        if let Some(store) = store_name {
            if !connection.store_names().iter().any(|s| s == store) {
                warn!("{} store '{}' does not exist in '{}'", prefix::DB, store, name);
            }
        }
        Ok(connection)
    }

    /// Close the active connection, if any.
    pub fn close_database(&self, caller: &str) {
        let handle = {
            let mut state = self.state.borrow_mut();
            state.phase = ConnectionPhase::Closed;
            state.handle.take()
        };
        match handle {
            Some(handle) => {
                handle.close();
                info!("{} closed '{}' ({})", prefix::DB, handle.name(), caller);
            }
            None => debug!("{} close requested with no open database ({})", prefix::DB, caller),
        }
    }

    /// Close `handle`. The tracked connection is only forgotten if it is
    /// this handle.
    pub fn close_handle(&self, handle: &Rc<dyn Connection>, caller: &str) {
        let tracked = self
            .state
            .borrow()
            .handle
            .as_ref()
            .is_some_and(|current| Rc::ptr_eq(current, handle));
        if tracked {
            self.close_database(caller);
        } else {
            handle.close();
            debug!("{} closed untracked handle to '{}' ({})", prefix::DB, handle.name(), caller);
        }
    }

    /// Delete a database, closing the active connection first when it
    /// addresses that database.
    pub async fn delete_database(&self, name: Option<&str>) -> StoreResult<()> {
        let name = name.map_or_else(|| self.database_name(), str::to_string);
        if self.database().is_some_and(|handle| handle.name() == name) {
            self.close_database("delete_database");
        }

        match self.engine.delete_database(&name).await {
            Ok(()) => {
                info!("{} deleted database '{}'", prefix::DB, name);
                self.described.borrow_mut().clear();
                Ok(())
            }
            Err(EngineError::Blocked(_)) => {
                warn!("{} delete of '{}' blocked by another connection", prefix::DB, name);
                Err(StoreError::Blocked {
                    name,
                    version: self.database_version(),
                })
            }
            Err(source) => {
                error!("{} delete of '{}' failed: {}", prefix::DB, name, source);
                Err(StoreError::Open { name, source })
            }
        }
    }

    // ---- Context resolution ----

    /// Resolve `ctx`, opening the database first when the context needs a
    /// connection and none is open.
    pub async fn resolve_context(&self, ctx: OperationContext) -> StoreResult<ResolvedContext> {
        let connection = if ctx.needs_connection() {
            match self.database() {
                Some(connection) => Some(connection),
                None => Some(self.open_object_store(ctx.store_name.as_deref()).await?),
            }
        } else {
            None
        };

        let default_store = self.default_store();
        let resolved = context::resolve(ctx, connection.as_ref(), default_store.as_deref())?;
        self.describe_once(resolved.store.as_ref());
        Ok(resolved)
    }

    fn describe_once(&self, store: &dyn ObjectStore) {
        if !self.config.log_store_metadata {
            return;
        }
        let name = store.name();
        if !self.described.borrow_mut().insert(name) {
            return;
        }
        let metadata = store.metadata();
        debug!(
            "store '{}': key path {:?}, auto increment {}, indexes {:?}",
            metadata.name, metadata.key_path, metadata.auto_increment, metadata.index_names
        );
    }
}
