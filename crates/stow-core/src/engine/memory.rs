//! In-memory engine
//!
//! A BTreeMap-based implementation of the engine traits. Databases outlive
//! the connections that opened them, so a `MemoryEngine` clone behaves like
//! the browser's storage across page reloads. Useful for:
//! - Unit and integration testing
//! - Native builds that don't need durability
//!
//! Requests execute immediately when issued. A failed request aborts its
//! transaction and rolls back every change the transaction made, matching
//! the browser engine's default behavior.
//!
//! Every open, close and request is appended to a journal that tests can
//! inspect with [`MemoryEngine::journal`].

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use futures::future;
use serde_json::Value;

use crate::engine::{
    Connection, ConnectionEvents, Engine, EngineFuture, IndexDef, ObjectStore, StoreMetadata,
    StoreParams, Transaction, TransactionEvent, TransactionMode, TransactionObserver,
};
use crate::error::{EngineError, EngineResult};
use crate::key::{evaluate_key_path, inject_key, IndexQuery, Key, KeyRange};

/// Kind of request recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOp {
    Add,
    Clear,
    Delete,
    Cursor,
    GetAll,
    GetAllKeys,
    Count,
}

/// Journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Opened {
        database: String,
        version: u32,
        connection: u64,
    },
    Upgraded {
        database: String,
        old_version: u32,
        new_version: u32,
    },
    Blocked {
        database: String,
        version: Option<u32>,
    },
    Closed {
        database: String,
        connection: u64,
    },
    Deleted {
        database: String,
    },
    Request {
        database: String,
        store: String,
        op: RequestOp,
    },
}

#[derive(Debug, Clone)]
struct StoreData {
    params: StoreParams,
    records: BTreeMap<Key, Value>,
    next_key: i64,
}

impl StoreData {
    fn new(params: StoreParams) -> Self {
        Self {
            params,
            records: BTreeMap::new(),
            next_key: 1,
        }
    }

    fn index(&self, name: &str) -> EngineResult<&IndexDef> {
        self.params
            .indexes
            .iter()
            .find(|index| index.name == name)
            .ok_or_else(|| EngineError::NotFound(format!("index '{}'", name)))
    }

    /// Primary key for a new record, generating one (and writing it into
    /// the record) when the store has a key generator.
    fn assign_key(&mut self, value: &mut Value) -> EngineResult<Key> {
        let key = match self.params.key_path.as_deref() {
            Some(path) => match evaluate_key_path(value, path) {
                Some(raw) => Key::from_value(raw).ok_or_else(|| {
                    EngineError::Data(format!("value at key path '{}' is not a valid key", path))
                })?,
                None if self.params.auto_increment => {
                    let key = Key::Int(self.next_key);
                    if !inject_key(value, path, &key) {
                        return Err(EngineError::Data(format!(
                            "cannot write generated key at '{}'",
                            path
                        )));
                    }
                    key
                }
                None => {
                    return Err(EngineError::Data(format!("record has no key at '{}'", path)))
                }
            },
            None if self.params.auto_increment => Key::Int(self.next_key),
            None => {
                return Err(EngineError::Data(
                    "store has neither a key path nor a key generator".into(),
                ))
            }
        };

        if self.params.auto_increment {
            let floor = match &key {
                Key::Int(i) => Some(*i),
                Key::Float(f) => Some(f.floor() as i64),
                _ => None,
            };
            if let Some(floor) = floor {
                if floor >= self.next_key {
                    self.next_key = floor.saturating_add(1);
                }
            }
        }
        Ok(key)
    }

    fn check_unique(&self, value: &Value) -> EngineResult<()> {
        for index in self.params.indexes.iter().filter(|index| index.unique) {
            for key in index_keys(index, value) {
                let taken = self
                    .records
                    .values()
                    .any(|existing| index_keys(index, existing).contains(&key));
                if taken {
                    return Err(EngineError::Constraint(format!(
                        "unique index '{}' already contains {}",
                        index.name, key
                    )));
                }
            }
        }
        Ok(())
    }

    /// `(index key, primary key)` pairs selected by `query`, in scan order.
    fn scan(&self, query: &IndexQuery, apply_limits: bool) -> EngineResult<Vec<(Key, Key)>> {
        let index = self.index(&query.name)?;

        let mut entries: Vec<(Key, Key)> = Vec::new();
        for (primary, value) in &self.records {
            for index_key in index_keys(index, value) {
                let selected = query
                    .value
                    .as_ref()
                    .map_or(true, |selector| selector.matches(&index_key));
                if selected {
                    entries.push((index_key, primary.clone()));
                }
            }
        }
        entries.sort();

        if !apply_limits {
            return Ok(entries);
        }

        let direction = query.direction.unwrap_or_default();
        if direction.is_unique() {
            entries.dedup_by(|b, a| a.0 == b.0);
        }
        if direction.is_reverse() {
            entries.reverse();
        }
        if let Some(count) = query.count.filter(|count| *count > 0) {
            entries.truncate(count as usize);
        }
        Ok(entries)
    }
}

/// Index keys a record contributes to `index`.
fn index_keys(index: &IndexDef, value: &Value) -> Vec<Key> {
    let Some(raw) = evaluate_key_path(value, &index.key_path) else {
        return Vec::new();
    };
    match raw {
        Value::Array(items) if index.multi_entry => {
            let mut keys: Vec<Key> = items.iter().filter_map(Key::from_value).collect();
            keys.sort();
            keys.dedup();
            keys
        }
        other => Key::from_value(other).into_iter().collect(),
    }
}

#[derive(Debug, Default)]
struct DatabaseData {
    version: u32,
    stores: BTreeMap<String, StoreData>,
}

#[derive(Default)]
struct EngineState {
    databases: BTreeMap<String, DatabaseData>,
    connections: Vec<Weak<MemoryConnection>>,
    journal: Vec<EngineEvent>,
    next_connection: u64,
}

impl EngineState {
    fn open_connections(&mut self, database: &str) -> Vec<Rc<MemoryConnection>> {
        self.connections
            .retain(|weak| weak.upgrade().is_some_and(|c| !c.closed.get()));
        self.connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.database == database)
            .collect()
    }
}

/// In-memory engine. Clones share the same databases.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    state: Rc<RefCell<EngineState>>,
}

impl MemoryEngine {
    /// Create an engine with no databases.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything that happened so far, oldest first.
    pub fn journal(&self) -> Vec<EngineEvent> {
        self.state.borrow().journal.clone()
    }

    /// Forget the journal.
    pub fn clear_journal(&self) {
        self.state.borrow_mut().journal.clear();
    }

    /// Number of journaled requests of kind `op`.
    pub fn request_count(&self, op: RequestOp) -> usize {
        self.state
            .borrow()
            .journal
            .iter()
            .filter(|event| matches!(event, EngineEvent::Request { op: o, .. } if *o == op))
            .count()
    }

    /// Stored version of `database`, if it exists.
    pub fn version(&self, database: &str) -> Option<u32> {
        self.state
            .borrow()
            .databases
            .get(database)
            .map(|db| db.version)
    }

    /// Store names of `database` (empty if it doesn't exist).
    pub fn store_names(&self, database: &str) -> Vec<String> {
        self.state
            .borrow()
            .databases
            .get(database)
            .map(|db| db.stores.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of a store's records in key order.
    pub fn records(&self, database: &str, store: &str) -> Vec<(Key, Value)> {
        self.state
            .borrow()
            .databases
            .get(database)
            .and_then(|db| db.stores.get(store))
            .map(|data| {
                data.records
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Tell every open connection to `database` that a version change is
    /// requested. Fails with `Blocked` if any of them stays open.
    fn request_version_change(
        &self,
        database: &str,
        old_version: u32,
        new_version: Option<u32>,
    ) -> EngineResult<()> {
        let others = self.state.borrow_mut().open_connections(database);
        for other in &others {
            other
                .events
                .version_change(other.as_ref(), old_version, new_version);
        }
        if others.iter().any(|c| !c.closed.get()) {
            self.state.borrow_mut().journal.push(EngineEvent::Blocked {
                database: database.to_string(),
                version: new_version,
            });
            return Err(EngineError::Blocked(database.to_string()));
        }
        Ok(())
    }

    fn open_now(
        &self,
        name: &str,
        version: u32,
        events: Rc<dyn ConnectionEvents>,
    ) -> EngineResult<Rc<dyn Connection>> {
        if version == 0 {
            return Err(EngineError::Data("version must be at least 1".into()));
        }

        let old_version = self.version(name).unwrap_or(0);
        if version < old_version {
            return Err(EngineError::Version {
                requested: version,
                existing: old_version,
            });
        }

        let upgrade = version > old_version;
        if upgrade {
            if let Err(err) = self.request_version_change(name, old_version, Some(version)) {
                events.blocked(old_version, Some(version));
                return Err(err);
            }
        }

        let connection = {
            let mut state = self.state.borrow_mut();
            state.next_connection += 1;
            let connection = Rc::new(MemoryConnection {
                state: self.state.clone(),
                id: state.next_connection,
                database: name.to_string(),
                version,
                closed: Cell::new(false),
                upgrading: Cell::new(upgrade),
                events: events.clone(),
            });
            state.connections.push(Rc::downgrade(&connection));
            if upgrade {
                state.databases.entry(name.to_string()).or_default().version = version;
                state.journal.push(EngineEvent::Upgraded {
                    database: name.to_string(),
                    old_version,
                    new_version: version,
                });
            }
            connection
        };

        if upgrade {
            events.upgrade_needed(connection.as_ref(), old_version, version);
            connection.upgrading.set(false);
        }

        self.state.borrow_mut().journal.push(EngineEvent::Opened {
            database: name.to_string(),
            version,
            connection: connection.id,
        });
        Ok(connection)
    }

    fn delete_now(&self, name: &str) -> EngineResult<()> {
        let Some(old_version) = self.version(name) else {
            return Ok(());
        };
        self.request_version_change(name, old_version, None)?;

        let mut state = self.state.borrow_mut();
        state.databases.remove(name);
        state.journal.push(EngineEvent::Deleted {
            database: name.to_string(),
        });
        Ok(())
    }
}

impl Engine for MemoryEngine {
    fn open(
        &self,
        name: &str,
        version: u32,
        events: Rc<dyn ConnectionEvents>,
    ) -> EngineFuture<Rc<dyn Connection>> {
        Box::pin(future::ready(self.open_now(name, version, events)))
    }

    fn delete_database(&self, name: &str) -> EngineFuture<()> {
        Box::pin(future::ready(self.delete_now(name)))
    }
}

/// Connection to a database held by a [`MemoryEngine`].
pub struct MemoryConnection {
    state: Rc<RefCell<EngineState>>,
    id: u64,
    database: String,
    version: u32,
    closed: Cell<bool>,
    upgrading: Cell<bool>,
    events: Rc<dyn ConnectionEvents>,
}

impl Connection for MemoryConnection {
    fn name(&self) -> String {
        self.database.clone()
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn store_names(&self) -> Vec<String> {
        self.state
            .borrow()
            .databases
            .get(&self.database)
            .map(|db| db.stores.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn create_object_store(&self, name: &str, params: &StoreParams) -> EngineResult<()> {
        if !self.upgrading.get() {
            return Err(EngineError::InvalidState(format!(
                "cannot create store '{}' outside a version change",
                name
            )));
        }
        let mut state = self.state.borrow_mut();
        let db = state.databases.entry(self.database.clone()).or_default();
        if db.stores.contains_key(name) {
            return Err(EngineError::Constraint(format!("store '{}' already exists", name)));
        }
        if params.auto_increment
            && params.key_path.as_deref().is_some_and(|path| path.is_empty())
        {
            return Err(EngineError::InvalidState(
                "auto-increment store cannot use an empty key path".into(),
            ));
        }
        db.stores
            .insert(name.to_string(), StoreData::new(params.clone()));
        Ok(())
    }

    fn transaction(
        self: Rc<Self>,
        stores: &[&str],
        mode: TransactionMode,
    ) -> EngineResult<Rc<dyn Transaction>> {
        if self.closed.get() {
            return Err(EngineError::InvalidState("connection is closed".into()));
        }
        if mode == TransactionMode::VersionChange {
            return Err(EngineError::InvalidState(
                "version change transactions are only created by upgrades".into(),
            ));
        }
        if stores.is_empty() {
            return Err(EngineError::InvalidState("transaction needs at least one store".into()));
        }

        {
            let state = self.state.borrow();
            let db = state.databases.get(&self.database);
            for name in stores {
                if db.map_or(true, |db| !db.stores.contains_key(*name)) {
                    return Err(EngineError::NotFound(format!("store '{}'", name)));
                }
            }
        }

        Ok(Rc::new(MemoryTransaction {
            connection: self,
            scope: stores.iter().map(|s| s.to_string()).collect(),
            mode,
            undo: RefCell::new(Vec::new()),
            finished: Cell::new(false),
            observers: RefCell::new(Vec::new()),
        }))
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.state.borrow_mut().journal.push(EngineEvent::Closed {
            database: self.database.clone(),
            connection: self.id,
        });
    }

    fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

/// Prior state of one record (or of a key generator) touched by a write.
enum Undo {
    Record {
        store: String,
        key: Key,
        prior: Option<Value>,
    },
    Generator {
        store: String,
        prior: i64,
    },
}

/// Transaction on a [`MemoryConnection`]. Commits when the last handle to it
/// is dropped.
pub struct MemoryTransaction {
    connection: Rc<MemoryConnection>,
    scope: Vec<String>,
    mode: TransactionMode,
    undo: RefCell<Vec<Undo>>,
    finished: Cell<bool>,
    observers: RefCell<Vec<TransactionObserver>>,
}

impl MemoryTransaction {
    fn notify(&self, event: TransactionEvent) {
        for observer in self.observers.borrow().iter() {
            observer(&event);
        }
    }

    /// Undo this transaction's own writes, newest first. Records written by
    /// other transactions in the meantime are left alone.
    fn roll_back(&self, reason: &str) {
        self.finished.set(true);
        let undo = std::mem::take(&mut *self.undo.borrow_mut());
        {
            let mut state = self.connection.state.borrow_mut();
            if let Some(db) = state.databases.get_mut(&self.connection.database) {
                for entry in undo.into_iter().rev() {
                    match entry {
                        Undo::Record { store, key, prior } => {
                            let Some(data) = db.stores.get_mut(&store) else {
                                continue;
                            };
                            match prior {
                                Some(value) => data.records.insert(key, value),
                                None => data.records.remove(&key),
                            };
                        }
                        Undo::Generator { store, prior } => {
                            let Some(data) = db.stores.get_mut(&store) else {
                                continue;
                            };
                            let floor = data
                                .records
                                .keys()
                                .filter_map(Key::as_int)
                                .max()
                                .map_or(1, |max| max.saturating_add(1));
                            data.next_key = prior.max(floor);
                        }
                    }
                }
            }
        }
        self.notify(TransactionEvent::Abort(reason.to_string()));
    }

    fn fail(&self, err: &EngineError) {
        self.notify(TransactionEvent::Error(err.to_string()));
        self.roll_back(&err.to_string());
    }

    /// Log the prior state of every record a write changed.
    fn record_undo(
        &self,
        name: &str,
        (before, next_key): (BTreeMap<Key, Value>, i64),
        after: &StoreData,
    ) {
        let mut undo = self.undo.borrow_mut();
        if after.next_key != next_key {
            undo.push(Undo::Generator {
                store: name.to_string(),
                prior: next_key,
            });
        }
        for (key, prior) in &before {
            if after.records.get(key) != Some(prior) {
                undo.push(Undo::Record {
                    store: name.to_string(),
                    key: key.clone(),
                    prior: Some(prior.clone()),
                });
            }
        }
        for key in after.records.keys().filter(|key| !before.contains_key(*key)) {
            undo.push(Undo::Record {
                store: name.to_string(),
                key: key.clone(),
                prior: None,
            });
        }
    }

    /// Run `f` against store `name` as one request.
    fn request<T>(
        &self,
        name: &str,
        op: RequestOp,
        write: bool,
        f: impl FnOnce(&mut StoreData) -> EngineResult<T>,
    ) -> EngineResult<T> {
        if self.finished.get() {
            return Err(EngineError::Aborted(format!(
                "transaction on '{}' is no longer active",
                name
            )));
        }
        if write && !self.mode.is_writable() {
            return Err(EngineError::ReadOnly(format!("cannot modify '{}'", name)));
        }

        let result = {
            let mut state = self.connection.state.borrow_mut();
            state.journal.push(EngineEvent::Request {
                database: self.connection.database.clone(),
                store: name.to_string(),
                op,
            });
            match state
                .databases
                .get_mut(&self.connection.database)
                .and_then(|db| db.stores.get_mut(name))
            {
                Some(data) if write => {
                    let before = (data.records.clone(), data.next_key);
                    let result = f(&mut *data);
                    self.record_undo(name, before, data);
                    result
                }
                Some(data) => f(data),
                None => Err(EngineError::NotFound(format!("store '{}'", name))),
            }
        };

        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }
}

impl Transaction for MemoryTransaction {
    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn store_names(&self) -> Vec<String> {
        self.scope.clone()
    }

    fn object_store(self: Rc<Self>, name: &str) -> EngineResult<Rc<dyn ObjectStore>> {
        if !self.scope.iter().any(|s| s == name) {
            return Err(EngineError::NotFound(format!(
                "store '{}' is not in this transaction's scope",
                name
            )));
        }
        Ok(Rc::new(MemoryObjectStore {
            name: name.to_string(),
            transaction: self,
        }))
    }

    fn observe(&self, observer: TransactionObserver) {
        self.observers.borrow_mut().push(observer);
    }

    fn abort(&self) -> EngineResult<()> {
        if self.finished.get() {
            return Err(EngineError::InvalidState("transaction already finished".into()));
        }
        self.roll_back("aborted by caller");
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished.replace(true) {
            self.notify(TransactionEvent::Complete);
        }
    }
}

/// Object store handle inside a [`MemoryTransaction`].
pub struct MemoryObjectStore {
    name: String,
    transaction: Rc<MemoryTransaction>,
}

impl MemoryObjectStore {
    fn read<T>(
        &self,
        op: RequestOp,
        f: impl FnOnce(&mut StoreData) -> EngineResult<T>,
    ) -> EngineResult<T> {
        self.transaction.request(&self.name, op, false, f)
    }

    fn write<T>(
        &self,
        op: RequestOp,
        f: impl FnOnce(&mut StoreData) -> EngineResult<T>,
    ) -> EngineResult<T> {
        self.transaction.request(&self.name, op, true, f)
    }
}

impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn metadata(&self) -> StoreMetadata {
        let state = self.transaction.connection.state.borrow();
        let params = state
            .databases
            .get(&self.transaction.connection.database)
            .and_then(|db| db.stores.get(&self.name))
            .map(|data| data.params.clone())
            .unwrap_or_default();
        StoreMetadata {
            name: self.name.clone(),
            key_path: params.key_path,
            auto_increment: params.auto_increment,
            index_names: params.indexes.into_iter().map(|index| index.name).collect(),
        }
    }

    fn transaction(&self) -> Rc<dyn Transaction> {
        self.transaction.clone()
    }

    fn add(&self, value: &Value) -> EngineFuture<Key> {
        let mut record = value.clone();
        let result = self.write(RequestOp::Add, |data| {
            let key = data.assign_key(&mut record)?;
            if data.records.contains_key(&key) {
                return Err(EngineError::Constraint(format!("key {} already exists", key)));
            }
            data.check_unique(&record)?;
            data.records.insert(key.clone(), record);
            Ok(key)
        });
        Box::pin(future::ready(result))
    }

    fn clear(&self) -> EngineFuture<()> {
        let result = self.write(RequestOp::Clear, |data| {
            data.records.clear();
            Ok(())
        });
        Box::pin(future::ready(result))
    }

    fn delete(&self, range: &KeyRange) -> EngineFuture<()> {
        let result = self.write(RequestOp::Delete, |data| {
            data.records.retain(|key, _| !range.contains(key));
            Ok(())
        });
        Box::pin(future::ready(result))
    }

    fn for_each(&self, mut visitor: Box<dyn FnMut(&Key, &Value)>) -> EngineFuture<usize> {
        let result = self.read(RequestOp::Cursor, |data| {
            Ok(data
                .records
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>())
        });
        let result = result.map(|records| {
            for (key, value) in &records {
                visitor(key, value);
            }
            records.len()
        });
        Box::pin(future::ready(result))
    }

    fn index_get_all(&self, query: &IndexQuery) -> EngineFuture<Vec<Value>> {
        let result = self.read(RequestOp::GetAll, |data| {
            let entries = data.scan(query, true)?;
            Ok(entries
                .into_iter()
                .filter_map(|(_, primary)| data.records.get(&primary).cloned())
                .collect())
        });
        Box::pin(future::ready(result))
    }

    fn index_get_all_keys(&self, query: &IndexQuery) -> EngineFuture<Vec<Key>> {
        let result = self.read(RequestOp::GetAllKeys, |data| {
            let entries = data.scan(query, true)?;
            Ok(entries.into_iter().map(|(_, primary)| primary).collect())
        });
        Box::pin(future::ready(result))
    }

    fn index_count(&self, query: &IndexQuery) -> EngineFuture<u64> {
        let result = self.read(RequestOp::Count, |data| {
            Ok(data.scan(query, false)?.len() as u64)
        });
        Box::pin(future::ready(result))
    }
}
