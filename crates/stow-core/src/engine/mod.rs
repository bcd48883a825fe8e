//! Native object-store engine abstraction
//!
//! These traits describe the host storage facility the client runs on: named
//! databases with versioned schemas, object stores with primary keys and
//! secondary indexes, transactions and asynchronous requests. Implementations
//! exist for:
//!
//! - **Memory**: pure Rust engine for tests and native builds (`MemoryEngine`)
//! - **IndexedDB**: the browser engine via web-sys (separate crate, WASM only)
//!
//! # Request issue order
//!
//! Every request method issues its request when it is called and returns a
//! future that only waits for the outcome. Callers can therefore issue a
//! batch of requests against one transaction before awaiting any of them.
//!
//! All handles are `Rc`-based and `!Send`: the engines are single-threaded
//! and event-driven.

mod memory;

use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineResult;
use crate::key::{IndexQuery, Key, KeyRange};

pub use memory::{EngineEvent, MemoryEngine, RequestOp};

/// Future returned by engine requests.
pub type EngineFuture<T> = LocalBoxFuture<'static, EngineResult<T>>;

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransactionMode {
    #[serde(rename = "readonly")]
    ReadOnly,
    #[default]
    #[serde(rename = "readwrite")]
    ReadWrite,
    #[serde(rename = "versionchange")]
    VersionChange,
}

impl TransactionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionMode::ReadOnly => "readonly",
            TransactionMode::ReadWrite => "readwrite",
            TransactionMode::VersionChange => "versionchange",
        }
    }

    /// Whether requests in this mode may modify records.
    pub fn is_writable(self) -> bool {
        !matches!(self, TransactionMode::ReadOnly)
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "readonly" => Ok(TransactionMode::ReadOnly),
            "readwrite" => Ok(TransactionMode::ReadWrite),
            "versionchange" => Ok(TransactionMode::VersionChange),
            other => Err(format!("unknown transaction mode: {}", other)),
        }
    }
}

/// Secondary index definition used when creating a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub key_path: String,
    pub unique: bool,
    pub multi_entry: bool,
}

/// Parameters for creating an object store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreParams {
    pub key_path: Option<String>,
    pub auto_increment: bool,
    pub indexes: Vec<IndexDef>,
}

/// Structural description of an existing object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreMetadata {
    pub name: String,
    pub key_path: Option<String>,
    pub auto_increment: bool,
    pub index_names: Vec<String>,
}

/// Transaction-level outcome, reported out of band from request results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    Complete,
    Error(String),
    Abort(String),
}

/// Callback receiving transaction events.
pub type TransactionObserver = Box<dyn Fn(&TransactionEvent)>;

/// Lifecycle hooks for one connection, supplied when opening.
///
/// The engine calls these synchronously from its event dispatch. Every
/// method has an empty default.
pub trait ConnectionEvents {
    /// The requested version is newer than the stored one. Schema changes
    /// (`Connection::create_object_store`) are only allowed during this call.
    fn upgrade_needed(&self, _connection: &dyn Connection, _old_version: u32, _new_version: u32) {}

    /// The open request is held up by other connections that did not close.
    fn blocked(&self, _old_version: u32, _new_version: Option<u32>) {}

    /// Another session wants to upgrade or delete the database this
    /// connection holds open.
    fn version_change(
        &self,
        _connection: &dyn Connection,
        _old_version: u32,
        _new_version: Option<u32>,
    ) {
    }

    /// The connection was closed by the engine rather than by the caller.
    fn closed(&self, _connection: &dyn Connection) {}

    fn error(&self, _connection: &dyn Connection, _message: &str) {}

    fn abort(&self, _connection: &dyn Connection, _message: &str) {}
}

/// A storage engine able to open named, versioned databases.
pub trait Engine {
    /// Open `name` at `version`, running the upgrade hook when the stored
    /// version is older.
    fn open(
        &self,
        name: &str,
        version: u32,
        events: Rc<dyn ConnectionEvents>,
    ) -> EngineFuture<Rc<dyn Connection>>;

    /// Delete a database and everything in it.
    fn delete_database(&self, name: &str) -> EngineFuture<()>;
}

/// One open database session.
pub trait Connection {
    fn name(&self) -> String;

    fn version(&self) -> u32;

    fn store_names(&self) -> Vec<String>;

    /// Create an object store. Only valid during an upgrade.
    fn create_object_store(&self, name: &str, params: &StoreParams) -> EngineResult<()>;

    /// Start a transaction over `stores`.
    fn transaction(
        self: Rc<Self>,
        stores: &[&str],
        mode: TransactionMode,
    ) -> EngineResult<Rc<dyn Transaction>>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name())
            .field("version", &self.version())
            .finish()
    }
}

/// A transaction over one or more object stores.
pub trait Transaction {
    fn mode(&self) -> TransactionMode;

    fn store_names(&self) -> Vec<String>;

    fn object_store(self: Rc<Self>, name: &str) -> EngineResult<Rc<dyn ObjectStore>>;

    /// Register a callback for complete/error/abort events.
    fn observe(&self, observer: TransactionObserver);

    fn abort(&self) -> EngineResult<()>;
}

/// An object store bound to a transaction.
pub trait ObjectStore {
    fn name(&self) -> String;

    fn metadata(&self) -> StoreMetadata;

    fn transaction(&self) -> Rc<dyn Transaction>;

    /// Insert a record; fails if its key already exists. Resolves to the
    /// record's primary key.
    fn add(&self, value: &Value) -> EngineFuture<Key>;

    /// Remove every record. Key generators are not reset.
    fn clear(&self) -> EngineFuture<()>;

    /// Remove every record whose primary key falls in `range`.
    fn delete(&self, range: &KeyRange) -> EngineFuture<()>;

    /// Walk the whole store in primary key order, calling `visitor` per
    /// record. Resolves to the number of records visited.
    fn for_each(&self, visitor: Box<dyn FnMut(&Key, &Value)>) -> EngineFuture<usize>;

    fn index_get_all(&self, query: &IndexQuery) -> EngineFuture<Vec<Value>>;

    fn index_get_all_keys(&self, query: &IndexQuery) -> EngineFuture<Vec<Key>>;

    fn index_count(&self, query: &IndexQuery) -> EngineFuture<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("readonly".parse(), Ok(TransactionMode::ReadOnly));
        assert_eq!("readwrite".parse(), Ok(TransactionMode::ReadWrite));
        assert!("write".parse::<TransactionMode>().is_err());
        assert_eq!(TransactionMode::default(), TransactionMode::ReadWrite);
        assert!(!TransactionMode::ReadOnly.is_writable());
    }
}
