//! Stow: schema-driven object storage client
//!
//! This crate provides a small client over a transactional, indexed object
//! database (IndexedDB in the browser, an in-memory engine natively). Stores
//! are declared up front as templates; the client opens the selected
//! database, creates missing stores on upgrade and offers batched record
//! operations on top of a single live connection.
//!
//! The browser engine lives in `stow-indexeddb` and the JavaScript bridge in
//! `stow-wasm`.
//!
//! # Example
//!
//! ```rust
//! use futures::executor::block_on;
//! use serde_json::json;
//! use stow_core::{MemoryEngine, MemorySettings, RecordPropertySpec, StorageClient};
//! use stow_core::{StoreOptions, StoreTemplate};
//!
//! let client = StorageClient::new(MemoryEngine::new(), MemorySettings::new());
//! client.add_store_template(
//!     "notes",
//!     StoreTemplate::new(StoreOptions::auto_increment("id"))
//!         .field("tag", RecordPropertySpec::indexed()),
//! );
//!
//! block_on(async {
//!     let notes = [json!({"tag": "a"}), json!({"tag": "b"}), json!({"tag": "a"})];
//!     client.store_items(&notes, "notes").await.unwrap();
//!     assert_eq!(client.count_items("tag", "a", "notes").await.unwrap(), 2);
//!     assert_eq!(client.delete_items("tag", "a", "notes").await.unwrap(), 2);
//! });
//! ```

pub mod client;
pub mod coalesce;
pub mod config;
pub mod context;
mod crud;
pub mod engine;
pub mod error;
pub mod key;
pub mod logging;
pub mod schema;
pub mod settings;
pub mod upgrade;

// Re-export main types at crate root
pub use client::{ConnectionPhase, NamedTemplate, StorageClient, StorageProperties};
pub use coalesce::coalesce;
pub use config::ClientConfig;
pub use context::{OperationContext, ResolvedContext};
pub use engine::{
    Connection, ConnectionEvents, Engine, EngineEvent, EngineFuture, IndexDef, MemoryEngine,
    ObjectStore, RequestOp, StoreMetadata, StoreParams, Transaction, TransactionEvent,
    TransactionMode, TransactionObserver,
};
pub use error::{EngineError, EngineResult, ErrorKind, StoreError, StoreResult};
pub use key::{Direction, IndexQuery, Key, KeyQuery, KeyRange};
pub use schema::{
    Derive, IndexOptions, IndexSpec, RecordPropertySpec, SchemaRegistry, StoreOptions,
    StoreTemplate,
};
pub use settings::{MemorySettings, SettingsError, SettingsStore};
pub use upgrade::SchemaUpgrade;
