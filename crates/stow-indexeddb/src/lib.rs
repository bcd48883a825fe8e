//! IndexedDB engine for stow (browser WASM)
//!
//! This crate implements the `stow-core` engine traits on top of the
//! browser's IndexedDB, and the settings store on top of `localStorage`.
//!
//! Records cross into JavaScript as JSON text parsed by `JSON.parse`, so a
//! stored record is a plain JS object with the same shape as its
//! `serde_json::Value`. Keys map to numbers, strings and arrays.
//!
//! # Example
//!
//! ```rust,ignore
//! use stow_core::{StorageClient, StoreOptions, StoreTemplate};
//! use stow_indexeddb::{IdbEngine, LocalStorageSettings};
//!
//! let client = StorageClient::new(IdbEngine::new(), LocalStorageSettings::new()?);
//! client.add_store_template("notes", StoreTemplate::new(StoreOptions::auto_increment("id")));
//!
//! let keys = client.store_items(&[serde_json::json!({"text": "hi"})], "notes").await?;
//! ```

pub mod engine;
pub mod error;
pub mod idb;
pub mod settings;

pub use engine::{IdbConnection, IdbEngine, IdbStoreHandle, IdbTransactionHandle};
pub use error::{IdbError, Result};
pub use settings::LocalStorageSettings;
