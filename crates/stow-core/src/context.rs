//! Operation context resolution
//!
//! Every record operation accepts an [`OperationContext`] naming how it should
//! reach its object store. Callers can hand over an existing store handle or
//! transaction to join a batch of work, or just name a store (or nothing, to
//! use the default store) and let a fresh transaction be created.
//!
//! Resolution order:
//!
//! 1. An explicit store handle wins; its own transaction is used unless one
//!    was also given.
//! 2. Otherwise the store name is the given one or the default store.
//! 3. With an explicit transaction, the store is taken from it.
//! 4. Otherwise a new transaction is opened on the connection in the given
//!    mode (read-write when unspecified).

use std::fmt;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::engine::{Connection, ObjectStore, Transaction, TransactionEvent, TransactionMode};
use crate::error::{EngineError, StoreError, StoreResult};

/// How an operation reaches its object store.
#[derive(Clone, Default)]
pub struct OperationContext {
    pub transaction: Option<Rc<dyn Transaction>>,
    pub store: Option<Rc<dyn ObjectStore>>,
    pub mode: Option<TransactionMode>,
    pub store_name: Option<String>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a store by name, read-only.
    pub fn read_only(store_name: impl Into<String>) -> Self {
        Self::new()
            .store_name(store_name)
            .mode(TransactionMode::ReadOnly)
    }

    pub fn store_name(mut self, name: impl Into<String>) -> Self {
        self.store_name = Some(name.into());
        self
    }

    pub fn mode(mut self, mode: TransactionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn transaction(mut self, transaction: Rc<dyn Transaction>) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn store(mut self, store: Rc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Whether resolution will need an open connection.
    pub fn needs_connection(&self) -> bool {
        self.store.is_none() && self.transaction.is_none()
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("transaction", &self.transaction.as_ref().map(|t| t.store_names()))
            .field("store", &self.store.as_ref().map(|s| s.name()))
            .field("mode", &self.mode)
            .field("store_name", &self.store_name)
            .finish()
    }
}

impl From<&str> for OperationContext {
    fn from(store_name: &str) -> Self {
        Self::new().store_name(store_name)
    }
}

impl From<String> for OperationContext {
    fn from(store_name: String) -> Self {
        Self::new().store_name(store_name)
    }
}

impl From<TransactionMode> for OperationContext {
    fn from(mode: TransactionMode) -> Self {
        Self::new().mode(mode)
    }
}

impl From<Rc<dyn Transaction>> for OperationContext {
    fn from(transaction: Rc<dyn Transaction>) -> Self {
        Self::new().transaction(transaction)
    }
}

impl From<Rc<dyn ObjectStore>> for OperationContext {
    fn from(store: Rc<dyn ObjectStore>) -> Self {
        Self::new().store(store)
    }
}

/// The concrete handles an operation runs against.
#[derive(Clone)]
pub struct ResolvedContext {
    pub transaction: Rc<dyn Transaction>,
    pub store: Rc<dyn ObjectStore>,
    pub mode: TransactionMode,
    /// True when resolution opened the transaction itself
    pub created: bool,
}

impl fmt::Debug for ResolvedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedContext")
            .field("store", &self.store.name())
            .field("mode", &self.mode)
            .field("created", &self.created)
            .finish()
    }
}

/// Resolve `ctx` into a transaction and store.
///
/// `connection` is only consulted when the context carries neither a store
/// nor a transaction.
pub fn resolve(
    ctx: OperationContext,
    connection: Option<&Rc<dyn Connection>>,
    default_store: Option<&str>,
) -> StoreResult<ResolvedContext> {
    if let Some(store) = ctx.store {
        let transaction = ctx.transaction.unwrap_or_else(|| store.transaction());
        let mode = transaction.mode();
        if ctx.mode.is_some_and(|requested| requested != mode) {
            warn!(
                "ignoring requested mode for store '{}', using its transaction's {}",
                store.name(),
                mode
            );
        }
        return Ok(ResolvedContext {
            transaction,
            store,
            mode,
            created: false,
        });
    }

    let name = ctx
        .store_name
        .or_else(|| default_store.map(str::to_string))
        .ok_or(StoreError::NoDefaultStore)?;

    if let Some(transaction) = ctx.transaction {
        let mode = transaction.mode();
        let store = transaction
            .clone()
            .object_store(&name)
            .map_err(|e| store_error(&name, e))?;
        return Ok(ResolvedContext {
            transaction,
            store,
            mode,
            created: false,
        });
    }

    let connection = connection.ok_or(StoreError::NotOpen)?;
    if !connection.store_names().iter().any(|s| *s == name) {
        return Err(StoreError::UnknownStore(name));
    }

    let mode = ctx.mode.unwrap_or_default();
    let transaction = connection
        .clone()
        .transaction(&[name.as_str()], mode)
        .map_err(StoreError::Transaction)?;
    observe_transaction(transaction.as_ref(), &name);
    let store = transaction
        .clone()
        .object_store(&name)
        .map_err(|e| store_error(&name, e))?;

    Ok(ResolvedContext {
        transaction,
        store,
        mode,
        created: true,
    })
}

fn store_error(name: &str, error: EngineError) -> StoreError {
    match error {
        EngineError::NotFound(_) => StoreError::UnknownStore(name.to_string()),
        other => StoreError::Transaction(other),
    }
}

/// Log the outcome of a transaction the client opened itself.
fn observe_transaction(transaction: &dyn Transaction, store: &str) {
    let store = store.to_string();
    transaction.observe(Box::new(move |event: &TransactionEvent| match event {
        TransactionEvent::Complete => debug!("transaction on '{}' complete", store),
        TransactionEvent::Error(message) => {
            warn!("transaction on '{}' error: {}", store, message)
        }
        TransactionEvent::Abort(message) => {
            warn!("transaction on '{}' aborted: {}", store, message)
        }
    }));
}
