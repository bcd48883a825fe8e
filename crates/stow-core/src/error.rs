//! Error types for the object-store client and its engines

use thiserror::Error;

/// Result type for client operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for native engine requests
pub type EngineResult<T> = Result<T, EngineError>;

/// Broad failure classes surfaced by the client.
///
/// Every error is logged where it is caught; the kind tells callers which
/// layer gave up without matching on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown store name or missing template
    Configuration,
    /// Open blocked/failed, or a handle-level failure
    Connection,
    /// A single store/fetch/lookup/count/delete request failed
    Request,
    /// Abort or error at transaction granularity
    Transaction,
}

/// Errors that can occur during client operations
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Store name is not registered with the schema registry or the database
    #[error("unknown store: {0}")]
    UnknownStore(String),

    /// No store was named and no default store is registered
    #[error("no store named and no default store registered")]
    NoDefaultStore,

    /// Another session holds the database open at an incompatible version
    #[error("open of '{name}' v{version} blocked by another connection")]
    Blocked { name: String, version: u32 },

    /// Database open failed
    #[error("open of '{name}' failed: {source}")]
    Open { name: String, source: EngineError },

    /// No connection is available for the operation
    #[error("database is not open")]
    NotOpen,

    /// A single native request failed
    #[error("{operation} request failed: {source}")]
    Request {
        operation: &'static str,
        source: EngineError,
    },

    /// Transaction could not be created or was aborted
    #[error("transaction error: {0}")]
    Transaction(EngineError),

    /// Record could not be converted to or from JSON
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::UnknownStore(_) | StoreError::NoDefaultStore => ErrorKind::Configuration,
            StoreError::Blocked { .. } | StoreError::Open { .. } | StoreError::NotOpen => {
                ErrorKind::Connection
            }
            StoreError::Request { .. } | StoreError::Serialization(_) => ErrorKind::Request,
            StoreError::Transaction(_) => ErrorKind::Transaction,
        }
    }

    pub(crate) fn request(operation: &'static str) -> impl FnOnce(EngineError) -> StoreError {
        move |source| StoreError::Request { operation, source }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors reported by a native storage engine.
///
/// Variants follow the failure names the browser engine reports
/// (`ConstraintError`, `DataError`, `ReadOnlyError`, ...), so both the
/// in-memory and the IndexedDB engine map onto the same set.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The storage facility is missing from this environment
    #[error("storage engine not available: {0}")]
    NotAvailable(String),

    /// Object store or index does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Key already exists or a unique index would be violated
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// Invalid key or value
    #[error("invalid data: {0}")]
    Data(String),

    /// Write attempted in a read-only transaction
    #[error("read-only transaction: {0}")]
    ReadOnly(String),

    /// Operation is not allowed in the current state (closed connection,
    /// finished transaction, schema change outside an upgrade)
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Requested version is lower than the stored one
    #[error("requested version {requested} is lower than existing version {existing}")]
    Version { requested: u32, existing: u32 },

    /// Open or delete blocked by other open connections
    #[error("blocked: database '{0}' is held open by another connection")]
    Blocked(String),

    /// The owning transaction was aborted
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// Anything else the engine reports
    #[error("{0}")]
    Other(String),
}
