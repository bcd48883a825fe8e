//! Error types for the IndexedDB engine

use stow_core::EngineError;
use thiserror::Error;
use wasm_bindgen::{JsCast, JsValue};
use web_sys::DomException;

/// Result type for IndexedDB operations
pub type Result<T> = std::result::Result<T, IdbError>;

/// Errors that can occur talking to IndexedDB or localStorage
#[derive(Debug, Error)]
pub enum IdbError {
    /// IndexedDB or localStorage is not available in this environment
    #[error("not available: {0}")]
    NotAvailable(String),

    /// A DOMException raised by the browser
    #[error("{name}: {message}")]
    Dom { name: String, message: String },

    /// Open request was blocked by connections in other sessions
    #[error("open of '{0}' blocked")]
    Blocked(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// JavaScript value conversion error
    #[error("JS conversion error: {0}")]
    JsValue(String),
}

impl From<JsValue> for IdbError {
    fn from(val: JsValue) -> Self {
        if let Some(exception) = val.dyn_ref::<DomException>() {
            return IdbError::Dom {
                name: exception.name(),
                message: exception.message(),
            };
        }
        if let Some(message) = val.as_string() {
            return IdbError::JsValue(message);
        }
        let msg = js_sys::JSON::stringify(&val)
            .map(String::from)
            .unwrap_or_else(|_| format!("{:?}", val));
        IdbError::JsValue(msg)
    }
}

/// Map browser errors onto the engine error classes by DOMException name.
impl From<IdbError> for EngineError {
    fn from(err: IdbError) -> Self {
        match err {
            IdbError::NotAvailable(msg) => EngineError::NotAvailable(msg),
            IdbError::Blocked(name) => EngineError::Blocked(name),
            IdbError::Json(e) => EngineError::Data(e.to_string()),
            IdbError::JsValue(msg) => EngineError::Other(msg),
            IdbError::Dom { name, message } => match name.as_str() {
                "ConstraintError" => EngineError::Constraint(message),
                "DataError" | "DataCloneError" => EngineError::Data(message),
                "ReadOnlyError" => EngineError::ReadOnly(message),
                "NotFoundError" => EngineError::NotFound(message),
                "InvalidStateError" | "TransactionInactiveError" | "InvalidAccessError" => {
                    EngineError::InvalidState(message)
                }
                "AbortError" => EngineError::Aborted(message),
                _ => EngineError::Other(format!("{}: {}", name, message)),
            },
        }
    }
}
