//! Browser WASM bindings using wasm-bindgen and IndexedDB storage
//!
//! Wraps a single [`StorageClient`] over IndexedDB and `localStorage`.
//! Records, keys and templates cross the boundary as JSON strings; errors
//! reject the returned promise with a message string.
//!
//! ```js
//! await init_client(null, "info");
//! add_store_templates(JSON.stringify([{ name: "notes", template: {
//!     options: { keyPath: "id", autoIncrement: true },
//!     record: { tag: { index: true } },
//! }}]));
//! const keys = JSON.parse(await store_items(JSON.stringify([{ tag: "a" }]), "notes"));
//! const count = await count_items("tag", JSON.stringify("a"), "notes");
//! ```

use std::cell::RefCell;
use std::fmt::Display;
use std::rc::Rc;

use serde::Serialize;
use serde_json::Value;
use stow_core::{ClientConfig, Connection, Key, OperationContext, StorageClient};
use stow_indexeddb::{IdbEngine, LocalStorageSettings};
use wasm_bindgen::prelude::*;

use crate::{console, BridgeError};

type Client = StorageClient<IdbEngine, LocalStorageSettings>;

/// Global client instance (initialized via init_client)
/// Using Rc<RefCell<>> because WASM is single-threaded and we need to share across async boundaries
thread_local! {
    static CLIENT: RefCell<Option<Rc<Client>>> = const { RefCell::new(None) };
}

/// Create the storage client. Must be called before any other function.
///
/// `config` is optional `ClientConfig` JSON; `log_filter` defaults to "info".
#[wasm_bindgen]
pub fn init_client(config: Option<String>, log_filter: Option<String>) -> Result<(), JsValue> {
    // Route Rust panics to console.error instead of "RuntimeError: unreachable"
    console_error_panic_hook::set_once();
    console::init(log_filter.as_deref().unwrap_or("info"));

    let config = match config {
        Some(json) => ClientConfig::from_json(&json).map_err(|source| {
            js_error(BridgeError::Payload {
                what: "config",
                source,
            })
        })?,
        None => ClientConfig::default(),
    };
    let settings = LocalStorageSettings::new().map_err(js_error)?;

    CLIENT.with(|c| {
        let mut c = c.borrow_mut();
        if c.is_some() {
            return Err(JsValue::from_str("Client already initialized"));
        }
        *c = Some(Rc::new(StorageClient::with_config(
            IdbEngine::new(),
            settings,
            config,
        )));
        Ok(())
    })
}

/// Get a clone of the client Rc.
fn get_client() -> Result<Rc<Client>, JsValue> {
    CLIENT
        .with(|c| c.borrow().clone())
        .ok_or_else(|| js_error(BridgeError::NotInitialized))
}

fn js_error(e: impl Display) -> JsValue {
    JsValue::from_str(&e.to_string())
}

fn to_json<T: Serialize>(value: &T) -> Result<String, JsValue> {
    serde_json::to_string(value).map_err(js_error)
}

fn json_to_js(value: &Value) -> JsValue {
    serde_json::to_string(value)
        .ok()
        .and_then(|json| js_sys::JSON::parse(&json).ok())
        .unwrap_or(JsValue::UNDEFINED)
}

fn context(store_name: Option<String>) -> OperationContext {
    store_name.map(OperationContext::from).unwrap_or_default()
}

// ============================================================================
// Schema and settings
// ============================================================================

/// Select the database (and optionally its version) to open next.
#[wasm_bindgen]
pub fn set_database(name: &str, version: Option<u32>) -> Result<(), JsValue> {
    get_client()?.set_database(name, version);
    Ok(())
}

/// Register store templates. Pass a store name plus template JSON, or a
/// single templates payload. Returns the registered templates as JSON.
#[wasm_bindgen]
pub fn add_store_templates(
    name_or_templates: &str,
    template: Option<String>,
) -> Result<String, JsValue> {
    let client = get_client()?;
    let pairs = match template {
        Some(json) => vec![(
            name_or_templates.to_string(),
            crate::parse_template(&json).map_err(js_error)?,
        )],
        None => crate::parse_templates(name_or_templates).map_err(js_error)?,
    };
    client.add_store_templates(pairs);
    to_json(&client.properties().templates)
}

/// Set the default store when `name` is given; returns the current default.
#[wasm_bindgen]
pub fn default_store(name: Option<String>) -> Result<Option<String>, JsValue> {
    let client = get_client()?;
    if let Some(name) = name {
        client.set_default_store(&name);
    }
    Ok(client.default_store())
}

/// Template JSON for a store (default store when omitted), or null.
#[wasm_bindgen]
pub fn store_template(name: Option<String>) -> Result<Option<String>, JsValue> {
    let client = get_client()?;
    client
        .store_template(name.as_deref())
        .map(|template| to_json(&template))
        .transpose()
}

/// Current `{name, version, default_store, templates}` as JSON.
#[wasm_bindgen]
pub fn properties() -> Result<String, JsValue> {
    to_json(&get_client()?.properties())
}

// ============================================================================
// Connection
// ============================================================================

/// Open the selected database. Resolves to `{name, version, stores}` JSON.
#[wasm_bindgen]
pub async fn open_object_store(store_name: Option<String>) -> Result<String, JsValue> {
    let client = get_client()?;
    let connection = client
        .open_object_store(store_name.as_deref())
        .await
        .map_err(js_error)?;
    to_json(&serde_json::json!({
        "name": connection.name(),
        "version": connection.version(),
        "stores": connection.store_names(),
    }))
}

#[wasm_bindgen]
pub fn close_database() -> Result<(), JsValue> {
    get_client()?.close_database("close_database");
    Ok(())
}

/// Delete a database (the selected one when omitted).
#[wasm_bindgen]
pub async fn delete_database(name: Option<String>) -> Result<(), JsValue> {
    let client = get_client()?;
    client
        .delete_database(name.as_deref())
        .await
        .map_err(js_error)
}

// ============================================================================
// Records
// ============================================================================

/// Store a JSON array of records (or one record). Resolves to the JSON
/// array of primary keys.
#[wasm_bindgen]
pub async fn store_items(items: String, store_name: Option<String>) -> Result<String, JsValue> {
    let client = get_client()?;
    let items = crate::parse_items(&items).map_err(js_error)?;
    let keys = client
        .store_items(&items, context(store_name))
        .await
        .map_err(js_error)?;
    to_json(&keys)
}

/// Call `callback(key, record, position)` for every record in key order.
/// Resolves to the number of records visited.
#[wasm_bindgen]
pub async fn fetch_items(
    callback: js_sys::Function,
    store_name: Option<String>,
) -> Result<u32, JsValue> {
    let client = get_client()?;
    let visited = client
        .fetch_items(
            move |key: &Key, value: &Value, position: usize| {
                let _ = callback.call3(
                    &JsValue::NULL,
                    &json_to_js(&key.to_value()),
                    &json_to_js(value),
                    &JsValue::from(position as u32),
                );
            },
            context(store_name),
        )
        .await
        .map_err(js_error)?;
    Ok(visited as u32)
}

/// Records whose `index` matches `value` (JSON key or key range), as JSON.
#[wasm_bindgen]
pub async fn lookup_items(
    index: String,
    value: String,
    store_name: Option<String>,
) -> Result<String, JsValue> {
    let client = get_client()?;
    let value = crate::parse_key_query(&value).map_err(js_error)?;
    let records = client
        .lookup_items(&index, value, context(store_name))
        .await
        .map_err(js_error)?;
    to_json(&records)
}

/// Records matching a full index query (with count and direction), as JSON.
#[wasm_bindgen]
pub async fn lookup_items_query(
    query: String,
    store_name: Option<String>,
) -> Result<String, JsValue> {
    let client = get_client()?;
    let query = crate::parse_index_query(&query).map_err(js_error)?;
    let records = client
        .lookup_items_with(query, context(store_name))
        .await
        .map_err(js_error)?;
    to_json(&records)
}

#[wasm_bindgen]
pub async fn count_items(
    index: String,
    value: String,
    store_name: Option<String>,
) -> Result<f64, JsValue> {
    let client = get_client()?;
    let value = crate::parse_key_query(&value).map_err(js_error)?;
    let count = client
        .count_items(&index, value, context(store_name))
        .await
        .map_err(js_error)?;
    Ok(count as f64)
}

/// Primary keys of the records whose `index` matches `value`, as JSON.
#[wasm_bindgen]
pub async fn lookup_store_keys(
    index: String,
    value: String,
    store_name: Option<String>,
) -> Result<String, JsValue> {
    let client = get_client()?;
    let value = crate::parse_key_query(&value).map_err(js_error)?;
    let keys = client
        .lookup_store_keys(&index, value, context(store_name))
        .await
        .map_err(js_error)?;
    to_json(&keys)
}

/// Delete the records whose `index` matches `value`. Resolves to the
/// number removed.
#[wasm_bindgen]
pub async fn delete_items(
    index: String,
    value: String,
    store_name: Option<String>,
) -> Result<u32, JsValue> {
    let client = get_client()?;
    let value = crate::parse_key_query(&value).map_err(js_error)?;
    let removed = client
        .delete_items(&index, value, context(store_name))
        .await
        .map_err(js_error)?;
    Ok(removed as u32)
}

/// Remove every record from a store (the default store when omitted).
#[wasm_bindgen]
pub async fn clear_object_store(store_name: Option<String>) -> Result<(), JsValue> {
    let client = get_client()?;
    client
        .clear_object_store(store_name.as_deref())
        .await
        .map_err(js_error)
}

// ============================================================================
// Utilities
// ============================================================================

/// Get the stow version.
#[wasm_bindgen]
pub fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Check if the client is initialized.
#[wasm_bindgen]
pub fn is_client_initialized() -> bool {
    CLIENT.with(|c| c.borrow().is_some())
}
