//! IndexedDB implementation of the stow engine traits.
//!
//! Each trait method issues its IndexedDB request immediately and returns a
//! future for the outcome, so several requests can be queued on one live
//! transaction before the first result arrives.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use futures::future::{self, FutureExt};
use serde_json::Value;
use stow_core::{
    Connection, ConnectionEvents, Direction, Engine, EngineError, EngineFuture, IndexQuery, Key,
    KeyRange, ObjectStore, StoreMetadata, StoreParams, Transaction, TransactionEvent,
    TransactionMode, TransactionObserver,
};
use tracing::{debug, warn};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::{
    IdbCursorWithValue, IdbDatabase, IdbIndex, IdbObjectStore, IdbOpenDbRequest, IdbRequest,
    IdbTransaction, IdbTransactionMode, IdbVersionChangeEvent,
};

use crate::error::{IdbError, Result};
use crate::idb;

type EventClosure = Closure<dyn FnMut(web_sys::Event)>;

/// The browser's IndexedDB.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdbEngine;

impl IdbEngine {
    pub fn new() -> Self {
        Self
    }

    /// Whether IndexedDB exists in this environment.
    pub fn is_available() -> bool {
        idb::idb_factory().is_ok()
    }
}

fn versions(event: &IdbVersionChangeEvent) -> (u32, Option<u32>) {
    (
        event.old_version() as u32,
        event.new_version().map(|v| v as u32),
    )
}

impl Engine for IdbEngine {
    fn open(
        &self,
        name: &str,
        version: u32,
        events: Rc<dyn ConnectionEvents>,
    ) -> EngineFuture<Rc<dyn Connection>> {
        let request = idb::idb_factory().and_then(|factory| {
            factory
                .open_with_u32(name, version)
                .map_err(IdbError::from)
        });
        let request = match request {
            Ok(request) => request,
            Err(e) => return future::ready(Err(e.into())).boxed_local(),
        };

        let upgrade_events = events.clone();
        let on_upgrade: idb::VersionHandler =
            Box::new(move |req: &IdbOpenDbRequest, event: &IdbVersionChangeEvent| {
                let Some(db) = req.result().ok().and_then(|r| r.dyn_into::<IdbDatabase>().ok())
                else {
                    warn!("upgrade event without a database");
                    return;
                };
                let (old_version, new_version) = versions(event);
                let connection = IdbConnection::new(db);
                upgrade_events.upgrade_needed(
                    &connection,
                    old_version,
                    new_version.unwrap_or(version),
                );
            });

        let blocked_events = events.clone();
        let on_blocked: idb::VersionHandler =
            Box::new(move |_req: &IdbOpenDbRequest, event: &IdbVersionChangeEvent| {
                let (old_version, new_version) = versions(event);
                blocked_events.blocked(old_version, new_version);
            });

        let pending = JsFuture::from(idb::open_request_promise(
            &request,
            Some(on_upgrade),
            on_blocked,
        ));
        let name = name.to_string();

        async move {
            let result = pending.await.map_err(|e| {
                if idb::is_blocked(&e) {
                    EngineError::Blocked(name.clone())
                } else {
                    EngineError::from(IdbError::from(e))
                }
            })?;
            let db = result
                .dyn_into::<IdbDatabase>()
                .map_err(|_| EngineError::Other("open result is not IdbDatabase".into()))?;
            let connection = Rc::new(IdbConnection::new(db));
            connection.attach(events);
            debug!("opened IndexedDB '{}' v{}", name, connection.version());
            Ok::<_, EngineError>(connection as Rc<dyn Connection>)
        }
        .boxed_local()
    }

    fn delete_database(&self, name: &str) -> EngineFuture<()> {
        let request = idb::idb_factory().and_then(|factory| {
            factory.delete_database(name).map_err(IdbError::from)
        });
        let request = match request {
            Ok(request) => request,
            Err(e) => return future::ready(Err(e.into())).boxed_local(),
        };

        let db_name = name.to_string();
        let on_blocked: idb::VersionHandler =
            Box::new(move |_req: &IdbOpenDbRequest, _event: &IdbVersionChangeEvent| {
                warn!("delete of '{}' blocked by open connections", db_name);
            });
        let pending = JsFuture::from(idb::open_request_promise(&request, None, on_blocked));
        let name = name.to_string();

        async move {
            pending.await.map_err(|e| {
                if idb::is_blocked(&e) {
                    EngineError::Blocked(name)
                } else {
                    EngineError::from(IdbError::from(e))
                }
            })?;
            Ok::<_, EngineError>(())
        }
        .boxed_local()
    }
}

/// An open IndexedDB database.
pub struct IdbConnection {
    db: IdbDatabase,
    closed: Cell<bool>,
    handlers: RefCell<Vec<EventClosure>>,
}

impl IdbConnection {
    fn new(db: IdbDatabase) -> Self {
        Self {
            db,
            closed: Cell::new(false),
            handlers: RefCell::new(Vec::new()),
        }
    }

    /// Route database events to `events`.
    fn attach(self: &Rc<Self>, events: Rc<dyn ConnectionEvents>) {
        let weak = Rc::downgrade(self);
        let on_version_change = connection_closure(&weak, &events, |conn, events, event| {
            let (old_version, new_version) = event
                .dyn_ref::<IdbVersionChangeEvent>()
                .map(versions)
                .unwrap_or((conn.version(), None));
            events.version_change(conn, old_version, new_version);
        });
        let on_close = connection_closure(&weak, &events, |conn, events, _event| {
            conn.closed.set(true);
            events.closed(conn);
        });
        let on_error = connection_closure(&weak, &events, |conn, events, event| {
            events.error(conn, &event_error(event));
        });
        let on_abort = connection_closure(&weak, &events, |conn, events, event| {
            events.abort(conn, &event_error(event));
        });

        self.db
            .set_onversionchange(Some(on_version_change.as_ref().unchecked_ref()));
        self.db.set_onclose(Some(on_close.as_ref().unchecked_ref()));
        self.db.set_onerror(Some(on_error.as_ref().unchecked_ref()));
        self.db.set_onabort(Some(on_abort.as_ref().unchecked_ref()));

        self.handlers
            .borrow_mut()
            .extend([on_version_change, on_close, on_error, on_abort]);
    }
}

/// Closure forwarding a database event while the connection is alive.
fn connection_closure(
    weak: &Weak<IdbConnection>,
    events: &Rc<dyn ConnectionEvents>,
    handle: impl Fn(&IdbConnection, &dyn ConnectionEvents, &web_sys::Event) + 'static,
) -> EventClosure {
    let weak = weak.clone();
    let events = events.clone();
    Closure::wrap(Box::new(move |event: web_sys::Event| {
        if let Some(conn) = weak.upgrade() {
            handle(&conn, events.as_ref(), &event);
        }
    }) as Box<dyn FnMut(web_sys::Event)>)
}

/// Message of the DOMException behind an error or abort event.
fn event_error(event: &web_sys::Event) -> String {
    let target = event.target();
    let exception = target.as_ref().and_then(|target| {
        if let Some(request) = target.dyn_ref::<IdbRequest>() {
            request.error().ok().flatten()
        } else if let Some(tx) = target.dyn_ref::<IdbTransaction>() {
            tx.error()
        } else {
            None
        }
    });
    exception
        .map(|e| format!("{}: {}", e.name(), e.message()))
        .unwrap_or_else(|| event.type_())
}

impl Drop for IdbConnection {
    fn drop(&mut self) {
        if !self.handlers.borrow().is_empty() {
            self.db.set_onversionchange(None);
            self.db.set_onclose(None);
            self.db.set_onerror(None);
            self.db.set_onabort(None);
        }
    }
}

impl Connection for IdbConnection {
    fn name(&self) -> String {
        self.db.name()
    }

    fn version(&self) -> u32 {
        self.db.version() as u32
    }

    fn store_names(&self) -> Vec<String> {
        idb::string_list(&self.db.object_store_names())
    }

    fn create_object_store(&self, name: &str, params: &StoreParams) -> stow_core::EngineResult<()> {
        create_store(&self.db, name, params).map_err(EngineError::from)
    }

    fn transaction(
        self: Rc<Self>,
        stores: &[&str],
        mode: TransactionMode,
    ) -> stow_core::EngineResult<Rc<dyn Transaction>> {
        let idb_mode = match mode {
            TransactionMode::ReadOnly => IdbTransactionMode::Readonly,
            TransactionMode::ReadWrite => IdbTransactionMode::Readwrite,
            TransactionMode::VersionChange => {
                return Err(EngineError::InvalidState(
                    "version change transactions are only created by upgrades".into(),
                ))
            }
        };
        let names: js_sys::Array = stores.iter().map(|s| JsValue::from_str(s)).collect();
        let tx = self
            .db
            .transaction_with_str_sequence_and_mode(&names, idb_mode)
            .map_err(|e| EngineError::from(IdbError::from(e)))?;

        let transaction = Rc::new(IdbTransactionHandle {
            tx,
            _connection: self,
            mode,
            scope: stores.iter().map(|s| s.to_string()).collect(),
            observers: Rc::new(RefCell::new(Vec::new())),
        });
        transaction.watch();
        Ok(transaction)
    }

    fn close(&self) {
        if !self.closed.replace(true) {
            self.db.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

fn create_store(db: &IdbDatabase, name: &str, params: &StoreParams) -> Result<()> {
    let options = web_sys::IdbObjectStoreParameters::new();
    if let Some(key_path) = &params.key_path {
        js_sys::Reflect::set(&options, &"keyPath".into(), &JsValue::from_str(key_path))?;
    }
    js_sys::Reflect::set(
        &options,
        &"autoIncrement".into(),
        &JsValue::from_bool(params.auto_increment),
    )?;
    let store = db.create_object_store_with_optional_parameters(name, &options)?;

    for index in &params.indexes {
        let index_options = web_sys::IdbIndexParameters::new();
        js_sys::Reflect::set(&index_options, &"unique".into(), &JsValue::from_bool(index.unique))?;
        js_sys::Reflect::set(
            &index_options,
            &"multiEntry".into(),
            &JsValue::from_bool(index.multi_entry),
        )?;
        store.create_index_with_str_and_optional_parameters(
            &index.name,
            &index.key_path,
            &index_options,
        )?;
    }
    Ok(())
}

/// An IndexedDB transaction.
pub struct IdbTransactionHandle {
    tx: IdbTransaction,
    // Keeps the connection alive while the transaction is in use
    _connection: Rc<IdbConnection>,
    mode: TransactionMode,
    scope: Vec<String>,
    observers: Rc<RefCell<Vec<TransactionObserver>>>,
}

impl IdbTransactionHandle {
    /// Forward complete/error/abort to the observers. The closures release
    /// themselves once the transaction finishes.
    fn watch(&self) {
        let closures: Rc<RefCell<Option<(EventClosure, EventClosure, EventClosure)>>> =
            Rc::new(RefCell::new(None));

        let observers = self.observers.clone();
        let closures_for_complete = closures.clone();
        let on_complete = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            notify(&observers, &TransactionEvent::Complete);
            *closures_for_complete.borrow_mut() = None;
        }) as Box<dyn FnMut(web_sys::Event)>);

        let observers = self.observers.clone();
        let on_error = Closure::wrap(Box::new(move |event: web_sys::Event| {
            notify(&observers, &TransactionEvent::Error(event_error(&event)));
        }) as Box<dyn FnMut(web_sys::Event)>);

        let observers = self.observers.clone();
        let closures_for_abort = closures.clone();
        let on_abort = Closure::wrap(Box::new(move |event: web_sys::Event| {
            notify(&observers, &TransactionEvent::Abort(event_error(&event)));
            *closures_for_abort.borrow_mut() = None;
        }) as Box<dyn FnMut(web_sys::Event)>);

        self.tx
            .set_oncomplete(Some(on_complete.as_ref().unchecked_ref()));
        self.tx.set_onerror(Some(on_error.as_ref().unchecked_ref()));
        self.tx.set_onabort(Some(on_abort.as_ref().unchecked_ref()));

        *closures.borrow_mut() = Some((on_complete, on_error, on_abort));
    }
}

fn notify(observers: &RefCell<Vec<TransactionObserver>>, event: &TransactionEvent) {
    for observer in observers.borrow().iter() {
        observer(event);
    }
}

impl Transaction for IdbTransactionHandle {
    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn store_names(&self) -> Vec<String> {
        self.scope.clone()
    }

    fn object_store(self: Rc<Self>, name: &str) -> stow_core::EngineResult<Rc<dyn ObjectStore>> {
        let store = self
            .tx
            .object_store(name)
            .map_err(|e| EngineError::from(IdbError::from(e)))?;
        Ok(Rc::new(IdbStoreHandle {
            store,
            transaction: self,
        }))
    }

    fn observe(&self, observer: TransactionObserver) {
        self.observers.borrow_mut().push(observer);
    }

    fn abort(&self) -> stow_core::EngineResult<()> {
        self.tx
            .abort()
            .map_err(|e| EngineError::from(IdbError::from(e)))
    }
}

/// An object store inside an [`IdbTransactionHandle`].
pub struct IdbStoreHandle {
    store: IdbObjectStore,
    transaction: Rc<IdbTransactionHandle>,
}

/// Issue a request now and return a future mapping its result.
fn issue<T: 'static>(
    request: Result<IdbRequest>,
    map: impl FnOnce(JsValue) -> Result<T> + 'static,
) -> EngineFuture<T> {
    let pending = request.map(|req| idb::await_request(&req));
    settle(pending, map).boxed_local()
}

async fn settle<T>(
    pending: Result<JsFuture>,
    map: impl FnOnce(JsValue) -> Result<T>,
) -> stow_core::EngineResult<T> {
    let result = pending?.await.map_err(IdbError::from)?;
    Ok(map(result)?)
}

/// Walk a cursor request now, collecting what `extract` returns, up to
/// `limit` items (0 for all).
fn collect_cursor<T: 'static>(
    request: Result<IdbRequest>,
    limit: u32,
    extract: impl Fn(&IdbCursorWithValue) -> Result<T> + 'static,
) -> EngineFuture<Vec<T>> {
    let items = Rc::new(RefCell::new(Vec::new()));
    let sink = items.clone();
    let pending = request.map(|req| {
        JsFuture::from(idb::cursor_promise(
            &req,
            Box::new(move |cursor: &IdbCursorWithValue| {
                let mut sink = sink.borrow_mut();
                sink.push(extract(cursor)?);
                Ok(limit == 0 || (sink.len() as u32) < limit)
            }),
        ))
    });
    settle(pending, move |_| Ok(std::mem::take(&mut *items.borrow_mut()))).boxed_local()
}

fn cursor_key(cursor: &IdbCursorWithValue) -> Result<Key> {
    let key = cursor.primary_key()?;
    idb::js_to_key(&key).ok_or_else(|| IdbError::JsValue("unsupported primary key".into()))
}

fn cursor_value(cursor: &IdbCursorWithValue) -> Result<Value> {
    idb::js_to_value(&cursor.value()?)
}

impl IdbStoreHandle {
    fn index(&self, name: &str) -> Result<IdbIndex> {
        Ok(self.store.index(name)?)
    }

    /// Cursor over the index for queries that `getAll` cannot express.
    fn index_cursor(&self, query: &IndexQuery) -> Result<IdbRequest> {
        let index = self.index(&query.name)?;
        let range = idb::key_query_to_js(query.value.as_ref())?;
        let direction = idb::cursor_direction(query.direction.unwrap_or_default());
        Ok(index.open_cursor_with_range_and_direction(&range, direction)?)
    }

    fn uses_cursor(query: &IndexQuery) -> bool {
        query.direction.unwrap_or_default() != Direction::Next
    }
}

impl ObjectStore for IdbStoreHandle {
    fn name(&self) -> String {
        self.store.name()
    }

    fn metadata(&self) -> StoreMetadata {
        StoreMetadata {
            name: self.store.name(),
            key_path: self.store.key_path().ok().and_then(|path| path.as_string()),
            auto_increment: self.store.auto_increment(),
            index_names: idb::string_list(&self.store.index_names()),
        }
    }

    fn transaction(&self) -> Rc<dyn Transaction> {
        self.transaction.clone()
    }

    fn add(&self, value: &Value) -> EngineFuture<Key> {
        let request = idb::value_to_js(value)
            .and_then(|record| self.store.add(&record).map_err(IdbError::from));
        issue(request, |key| {
            idb::js_to_key(&key).ok_or_else(|| IdbError::JsValue("unsupported primary key".into()))
        })
    }

    fn clear(&self) -> EngineFuture<()> {
        let request = self.store.clear().map_err(IdbError::from);
        issue(request, |_| Ok(()))
    }

    fn delete(&self, range: &KeyRange) -> EngineFuture<()> {
        let request = idb::key_range_to_js(range)
            .and_then(|range| self.store.delete(&range).map_err(IdbError::from));
        issue(request, |_| Ok(()))
    }

    fn for_each(&self, mut visitor: Box<dyn FnMut(&Key, &Value)>) -> EngineFuture<usize> {
        let pending = self.store.open_cursor().map_err(IdbError::from).map(|req| {
            JsFuture::from(idb::cursor_promise(
                &req,
                Box::new(move |cursor: &IdbCursorWithValue| {
                    visitor(&cursor_key(cursor)?, &cursor_value(cursor)?);
                    Ok(true)
                }),
            ))
        });
        settle(pending, |visited| Ok(visited.as_f64().unwrap_or(0.0) as usize)).boxed_local()
    }

    fn index_get_all(&self, query: &IndexQuery) -> EngineFuture<Vec<Value>> {
        let limit = query.count.unwrap_or(0);
        if Self::uses_cursor(query) {
            return collect_cursor(self.index_cursor(query), limit, cursor_value);
        }
        let request = self.index(&query.name).and_then(|index| {
            let range = idb::key_query_to_js(query.value.as_ref())?;
            Ok(index.get_all_with_key_and_limit(&range, limit)?)
        });
        issue(request, |result| {
            js_sys::Array::from(&result)
                .iter()
                .map(|item| idb::js_to_value(&item))
                .collect()
        })
    }

    fn index_get_all_keys(&self, query: &IndexQuery) -> EngineFuture<Vec<Key>> {
        let limit = query.count.unwrap_or(0);
        if Self::uses_cursor(query) {
            return collect_cursor(self.index_cursor(query), limit, cursor_key);
        }
        let request = self.index(&query.name).and_then(|index| {
            let range = idb::key_query_to_js(query.value.as_ref())?;
            Ok(index.get_all_keys_with_key_and_limit(&range, limit)?)
        });
        issue(request, |result| {
            js_sys::Array::from(&result)
                .iter()
                .map(|item| {
                    idb::js_to_key(&item)
                        .ok_or_else(|| IdbError::JsValue("unsupported primary key".into()))
                })
                .collect()
        })
    }

    fn index_count(&self, query: &IndexQuery) -> EngineFuture<u64> {
        let request = self.index(&query.name).and_then(|index| {
            let range = idb::key_query_to_js(query.value.as_ref())?;
            Ok(index.count_with_key(&range)?)
        });
        issue(request, |count| Ok(count.as_f64().unwrap_or(0.0) as u64))
    }
}
