//! Low-level IndexedDB helpers using web-sys
//!
//! Wraps the callback-based IndexedDB API into Rust futures using
//! `wasm_bindgen_futures::JsFuture` and `js_sys::Promise`, and converts
//! keys, key ranges and records between stow and JavaScript.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use js_sys::Promise;
use serde_json::Value;
use stow_core::{Direction, Key, KeyQuery, KeyRange};
use tracing::debug;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::{
    IdbCursorDirection, IdbCursorWithValue, IdbDatabase, IdbFactory, IdbKeyRange,
    IdbOpenDbRequest, IdbRequest, IdbVersionChangeEvent,
};

use crate::error::{IdbError, Result};

/// Rejection value used when an open or delete request is blocked.
const BLOCKED: &str = "stow:blocked";

type EventClosure = Closure<dyn FnMut(web_sys::Event)>;
type VersionClosure = Closure<dyn FnMut(IdbVersionChangeEvent)>;

/// Callback invoked with an upgrade or blocked event.
pub type VersionHandler = Box<dyn FnMut(&IdbOpenDbRequest, &IdbVersionChangeEvent)>;

/// Get the global IndexedDB factory.
pub fn idb_factory() -> Result<IdbFactory> {
    let global = js_sys::global();

    let idb: JsValue = js_sys::Reflect::get(&global, &"indexedDB".into())
        .map_err(|_| IdbError::NotAvailable("no indexedDB on global".into()))?;

    if idb.is_undefined() || idb.is_null() {
        return Err(IdbError::NotAvailable("indexedDB is null/undefined".into()));
    }

    idb.dyn_into::<IdbFactory>()
        .map_err(|_| IdbError::NotAvailable("indexedDB is not IdbFactory".into()))
}

/// Convert an IdbRequest into a JS Promise that resolves with the request's
/// result or rejects with its DOMException.
///
/// Handlers are attached immediately, so the returned promise observes the
/// request even if it is awaited later.
pub fn request_to_promise(req: &IdbRequest) -> Promise {
    let req_success = req.clone();
    let req_error = req.clone();

    Promise::new(&mut move |resolve, reject| {
        let closures: Rc<RefCell<Option<(EventClosure, EventClosure)>>> =
            Rc::new(RefCell::new(None));

        let req_s = req_success.clone();
        let closures_for_success = closures.clone();
        let on_success = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let result = req_s.result().unwrap_or(JsValue::UNDEFINED);
            let _ = resolve.call1(&JsValue::UNDEFINED, &result);
            *closures_for_success.borrow_mut() = None;
        }) as Box<dyn FnMut(web_sys::Event)>);

        let req_e = req_error.clone();
        let closures_for_error = closures.clone();
        let on_error = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let _ = reject.call1(&JsValue::UNDEFINED, &request_error(&req_e));
            *closures_for_error.borrow_mut() = None;
        }) as Box<dyn FnMut(web_sys::Event)>);

        req_success.set_onsuccess(Some(on_success.as_ref().unchecked_ref()));
        req_error.set_onerror(Some(on_error.as_ref().unchecked_ref()));

        // Keep both closures alive until one fires
        *closures.borrow_mut() = Some((on_success, on_error));
    })
}

/// Future for an IdbRequest's result.
pub fn await_request(req: &IdbRequest) -> JsFuture {
    JsFuture::from(request_to_promise(req))
}

/// The request's DOMException, or a generic message.
fn request_error(req: &IdbRequest) -> JsValue {
    match req.error() {
        Ok(Some(exception)) => exception.into(),
        _ => JsValue::from_str("unknown IDB error"),
    }
}

/// Promise for an open or delete request.
///
/// Upgrade events go to `on_upgrade`. A blocked event goes to `on_blocked`
/// and rejects the promise; if the request later succeeds anyway, the
/// database it yields is closed straight away.
pub fn open_request_promise(
    req: &IdbOpenDbRequest,
    on_upgrade: Option<VersionHandler>,
    on_blocked: VersionHandler,
) -> Promise {
    let req = req.clone();
    let mut on_upgrade = on_upgrade;
    let mut on_blocked = Some(on_blocked);

    Promise::new(&mut move |resolve, reject| {
        type Handlers = (EventClosure, EventClosure, VersionClosure, VersionClosure);
        let closures: Rc<RefCell<Option<Handlers>>> = Rc::new(RefCell::new(None));
        let blocked = Rc::new(Cell::new(false));

        let req_s = req.clone();
        let blocked_s = blocked.clone();
        let closures_for_success = closures.clone();
        let on_success = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let result = req_s.result().unwrap_or(JsValue::UNDEFINED);
            if blocked_s.get() {
                if let Some(db) = result.dyn_ref::<IdbDatabase>() {
                    debug!("closing '{}' opened after its request was blocked", db.name());
                    db.close();
                }
            } else {
                let _ = resolve.call1(&JsValue::UNDEFINED, &result);
            }
            *closures_for_success.borrow_mut() = None;
        }) as Box<dyn FnMut(web_sys::Event)>);

        let req_e = req.clone();
        let blocked_e = blocked.clone();
        let reject_e = reject.clone();
        let closures_for_error = closures.clone();
        let on_error = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            if !blocked_e.get() {
                let _ = reject_e.call1(&JsValue::UNDEFINED, &request_error(&req_e));
            }
            *closures_for_error.borrow_mut() = None;
        }) as Box<dyn FnMut(web_sys::Event)>);

        let req_u = req.clone();
        let mut upgrade = on_upgrade.take();
        let on_upgrade_closure = Closure::wrap(Box::new(move |event: IdbVersionChangeEvent| {
            if let Some(handler) = upgrade.as_mut() {
                handler(&req_u, &event);
            }
        }) as Box<dyn FnMut(IdbVersionChangeEvent)>);

        let req_b = req.clone();
        let mut blocked_handler = on_blocked.take();
        let on_blocked_closure = Closure::wrap(Box::new(move |event: IdbVersionChangeEvent| {
            if blocked.replace(true) {
                return;
            }
            if let Some(handler) = blocked_handler.as_mut() {
                handler(&req_b, &event);
            }
            let _ = reject.call1(&JsValue::UNDEFINED, &JsValue::from_str(BLOCKED));
        }) as Box<dyn FnMut(IdbVersionChangeEvent)>);

        req.set_onsuccess(Some(on_success.as_ref().unchecked_ref()));
        req.set_onerror(Some(on_error.as_ref().unchecked_ref()));
        req.set_onupgradeneeded(Some(on_upgrade_closure.as_ref().unchecked_ref()));
        req.set_onblocked(Some(on_blocked_closure.as_ref().unchecked_ref()));

        // Keep every closure alive until success or error
        *closures.borrow_mut() = Some((
            on_success,
            on_error,
            on_upgrade_closure,
            on_blocked_closure,
        ));
    })
}

/// Whether a rejection came from a blocked open or delete.
pub fn is_blocked(val: &JsValue) -> bool {
    val.as_string().is_some_and(|s| s == BLOCKED)
}

/// Promise for a cursor walk: `visit` is called per cursor position and
/// returns whether to continue. Resolves with the number of positions
/// visited.
pub fn cursor_promise(
    req: &IdbRequest,
    visit: Box<dyn FnMut(&IdbCursorWithValue) -> Result<bool>>,
) -> Promise {
    let req = req.clone();
    let mut visit = Some(visit);

    Promise::new(&mut move |resolve, reject| {
        let closures: Rc<RefCell<Option<(EventClosure, EventClosure)>>> =
            Rc::new(RefCell::new(None));
        let Some(mut visit) = visit.take() else {
            return;
        };
        let mut visited: u32 = 0;

        let req_s = req.clone();
        let reject_s = reject.clone();
        let closures_for_success = closures.clone();
        let on_success = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let result = req_s.result().unwrap_or(JsValue::NULL);
            let Some(cursor) = result.dyn_ref::<IdbCursorWithValue>() else {
                let _ = resolve.call1(&JsValue::UNDEFINED, &JsValue::from(visited));
                *closures_for_success.borrow_mut() = None;
                return;
            };
            let step = visit(cursor).and_then(|more| {
                visited += 1;
                if more {
                    cursor.continue_().map_err(IdbError::from)?;
                }
                Ok(more)
            });
            match step {
                Ok(true) => {}
                Ok(false) => {
                    let _ = resolve.call1(&JsValue::UNDEFINED, &JsValue::from(visited));
                    *closures_for_success.borrow_mut() = None;
                }
                Err(e) => {
                    let _ = reject_s.call1(&JsValue::UNDEFINED, &JsValue::from_str(&e.to_string()));
                    *closures_for_success.borrow_mut() = None;
                }
            }
        }) as Box<dyn FnMut(web_sys::Event)>);

        let req_e = req.clone();
        let closures_for_error = closures.clone();
        let on_error = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let _ = reject.call1(&JsValue::UNDEFINED, &request_error(&req_e));
            *closures_for_error.borrow_mut() = None;
        }) as Box<dyn FnMut(web_sys::Event)>);

        req.set_onsuccess(Some(on_success.as_ref().unchecked_ref()));
        req.set_onerror(Some(on_error.as_ref().unchecked_ref()));

        *closures.borrow_mut() = Some((on_success, on_error));
    })
}

// ============================================================================
// Conversions
// ============================================================================

/// Convert a key to its JavaScript form.
pub fn key_to_js(key: &Key) -> JsValue {
    match key {
        Key::Int(i) => JsValue::from_f64(*i as f64),
        Key::Float(f) => JsValue::from_f64(*f),
        Key::Text(s) => JsValue::from_str(s),
        Key::Array(items) => items.iter().map(key_to_js).collect::<js_sys::Array>().into(),
    }
}

/// Convert a JavaScript key back. Dates and binary keys are not supported.
pub fn js_to_key(val: &JsValue) -> Option<Key> {
    if let Some(n) = val.as_f64() {
        return Some(Key::from(n));
    }
    if let Some(s) = val.as_string() {
        return Some(Key::Text(s));
    }
    if js_sys::Array::is_array(val) {
        let array = js_sys::Array::from(val);
        return array
            .iter()
            .map(|item| js_to_key(&item))
            .collect::<Option<Vec<_>>>()
            .map(Key::Array);
    }
    None
}

/// Convert a JSON record into a JavaScript object via JSON text.
pub fn value_to_js(value: &Value) -> Result<JsValue> {
    let json = serde_json::to_string(value)?;
    js_sys::JSON::parse(&json).map_err(IdbError::from)
}

/// Convert a JavaScript value into JSON via JSON text.
pub fn js_to_value(val: &JsValue) -> Result<Value> {
    if val.is_undefined() {
        return Ok(Value::Null);
    }
    let json: String = js_sys::JSON::stringify(val)
        .map_err(IdbError::from)?
        .into();
    Ok(serde_json::from_str(&json)?)
}

/// Convert a key range. A range with no bounds maps to `undefined`, which
/// IndexedDB treats as "everything".
pub fn key_range_to_js(range: &KeyRange) -> Result<JsValue> {
    let range = match (&range.lower, &range.upper) {
        (Some(lower), Some(upper)) if lower == upper && !range.lower_open && !range.upper_open => {
            IdbKeyRange::only(&key_to_js(lower))
        }
        (Some(lower), Some(upper)) => IdbKeyRange::bound_with_lower_open_and_upper_open(
            &key_to_js(lower),
            &key_to_js(upper),
            range.lower_open,
            range.upper_open,
        ),
        (Some(lower), None) => IdbKeyRange::lower_bound_with_open(&key_to_js(lower), range.lower_open),
        (None, Some(upper)) => IdbKeyRange::upper_bound_with_open(&key_to_js(upper), range.upper_open),
        (None, None) => return Ok(JsValue::UNDEFINED),
    };
    range.map(JsValue::from).map_err(IdbError::from)
}

/// Convert an index selector: a key or a key range.
pub fn key_query_to_js(query: Option<&KeyQuery>) -> Result<JsValue> {
    match query {
        None => Ok(JsValue::UNDEFINED),
        Some(KeyQuery::Key(key)) => Ok(key_to_js(key)),
        Some(KeyQuery::Range(range)) => key_range_to_js(range),
    }
}

pub fn cursor_direction(direction: Direction) -> IdbCursorDirection {
    match direction {
        Direction::Next => IdbCursorDirection::Next,
        Direction::NextUnique => IdbCursorDirection::Nextunique,
        Direction::Prev => IdbCursorDirection::Prev,
        Direction::PrevUnique => IdbCursorDirection::Prevunique,
    }
}

/// Names in a DOMStringList.
pub fn string_list(list: &web_sys::DomStringList) -> Vec<String> {
    (0..list.length()).filter_map(|i| list.get(i)).collect()
}
