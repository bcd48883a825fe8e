//! Stow WASM bridge
//!
//! Exposes the stow storage client to browser JavaScript through
//! wasm-bindgen (`browser` feature). Everything crosses the boundary as JSON
//! text; this module holds the payload parsing shared by the bindings so it
//! can be tested natively.
//!
//! # Payloads
//!
//! - Templates: `{"name": ..., "template": {...}}`, an array of those, or an
//!   object mapping store name to template (registered in key order)
//! - Items: a JSON array of records, or a single record
//! - Index values: a key (`3`, `"a"`, `[1, "x"]`) or a key range
//!   (`{"lower": 1, "upper": 5, "upperOpen": true}`)
//! - Index queries: `{"name": "tag", "value": "a", "count": 10, "direction": "prev"}`

#[cfg(feature = "browser")]
pub mod browser;
#[cfg(feature = "browser")]
mod console;

use serde::Deserialize;
use serde_json::Value;
use stow_core::{IndexQuery, KeyQuery, StoreError, StoreTemplate};
use thiserror::Error;

/// Errors raised at the JavaScript boundary
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Payload is not valid JSON or has the wrong shape
    #[error("invalid {what}: {source}")]
    Payload {
        what: &'static str,
        source: serde_json::Error,
    },

    /// The client was used before `init_client`
    #[error("client not initialized, call init_client() first")]
    NotInitialized,

    /// The storage client reported a failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

fn payload<T: for<'de> Deserialize<'de>>(what: &'static str, json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|source| BridgeError::Payload { what, source })
}

#[derive(Deserialize)]
struct NamedTemplate {
    name: String,
    template: StoreTemplate,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TemplatePayload {
    One(NamedTemplate),
    Many(Vec<NamedTemplate>),
    Mapping(serde_json::Map<String, Value>),
}

/// Parse a template registration payload into `(name, template)` pairs.
pub fn parse_templates(json: &str) -> Result<Vec<(String, StoreTemplate)>> {
    let pairs = match payload::<TemplatePayload>("templates", json)? {
        TemplatePayload::One(named) => vec![(named.name, named.template)],
        TemplatePayload::Many(list) => list
            .into_iter()
            .map(|named| (named.name, named.template))
            .collect(),
        TemplatePayload::Mapping(map) => map
            .into_iter()
            .map(|(name, template)| {
                serde_json::from_value(template)
                    .map(|template| (name, template))
                    .map_err(|source| BridgeError::Payload {
                        what: "template",
                        source,
                    })
            })
            .collect::<Result<_>>()?,
    };
    Ok(pairs)
}

/// Parse a single named template.
pub fn parse_template(json: &str) -> Result<StoreTemplate> {
    payload("template", json)
}

/// Parse items to store. A bare record becomes a one-element batch.
pub fn parse_items(json: &str) -> Result<Vec<Value>> {
    match payload::<Value>("items", json)? {
        Value::Array(items) => Ok(items),
        item => Ok(vec![item]),
    }
}

/// Parse an index value: a key or a key range.
pub fn parse_key_query(json: &str) -> Result<KeyQuery> {
    payload("index value", json)
}

/// Parse a full index query.
pub fn parse_index_query(json: &str) -> Result<IndexQuery> {
    payload("index query", json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stow_core::{Direction, Key, KeyRange};

    #[test]
    fn test_templates_preserve_array_order() {
        let pairs = parse_templates(
            r#"[
                {"name": "notes", "template": {"options": {"keyPath": "id", "autoIncrement": true},
                                               "record": {"tag": {"index": true}}}},
                {"name": "files", "template": {}}
            ]"#,
        )
        .unwrap();
        let names: Vec<&str> = pairs.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["notes", "files"]);
        assert_eq!(pairs[0].1.index_defs().len(), 1);
    }

    #[test]
    fn test_templates_single_and_mapping() {
        let one = parse_templates(r#"{"name": "notes", "template": {}}"#).unwrap();
        assert_eq!(one.len(), 1);

        let mapping = parse_templates(r#"{"b": {}, "a": {"record": {}}}"#).unwrap();
        assert_eq!(mapping.len(), 2);
    }

    #[test]
    fn test_bad_template_payload() {
        let err = parse_templates(r#"{"notes": {"options": 5}}"#).unwrap_err();
        assert!(err.to_string().starts_with("invalid template"));
    }

    #[test]
    fn test_items_bare_record_is_batch() {
        assert_eq!(parse_items(r#"{"a": 1}"#).unwrap().len(), 1);
        assert_eq!(parse_items(r#"[{"a": 1}, {"a": 2}]"#).unwrap().len(), 2);
        assert!(parse_items("{").is_err());
    }

    #[test]
    fn test_key_query() {
        assert_eq!(
            parse_key_query(r#""a""#).unwrap(),
            KeyQuery::Key(Key::from("a"))
        );
        assert_eq!(
            parse_key_query(r#"{"lower": 1, "upper": 5}"#).unwrap(),
            KeyQuery::Range(KeyRange::bound(1i64, 5i64))
        );
    }

    #[test]
    fn test_index_query() {
        let query =
            parse_index_query(r#"{"name": "tag", "value": "a", "count": 2, "direction": "prev"}"#)
                .unwrap();
        assert_eq!(query.name, "tag");
        assert_eq!(query.count, Some(2));
        assert_eq!(query.direction, Some(Direction::Prev));
    }
}
