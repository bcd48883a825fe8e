//! Store templates and the schema registry
//!
//! A template describes one object store: its primary key options and, per
//! record field, a default value, an optional secondary index and an optional
//! derivation function. The registry keeps templates in registration order;
//! that order decides the implicit default store and the order stores are
//! created in during an upgrade.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::engine::{IndexDef, StoreParams};

/// Primary key options for an object store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreOptions {
    /// Dotted path of the primary key inside each record (out-of-line keys if `None`)
    #[serde(default)]
    pub key_path: Option<String>,
    /// Whether the engine generates integer keys
    #[serde(default)]
    pub auto_increment: bool,
}

impl StoreOptions {
    /// In-line key at `key_path` with a key generator.
    pub fn auto_increment(key_path: impl Into<String>) -> Self {
        Self {
            key_path: Some(key_path.into()),
            auto_increment: true,
        }
    }
}

/// Secondary index options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexOptions {
    #[serde(default)]
    pub unique: bool,
    /// Index every element of an array value separately
    #[serde(default)]
    pub multi_entry: bool,
}

/// Whether (and how) a field is indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexSpec {
    Enabled(bool),
    Options(IndexOptions),
}

impl IndexSpec {
    /// Index options if this spec asks for an index.
    pub fn options(&self) -> Option<IndexOptions> {
        match self {
            IndexSpec::Enabled(true) => Some(IndexOptions::default()),
            IndexSpec::Enabled(false) => None,
            IndexSpec::Options(options) => Some(*options),
        }
    }
}

/// Derives a field value from the whole record.
#[derive(Clone)]
pub struct Derive(Rc<dyn Fn(&Value) -> Value>);

impl Derive {
    pub fn new(f: impl Fn(&Value) -> Value + 'static) -> Self {
        Self(Rc::new(f))
    }

    pub fn apply(&self, record: &Value) -> Value {
        (self.0)(record)
    }
}

impl fmt::Debug for Derive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Derive(..)")
    }
}

impl PartialEq for Derive {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Per-field record properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPropertySpec {
    /// Value used when a record lacks this field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexSpec>,
    #[serde(skip)]
    pub func: Option<Derive>,
}

impl RecordPropertySpec {
    /// A plain indexed field.
    pub fn indexed() -> Self {
        Self {
            index: Some(IndexSpec::Enabled(true)),
            ..Default::default()
        }
    }

    /// A field indexed with explicit options.
    pub fn indexed_with(options: IndexOptions) -> Self {
        Self {
            index: Some(IndexSpec::Options(options)),
            ..Default::default()
        }
    }

    /// A field with a default value.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// A field derived from the rest of the record.
    pub fn derived(mut self, f: impl Fn(&Value) -> Value + 'static) -> Self {
        self.func = Some(Derive::new(f));
        self
    }
}

/// Static schema descriptor for one object store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreTemplate {
    #[serde(default)]
    pub options: StoreOptions,
    #[serde(default)]
    pub record: BTreeMap<String, RecordPropertySpec>,
}

impl StoreTemplate {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            options,
            record: BTreeMap::new(),
        }
    }

    /// Add a field description.
    pub fn field(mut self, name: impl Into<String>, spec: RecordPropertySpec) -> Self {
        self.record.insert(name.into(), spec);
        self
    }

    /// Secondary indexes this template asks for, one per indexed field.
    pub fn index_defs(&self) -> Vec<IndexDef> {
        self.record
            .iter()
            .filter_map(|(field, spec)| {
                let options = spec.index.as_ref()?.options()?;
                Some(IndexDef {
                    name: field.clone(),
                    key_path: field.clone(),
                    unique: options.unique,
                    multi_entry: options.multi_entry,
                })
            })
            .collect()
    }

    /// Engine parameters for creating this store.
    pub fn store_params(&self) -> StoreParams {
        StoreParams {
            key_path: self.options.key_path.clone(),
            auto_increment: self.options.auto_increment,
            indexes: self.index_defs(),
        }
    }

    /// Fill missing fields from their defaults, then apply derivations.
    ///
    /// Non-object input is returned unchanged.
    pub fn build_record(&self, partial: Value) -> Value {
        let mut record = partial;
        if let Some(fields) = record.as_object_mut() {
            for (name, spec) in &self.record {
                if let Some(default) = &spec.default {
                    fields.entry(name.clone()).or_insert_with(|| default.clone());
                }
            }
        } else {
            return record;
        }
        for (name, spec) in &self.record {
            if let Some(func) = &spec.func {
                let derived = func.apply(&record);
                if let Some(fields) = record.as_object_mut() {
                    fields.insert(name.clone(), derived);
                }
            }
        }
        record
    }
}

/// Registered store templates in registration order, plus the default store.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    templates: Vec<(String, StoreTemplate)>,
    default_store: Option<String>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template. The first registration of a name wins; later
    /// ones are logged and ignored. Returns whether the template was added.
    pub fn add_template(&mut self, name: impl Into<String>, template: StoreTemplate) -> bool {
        let name = name.into();
        if self.contains(&name) {
            warn!("store template '{}' already registered, keeping the first one", name);
            return false;
        }
        debug!("registered store template '{}'", name);
        self.templates.push((name, template));
        true
    }

    /// Register several templates and return the current mapping.
    pub fn add_templates<I, N>(&mut self, templates: I) -> &[(String, StoreTemplate)]
    where
        I: IntoIterator<Item = (N, StoreTemplate)>,
        N: Into<String>,
    {
        for (name, template) in templates {
            self.add_template(name, template);
        }
        &self.templates
    }

    /// Template for `name`, or for the default store when `name` is `None`.
    pub fn template(&self, name: Option<&str>) -> Option<&StoreTemplate> {
        let name = name.or_else(|| self.default_store())?;
        let found = self
            .templates
            .iter()
            .find(|(registered, _)| registered == name)
            .map(|(_, template)| template);
        if found.is_none() {
            debug!("no store template registered for '{}'", name);
        }
        found
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.iter().any(|(registered, _)| registered == name)
    }

    /// The explicitly chosen default store, else the first registered one.
    pub fn default_store(&self) -> Option<&str> {
        self.default_store
            .as_deref()
            .or_else(|| self.templates.first().map(|(name, _)| name.as_str()))
    }

    /// Choose the default store. Unregistered names are logged and ignored.
    pub fn set_default_store(&mut self, name: &str) -> bool {
        if !self.contains(name) {
            error!("cannot make '{}' the default store: no such template", name);
            return false;
        }
        self.default_store = Some(name.to_string());
        true
    }

    /// Registered store names in registration order.
    pub fn store_names(&self) -> impl Iterator<Item = &str> {
        self.templates.iter().map(|(name, _)| name.as_str())
    }

    pub fn templates(&self) -> &[(String, StoreTemplate)] {
        &self.templates
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn notes_template() -> StoreTemplate {
        StoreTemplate::new(StoreOptions::auto_increment("id"))
            .field("title", RecordPropertySpec::default())
            .field("tag", RecordPropertySpec::indexed())
            .field(
                "email",
                RecordPropertySpec::indexed_with(IndexOptions {
                    unique: true,
                    multi_entry: false,
                }),
            )
    }

    #[test]
    fn test_first_registration_wins() {
        let mut registry = SchemaRegistry::new();
        let first = notes_template();
        let second = StoreTemplate::new(StoreOptions::default());

        assert!(registry.add_template("notes", first.clone()));
        assert!(!registry.add_template("notes", second));

        assert_eq!(registry.template(Some("notes")), Some(&first));
        assert_eq!(registry.templates().len(), 1);
    }

    #[test]
    fn test_default_store_falls_back_to_first() {
        let mut registry = SchemaRegistry::new();
        assert_eq!(registry.default_store(), None);

        registry.add_templates([
            ("notes", notes_template()),
            ("files", StoreTemplate::default()),
        ]);
        assert_eq!(registry.default_store(), Some("notes"));

        assert!(registry.set_default_store("files"));
        assert_eq!(registry.default_store(), Some("files"));
        assert_eq!(registry.default_store(), Some("files"));

        assert!(!registry.set_default_store("missing"));
        assert_eq!(registry.default_store(), Some("files"));
    }

    #[test]
    fn test_template_defaults_to_default_store() {
        let mut registry = SchemaRegistry::new();
        assert!(registry.template(None).is_none());

        registry.add_template("notes", notes_template());
        assert_eq!(registry.template(None), Some(&notes_template()));
        assert!(registry.template(Some("other")).is_none());
    }

    #[test]
    fn test_store_names_keep_order() {
        let mut registry = SchemaRegistry::new();
        registry.add_templates([
            ("b", StoreTemplate::default()),
            ("a", StoreTemplate::default()),
            ("c", StoreTemplate::default()),
        ]);
        assert_eq!(registry.store_names().collect::<Vec<_>>(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_index_defs() {
        let defs = notes_template().index_defs();
        assert_eq!(
            defs,
            vec![
                IndexDef {
                    name: "email".into(),
                    key_path: "email".into(),
                    unique: true,
                    multi_entry: false,
                },
                IndexDef {
                    name: "tag".into(),
                    key_path: "tag".into(),
                    unique: false,
                    multi_entry: false,
                },
            ]
        );
    }

    #[test]
    fn test_template_json_shape() {
        let template: StoreTemplate = serde_json::from_value(json!({
            "options": {"keyPath": "id", "autoIncrement": true},
            "record": {
                "status": {"default": "new", "index": true},
                "labels": {"index": {"multiEntry": true}},
                "body": {}
            }
        }))
        .unwrap();

        assert_eq!(template.options, StoreOptions::auto_increment("id"));
        assert_eq!(template.index_defs().len(), 2);
        assert_eq!(
            template.record["labels"].index,
            Some(IndexSpec::Options(IndexOptions {
                unique: false,
                multi_entry: true,
            }))
        );
    }

    #[test]
    fn test_build_record() {
        let template = StoreTemplate::new(StoreOptions::auto_increment("id"))
            .field("status", RecordPropertySpec::indexed().with_default("new"))
            .field(
                "slug",
                RecordPropertySpec::default().derived(|record| {
                    let title = record["title"].as_str().unwrap_or_default();
                    Value::from(title.to_lowercase().replace(' ', "-"))
                }),
            );

        let record = template.build_record(json!({"title": "Hello World"}));
        assert_eq!(
            record,
            json!({"title": "Hello World", "status": "new", "slug": "hello-world"})
        );

        let kept = template.build_record(json!({"title": "x", "status": "done"}));
        assert_eq!(kept["status"], json!("done"));

        assert_eq!(template.build_record(json!(3)), json!(3));
    }
}
