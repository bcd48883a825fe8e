//! Keys, key ranges and index queries
//!
//! Keys follow the ordering of the browser engine: every number sorts before
//! every string, every string before every array, numbers compare
//! numerically and arrays compare element by element.

use std::cmp::Ordering;
use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// A primary or index key.
#[derive(Debug, Clone)]
pub enum Key {
    Int(i64),
    Float(f64),
    Text(String),
    Array(Vec<Key>),
}

impl Key {
    /// Convert a JSON value into a key.
    ///
    /// Returns `None` for values that are not valid keys (null, booleans,
    /// objects, or arrays containing any of those).
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Key::Int(i))
                } else {
                    n.as_f64().map(Key::from)
                }
            }
            Value::String(s) => Some(Key::Text(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
            _ => None,
        }
    }

    /// Convert this key into a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(i) => Value::from(*i),
            Key::Float(f) => Value::from(*f),
            Key::Text(s) => Value::from(s.as_str()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }

    /// The integer value of this key, if it has one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Key::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Key::Int(_) | Key::Float(_) => 0,
            Key::Text(_) => 1,
            Key::Array(_) => 2,
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Key::Int(i) => *i as f64,
            Key::Float(f) => *f,
            _ => f64::NAN,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Int(a), Key::Int(b)) => a.cmp(b),
            (Key::Text(a), Key::Text(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            (a, b) if a.type_rank() == 0 && b.type_rank() == 0 => a.as_f64().total_cmp(&b.as_f64()),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{}", i),
            Key::Float(x) => write!(f, "{}", x),
            Key::Text(s) => write!(f, "{:?}", s),
            Key::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<f64> for Key {
    /// Integral floats collapse to `Key::Int` so `1.0` and `1` are the same key.
    fn from(value: f64) -> Self {
        if value.fract() == 0.0 && value >= i64::MIN as f64 && value <= i64::MAX as f64 {
            Key::Int(value as i64)
        } else {
            Key::Float(value)
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Key::from_value(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("not a valid key: {}", value)))
    }
}

/// A contiguous span of keys, each bound optional and optionally open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRange {
    #[serde(default)]
    pub lower: Option<Key>,
    #[serde(default)]
    pub upper: Option<Key>,
    #[serde(default, rename = "lowerOpen")]
    pub lower_open: bool,
    #[serde(default, rename = "upperOpen")]
    pub upper_open: bool,
}

impl KeyRange {
    /// Range matching exactly one key.
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    /// Closed range `[lower, upper]`.
    pub fn bound(lower: impl Into<Key>, upper: impl Into<Key>) -> Self {
        Self {
            lower: Some(lower.into()),
            upper: Some(upper.into()),
            lower_open: false,
            upper_open: false,
        }
    }

    /// Range with only a lower bound.
    pub fn lower_bound(lower: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Some(lower.into()),
            upper: None,
            lower_open: open,
            upper_open: false,
        }
    }

    /// Range with only an upper bound.
    pub fn upper_bound(upper: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: None,
            upper: Some(upper.into()),
            lower_open: false,
            upper_open: open,
        }
    }

    /// Open or close the bounds of this range.
    pub fn with_open(mut self, lower_open: bool, upper_open: bool) -> Self {
        self.lower_open = lower_open;
        self.upper_open = upper_open;
        self
    }

    /// Check whether `key` falls inside this range.
    pub fn contains(&self, key: &Key) -> bool {
        let above = match &self.lower {
            Some(lower) if self.lower_open => key > lower,
            Some(lower) => key >= lower,
            None => true,
        };
        let below = match &self.upper {
            Some(upper) if self.upper_open => key < upper,
            Some(upper) => key <= upper,
            None => true,
        };
        above && below
    }
}

impl From<RangeInclusive<i64>> for KeyRange {
    fn from(range: RangeInclusive<i64>) -> Self {
        let (lo, hi) = range.into_inner();
        KeyRange::bound(lo, hi)
    }
}

/// Value part of an index query: a single key or a range of keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyQuery {
    Key(Key),
    Range(KeyRange),
}

impl KeyQuery {
    /// Check whether `key` is selected by this query.
    pub fn matches(&self, key: &Key) -> bool {
        match self {
            KeyQuery::Key(k) => k == key,
            KeyQuery::Range(range) => range.contains(key),
        }
    }
}

impl From<Key> for KeyQuery {
    fn from(key: Key) -> Self {
        KeyQuery::Key(key)
    }
}

impl From<KeyRange> for KeyQuery {
    fn from(range: KeyRange) -> Self {
        KeyQuery::Range(range)
    }
}

impl From<&str> for KeyQuery {
    fn from(value: &str) -> Self {
        KeyQuery::Key(Key::from(value))
    }
}

impl From<String> for KeyQuery {
    fn from(value: String) -> Self {
        KeyQuery::Key(Key::from(value))
    }
}

impl From<i64> for KeyQuery {
    fn from(value: i64) -> Self {
        KeyQuery::Key(Key::Int(value))
    }
}

/// Iteration order for index scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Next,
    NextUnique,
    Prev,
    PrevUnique,
}

impl Direction {
    /// Whether the scan runs from the highest key down.
    pub fn is_reverse(self) -> bool {
        matches!(self, Direction::Prev | Direction::PrevUnique)
    }

    /// Whether only the first record per index key is yielded.
    pub fn is_unique(self) -> bool {
        matches!(self, Direction::NextUnique | Direction::PrevUnique)
    }
}

/// A lookup against one secondary index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexQuery {
    /// Index name (the indexed field name)
    pub name: String,
    /// Key or key range to match; `None` selects every indexed record
    #[serde(default)]
    pub value: Option<KeyQuery>,
    /// Maximum number of results
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub direction: Option<Direction>,
}

impl IndexQuery {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            count: None,
            direction: None,
        }
    }

    pub fn value(mut self, value: impl Into<KeyQuery>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }
}

/// Resolve a dotted key path (`"meta.id"`) against a record.
pub fn evaluate_key_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

/// Write `key` into `value` at a dotted key path, creating intermediate
/// objects. Returns `false` if a non-object sits on the path.
pub fn inject_key(value: &mut Value, path: &str, key: &Key) -> bool {
    let mut segments = path.split('.').peekable();
    let mut current = value;
    while let Some(segment) = segments.next() {
        let Some(object) = current.as_object_mut() else {
            return false;
        };
        if segments.peek().is_none() {
            object.insert(segment.to_string(), key.to_value());
            return true;
        }
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ordering() {
        let mut keys = vec![
            Key::Array(vec![Key::Int(1)]),
            Key::from("b"),
            Key::Float(1.5),
            Key::from("a"),
            Key::Int(2),
            Key::Int(-1),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                Key::Int(-1),
                Key::Float(1.5),
                Key::Int(2),
                Key::from("a"),
                Key::from("b"),
                Key::Array(vec![Key::Int(1)]),
            ]
        );
    }

    #[test]
    fn test_integral_float_is_int() {
        assert_eq!(Key::from(3.0), Key::Int(3));
        assert_eq!(Key::Float(3.0), Key::Int(3));
        assert!(matches!(Key::from(2.5), Key::Float(_)));
    }

    #[test]
    fn test_from_value() {
        assert_eq!(Key::from_value(&json!(7)), Some(Key::Int(7)));
        assert_eq!(Key::from_value(&json!("x")), Some(Key::from("x")));
        assert_eq!(
            Key::from_value(&json!([1, "a"])),
            Some(Key::Array(vec![Key::Int(1), Key::from("a")]))
        );
        assert_eq!(Key::from_value(&json!(null)), None);
        assert_eq!(Key::from_value(&json!({"a": 1})), None);
        assert_eq!(Key::from_value(&json!([1, true])), None);
    }

    #[test]
    fn test_range_contains() {
        let range = KeyRange::bound(2, 5);
        assert!(!range.contains(&Key::Int(1)));
        assert!(range.contains(&Key::Int(2)));
        assert!(range.contains(&Key::Int(5)));
        assert!(!range.contains(&Key::Int(6)));

        let open = KeyRange::bound(2, 5).with_open(true, true);
        assert!(!open.contains(&Key::Int(2)));
        assert!(open.contains(&Key::Int(3)));
        assert!(!open.contains(&Key::Int(5)));

        let lower = KeyRange::lower_bound("m", false);
        assert!(lower.contains(&Key::from("z")));
        assert!(!lower.contains(&Key::from("a")));
        assert!(!lower.contains(&Key::Int(100)));
    }

    #[test]
    fn test_key_path() {
        let record = json!({"id": 3, "meta": {"owner": "alice"}});
        assert_eq!(evaluate_key_path(&record, "id"), Some(&json!(3)));
        assert_eq!(evaluate_key_path(&record, "meta.owner"), Some(&json!("alice")));
        assert_eq!(evaluate_key_path(&record, "meta.missing"), None);

        let mut target = json!({"name": "x"});
        assert!(inject_key(&mut target, "meta.id", &Key::Int(9)));
        assert_eq!(target, json!({"name": "x", "meta": {"id": 9}}));

        let mut scalar = json!(5);
        assert!(!inject_key(&mut scalar, "id", &Key::Int(1)));
    }

    #[test]
    fn test_key_query_deserialize() {
        let query: IndexQuery =
            serde_json::from_value(json!({"name": "status", "value": "open"})).unwrap();
        assert_eq!(query.value, Some(KeyQuery::Key(Key::from("open"))));

        let query: IndexQuery = serde_json::from_value(
            json!({"name": "age", "value": {"lower": 18, "upper": 30}, "count": 5}),
        )
        .unwrap();
        assert_eq!(query.value, Some(KeyQuery::Range(KeyRange::bound(18, 30))));
        assert_eq!(query.count, Some(5));
    }
}
