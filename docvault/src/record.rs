//! Schema-less record model.
//!
//! Documents fetched from the record store have no fixed schema, so every
//! field value is a [`Value`] drawn from a closed set of variants. Codecs
//! match exhaustively over that set.
//!
//! A [`Record`] always carries an identifier and a last-modified timestamp.
//! Codecs materialize them as the reserved fields [`ID_FIELD`] and
//! [`UPDATED_AT_FIELD`].
//!
//! Timestamps are held at millisecond precision, the finest resolution every
//! archive format can carry. Constructors and parsers truncate on the way in.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::{Map, Number, Value as Json};

use crate::utils::errors::{Result, VaultError};

/// Reserved field carrying the record identifier in every archive format.
pub const ID_FIELD: &str = "_id";

/// Reserved field carrying the last-modified timestamp in every archive format.
pub const UPDATED_AT_FIELD: &str = "_updated_at";

/// Key used by the extended-JSON form of a timestamp: `{"$date": "..."}`.
const DATE_KEY: &str = "$date";

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Object(Document),
    Array(Vec<Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::Object(_) => "object",
            Value::Array(_) => "array",
        }
    }

    /// Nesting depth: scalars are 0, an object or array adds one level.
    pub fn depth(&self) -> usize {
        match self {
            Value::Object(doc) => 1 + doc.iter().map(|(_, v)| v.depth()).max().unwrap_or(0),
            Value::Array(items) => 1 + items.iter().map(Value::depth).max().unwrap_or(0),
            _ => 0,
        }
    }

    /// Extended JSON. Timestamps become `{"$date": "<rfc3339>"}`, non-finite
    /// floats become `null`.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::Number(Number::from(*i)),
            Value::Float(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Timestamp(ts) => {
                let mut map = Map::new();
                map.insert(DATE_KEY.to_string(), Json::String(format_timestamp(ts)));
                Json::Object(map)
            }
            Value::Object(doc) => doc.to_json(),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
        }
    }

    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => {
                if let Some(ts) = extended_date(map) {
                    return Value::Timestamp(ts);
                }
                Value::Object(Document::from_json_map(map))
            }
        }
    }

    /// Flat, human-readable rendering used by lossy formats.
    pub fn display_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Timestamp(ts) => format_timestamp(ts),
            Value::Object(_) | Value::Array(_) => self.to_json().to_string(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(truncate_millis(ts))
    }
}

/// Ordered field-name to value mapping. Insertion order is preserved and
/// keys are unique.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    entries: Vec<(String, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a field, keeping the original position on replace.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> Json {
        let map: Map<String, Json> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Json::Object(map)
    }

    pub fn from_json_map(map: &Map<String, Json>) -> Self {
        map.iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect()
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

/// One document of a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub updated_at: DateTime<Utc>,
    pub fields: Document,
}

impl Record {
    pub fn new(id: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            updated_at: truncate_millis(updated_at),
            fields: Document::new(),
        }
    }

    /// Builder-style field insertion.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key, value);
        self
    }

    /// Flattened JSON object including the reserved `_id` and `_updated_at` fields.
    pub fn to_json(&self) -> Json {
        let mut map = Map::new();
        map.insert(ID_FIELD.to_string(), Json::String(self.id.clone()));
        map.insert(
            UPDATED_AT_FIELD.to_string(),
            Value::Timestamp(self.updated_at).to_json(),
        );
        for (k, v) in self.fields.iter() {
            map.insert(k.to_string(), v.to_json());
        }
        Json::Object(map)
    }

    /// Parse the flattened JSON form. A missing `_updated_at` falls back to
    /// `created_at`, the time the record was first seen.
    pub fn from_json(json: &Json, created_at: DateTime<Utc>) -> Result<Self> {
        let map = json.as_object().ok_or_else(|| {
            VaultError::corrupt(format!("record must be a JSON object, got {}", json))
        })?;
        let id = match map.get(ID_FIELD) {
            Some(Json::String(s)) => s.clone(),
            Some(Json::Number(n)) => n.to_string(),
            _ => return Err(VaultError::corrupt("record is missing a string '_id'")),
        };
        let updated_at = match map.get(UPDATED_AT_FIELD).map(Value::from_json) {
            Some(Value::Timestamp(ts)) => ts,
            Some(Value::String(s)) => parse_timestamp(&s).unwrap_or(created_at),
            _ => created_at,
        };
        let fields = map
            .iter()
            .filter(|(k, _)| !is_reserved(k))
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect();
        Ok(Self {
            id,
            updated_at: truncate_millis(updated_at),
            fields,
        })
    }
}

pub fn is_reserved(key: &str) -> bool {
    key == ID_FIELD || key == UPDATED_AT_FIELD
}

/// RFC 3339 with millisecond precision and a `Z` suffix.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| truncate_millis(ts.with_timezone(&Utc)))
}

pub fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}

fn extended_date(map: &Map<String, Json>) -> Option<DateTime<Utc>> {
    if map.len() != 1 {
        return None;
    }
    match map.get(DATE_KEY) {
        Some(Json::String(raw)) => parse_timestamp(raw),
        _ => None,
    }
}
