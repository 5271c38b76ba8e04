//! # Data Model
//!
//! Core data structures for versioned geospatial records.
//! Includes record identification, typed attribute values, raw feature rows and edit outcomes.

use crate::temporal::{self, Instant, ValidityWindow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Loosely typed attribute row as handed out by the feature store
pub type RawAttributes = serde_json::Map<String, serde_json::Value>;

/// Backend-assigned record identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SurrogateKey(pub i64);

impl fmt::Display for SurrogateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OID{}", self.0)
    }
}

/// Store-native shape, passed through untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Geometry(pub serde_json::Value);

/// A typed scalar attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(Instant),
}

impl AttrValue {
    /// Zero values are never emitted towards the store.
    pub fn is_zero(&self) -> bool {
        match self {
            AttrValue::Null => true,
            AttrValue::Bool(value) => !value,
            AttrValue::Int(value) => *value == 0,
            AttrValue::Float(value) => *value == 0.0,
            AttrValue::String(value) => value.is_empty(),
            AttrValue::Timestamp(_) => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(value) | AttrValue::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Float(value) => Some(*value),
            AttrValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// JSON form used on the store's wire. Timestamps travel as epoch milliseconds.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttrValue::Null => serde_json::Value::Null,
            AttrValue::Bool(value) => serde_json::Value::Bool(*value),
            AttrValue::Int(value) | AttrValue::Timestamp(value) => serde_json::Value::from(*value),
            AttrValue::Float(value) => serde_json::Number::from_f64(*value)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            AttrValue::String(value) => serde_json::Value::String(value.clone()),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Null => write!(f, "NULL"),
            AttrValue::Bool(value) => write!(f, "{value}"),
            AttrValue::Int(value) => write!(f, "{value}"),
            AttrValue::Float(value) => write!(f, "{value}"),
            AttrValue::String(value) => write!(f, "{value}"),
            AttrValue::Timestamp(value) => match temporal::format_instant(*value) {
                Some(text) => write!(f, "{text}"),
                None => write!(f, "{value}"),
            },
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::String(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

/// A typed, versioned record.
///
/// `attributes` holds every declared non-key field keyed by its declared (upper-case) name.
/// Natural key, surrogate key and validity bounds live in their own members.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    /// Business identifier; not guaranteed unique at the storage layer
    pub natural_key: String,
    /// Backend identity, present once persisted
    pub surrogate_key: Option<SurrogateKey>,
    pub geometry: Option<Geometry>,
    pub attributes: BTreeMap<String, AttrValue>,
    pub window: ValidityWindow,
}

impl Record {
    /// Create a record carrying only a natural key
    pub fn new(natural_key: impl Into<String>) -> Self {
        Self {
            natural_key: natural_key.into(),
            ..Self::default()
        }
    }

    pub fn with_surrogate_key(mut self, key: SurrogateKey) -> Self {
        self.surrogate_key = Some(key);
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_geometry(mut self, geometry: serde_json::Value) -> Self {
        self.geometry = Some(Geometry(geometry));
        self
    }

    pub fn with_window(mut self, window: ValidityWindow) -> Self {
        self.window = window;
        self
    }

    /// Look up a declared attribute by name, ignoring case
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name).or_else(|| {
            self.attributes
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.surrogate_key {
            Some(key) => write!(f, "{}@{}", self.natural_key, key),
            None => write!(f, "{}@new", self.natural_key),
        }
    }
}

/// One row as returned by, or sent to, the feature store
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawFeature {
    pub attributes: RawAttributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<serde_json::Value>,
}

impl RawFeature {
    pub fn new(attributes: RawAttributes) -> Self {
        Self {
            attributes,
            geometry: None,
        }
    }
}

/// Outcome of one edit on one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditResult {
    pub surrogate_key: Option<SurrogateKey>,
    pub success: bool,
    pub global_id: Option<String>,
    pub error: Option<String>,
}

impl EditResult {
    pub fn succeeded(key: SurrogateKey, global_id: Option<String>) -> Self {
        Self {
            surrogate_key: Some(key),
            success: true,
            global_id,
            error: None,
        }
    }

    pub fn failed(key: Option<SurrogateKey>, error: impl Into<String>) -> Self {
        Self {
            surrogate_key: key,
            success: false,
            global_id: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let record = Record::new("BR-100")
            .with_surrogate_key(SurrogateKey(7))
            .with_attr("BRIDGE_NAME", "Kali Progo")
            .with_attr("SPAN_COUNT", 3i64);

        assert_eq!(record.natural_key, "BR-100");
        assert_eq!(record.surrogate_key, Some(SurrogateKey(7)));
        assert_eq!(record.attr("bridge_name").and_then(AttrValue::as_str), Some("Kali Progo"));
        assert_eq!(record.attr("SPAN_COUNT").and_then(AttrValue::as_i64), Some(3));
        assert_eq!(record.to_string(), "BR-100@OID7");
    }

    #[test]
    fn test_zero_values() {
        assert!(AttrValue::Null.is_zero());
        assert!(AttrValue::from("").is_zero());
        assert!(AttrValue::from(0i64).is_zero());
        assert!(AttrValue::from(0.0).is_zero());
        assert!(AttrValue::from(false).is_zero());
        assert!(!AttrValue::Timestamp(0).is_zero());
        assert!(!AttrValue::from("x").is_zero());
    }

    #[test]
    fn test_attr_value_json() {
        assert_eq!(AttrValue::Timestamp(5).to_json(), serde_json::json!(5));
        assert_eq!(AttrValue::from(1.5).to_json(), serde_json::json!(1.5));
        assert_eq!(AttrValue::Float(f64::NAN).to_json(), serde_json::Value::Null);
    }

    #[test]
    fn test_edit_result_constructors() {
        let ok = EditResult::succeeded(SurrogateKey(1), Some("{abc}".to_string()));
        assert!(ok.success);
        let failed = EditResult::failed(None, "rejected");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("rejected"));
    }
}
