//! # Schema Mapper
//!
//! Bidirectional conversion between the feature store's loosely typed attribute rows and
//! the fixed, declared record schemas.
//!
//! Matching is case-insensitive. Fields the store omits (or returns as null) are left at their
//! zero value; fields that are present but cannot be coerced to the declared type abort the
//! conversion with [`GatewayError::Mapping`].

use crate::error::{GatewayError, Result};
use crate::model::{AttrValue, Geometry, RawAttributes, Record, SurrogateKey};
use crate::temporal::{self, ValidityWindow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Declared scalar type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// UTC epoch milliseconds
    Timestamp,
}

impl FieldType {
    pub fn zero(&self) -> AttrValue {
        match self {
            FieldType::String => AttrValue::String(String::new()),
            FieldType::Int => AttrValue::Int(0),
            FieldType::Float => AttrValue::Float(0.0),
            FieldType::Bool => AttrValue::Bool(false),
            FieldType::Timestamp => AttrValue::Null,
        }
    }

    /// Coerce a raw JSON value to this type. Null yields the zero value.
    pub fn coerce(&self, field: &str, raw: &Value) -> Result<AttrValue> {
        if raw.is_null() {
            return Ok(self.zero());
        }
        let coerced = match (self, raw) {
            (FieldType::String, Value::String(text)) => Some(AttrValue::String(text.clone())),
            (FieldType::String, Value::Number(number)) => {
                Some(AttrValue::String(number.to_string()))
            }
            (FieldType::String, Value::Bool(flag)) => Some(AttrValue::String(flag.to_string())),

            (FieldType::Int, Value::Number(number)) => number
                .as_i64()
                .or_else(|| {
                    number
                        .as_f64()
                        .filter(|value| value.fract() == 0.0 && value.abs() < i64::MAX as f64)
                        .map(|value| value as i64)
                })
                .map(AttrValue::Int),
            (FieldType::Int, Value::String(text)) => {
                text.trim().parse::<i64>().ok().map(AttrValue::Int)
            }
            (FieldType::Int, Value::Bool(flag)) => Some(AttrValue::Int(i64::from(*flag))),

            (FieldType::Float, Value::Number(number)) => number.as_f64().map(AttrValue::Float),
            (FieldType::Float, Value::String(text)) => {
                text.trim().parse::<f64>().ok().map(AttrValue::Float)
            }

            (FieldType::Bool, Value::Bool(flag)) => Some(AttrValue::Bool(*flag)),
            (FieldType::Bool, Value::Number(number)) => match number.as_i64() {
                Some(0) => Some(AttrValue::Bool(false)),
                Some(1) => Some(AttrValue::Bool(true)),
                _ => None,
            },
            (FieldType::Bool, Value::String(text)) => {
                match text.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "yes" | "y" | "1" => Some(AttrValue::Bool(true)),
                    "false" | "f" | "no" | "n" | "0" => Some(AttrValue::Bool(false)),
                    _ => None,
                }
            }

            (FieldType::Timestamp, Value::Number(number)) => number
                .as_i64()
                .or_else(|| number.as_f64().map(|value| value as i64))
                .map(AttrValue::Timestamp),
            (FieldType::Timestamp, Value::String(text)) => {
                temporal::parse_instant(text).map(AttrValue::Timestamp)
            }

            _ => None,
        };
        coerced.ok_or_else(|| GatewayError::Mapping {
            field: field.to_string(),
            value: raw.to_string(),
            reason: format!("expected {self:?}"),
        })
    }
}

/// One declared field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

impl FieldDef {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// The fixed schema of one record kind.
///
/// Key and validity columns are named separately from the plain attribute fields because the
/// mapper lifts them into dedicated [`Record`] members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    pub name: String,
    pub natural_key: String,
    pub surrogate_key: String,
    pub start_field: String,
    pub end_field: String,
    pub fields: Vec<FieldDef>,
}

impl RecordSchema {
    /// Infrastructure assets (bridges)
    pub fn asset() -> Self {
        Self {
            name: "assets".to_string(),
            natural_key: "BRIDGE_ID".to_string(),
            surrogate_key: "OBJECTID".to_string(),
            start_field: "START_DATE".to_string(),
            end_field: "END_DATE".to_string(),
            fields: vec![
                FieldDef::new("BRIDGE_NAME", FieldType::String).required(),
                FieldDef::new("BRIDGE_NUM", FieldType::String),
                FieldDef::new("LINKID", FieldType::String),
                FieldDef::new("PROVINCE", FieldType::String),
                FieldDef::new("LENGTH", FieldType::Float),
                FieldDef::new("WIDTH", FieldType::Float),
                FieldDef::new("SPAN_COUNT", FieldType::Int),
                FieldDef::new("BUILT_YEAR", FieldType::Int),
                FieldDef::new("TOLL", FieldType::Bool),
            ],
        }
    }

    /// Linear route segments
    pub fn route() -> Self {
        Self {
            name: "routes".to_string(),
            natural_key: "LINKID".to_string(),
            surrogate_key: "OBJECTID".to_string(),
            start_field: "FROMDATE".to_string(),
            end_field: "TODATE".to_string(),
            fields: vec![
                FieldDef::new("LINK_NAME", FieldType::String),
                FieldDef::new("PROVINCE", FieldType::String),
                FieldDef::new("LENGTH_KM", FieldType::Float),
                FieldDef::new("ROAD_CLASS", FieldType::String),
            ],
        }
    }

    pub fn with_key_columns(mut self, natural_key: &str, surrogate_key: &str) -> Self {
        self.natural_key = natural_key.to_string();
        self.surrogate_key = surrogate_key.to_string();
        self
    }

    pub fn with_validity_columns(mut self, start_field: &str, end_field: &str) -> Self {
        self.start_field = start_field.to_string();
        self.end_field = end_field.to_string();
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields
            .iter()
            .find(|field| field.name.eq_ignore_ascii_case(name))
    }

    /// Canonical spelling of any column this schema knows, keys and validity bounds included
    pub fn canonical_column(&self, name: &str) -> Option<&str> {
        [
            &self.natural_key,
            &self.surrogate_key,
            &self.start_field,
            &self.end_field,
        ]
        .into_iter()
        .map(String::as_str)
        .chain(self.fields.iter().map(|field| field.name.as_str()))
        .find(|column| column.eq_ignore_ascii_case(name))
    }

    /// Validate an output projection. Empty means all fields.
    pub fn resolve_columns(&self, columns: &[String]) -> Result<Option<Vec<String>>> {
        if columns.is_empty() {
            return Ok(None);
        }
        columns
            .iter()
            .map(|column| {
                self.canonical_column(column.trim())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        GatewayError::malformed(format!(
                            "unknown output field {column:?} for {}",
                            self.name
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Convert a raw store row into a typed record.
    pub fn to_record(&self, raw: &RawAttributes, geometry: Option<&Value>) -> Result<Record> {
        let lowered: HashMap<String, &Value> = raw
            .iter()
            .map(|(key, value)| (key.to_lowercase(), value))
            .collect();
        let lookup = |name: &str| lowered.get(&name.to_lowercase()).copied();

        let natural_key = match lookup(&self.natural_key) {
            Some(value) => match FieldType::String.coerce(&self.natural_key, value)? {
                AttrValue::String(text) => text,
                _ => String::new(),
            },
            None => String::new(),
        };

        let surrogate_key = match lookup(&self.surrogate_key) {
            Some(value) => FieldType::Int
                .coerce(&self.surrogate_key, value)?
                .as_i64()
                .filter(|key| *key != 0)
                .map(SurrogateKey),
            None => None,
        };

        let start = self.timestamp(&self.start_field, lookup(&self.start_field))?;
        let end = self.timestamp(&self.end_field, lookup(&self.end_field))?;

        let mut record = Record::new(natural_key).with_window(ValidityWindow::new(start, end));
        record.surrogate_key = surrogate_key;

        for field in &self.fields {
            let value = match lookup(&field.name) {
                Some(raw_value) => field.field_type.coerce(&field.name, raw_value)?,
                None => field.field_type.zero(),
            };
            record.attributes.insert(field.name.clone(), value);
        }

        record.geometry = geometry
            .filter(|shape| !shape.is_null())
            .map(|shape| Geometry(shape.clone()));
        Ok(record)
    }

    fn timestamp(&self, field: &str, raw: Option<&Value>) -> Result<Option<i64>> {
        match raw {
            Some(value) => Ok(FieldType::Timestamp.coerce(field, value)?.as_i64()),
            None => Ok(None),
        }
    }

    /// Emit every non-zero field of a record under its declared name.
    pub fn to_attributes(&self, record: &Record) -> RawAttributes {
        let mut raw = RawAttributes::new();
        if !record.natural_key.is_empty() {
            raw.insert(
                self.natural_key.clone(),
                Value::String(record.natural_key.clone()),
            );
        }
        if let Some(key) = record.surrogate_key {
            raw.insert(self.surrogate_key.clone(), Value::from(key.0));
        }
        if let Some(start) = record.window.start {
            raw.insert(self.start_field.clone(), Value::from(start));
        }
        if let Some(end) = record.window.end {
            raw.insert(self.end_field.clone(), Value::from(end));
        }
        for field in &self.fields {
            if let Some(value) = record.attr(&field.name).filter(|value| !value.is_zero()) {
                raw.insert(field.name.clone(), value.to_json());
            }
        }
        raw
    }

    /// Required fields must be present and non-zero before a record may be inserted.
    pub fn validate_required(&self, record: &Record) -> Result<()> {
        if record.natural_key.trim().is_empty() {
            return Err(GatewayError::malformed(format!(
                "{} is required",
                self.natural_key
            )));
        }
        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|field| field.required)
            .filter(|field| record.attr(&field.name).map_or(true, AttrValue::is_zero))
            .map(|field| field.name.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::malformed(format!(
                "record {} is missing required fields: {}",
                record.natural_key,
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawAttributes {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn test_case_insensitive_mapping() {
        let schema = RecordSchema::asset();
        let row = raw(json!({
            "objectid": 12,
            "Bridge_Id": "BR-100",
            "bridge_name": "Kali Progo",
            "SPAN_COUNT": "4",
            "length": 120,
            "toll": 1,
            "start_date": 1_700_000_000_000i64,
            "END_DATE": null
        }));
        let record = schema.to_record(&row, None).unwrap();

        assert_eq!(record.natural_key, "BR-100");
        assert_eq!(record.surrogate_key, Some(SurrogateKey(12)));
        assert_eq!(record.attr("BRIDGE_NAME"), Some(&AttrValue::from("Kali Progo")));
        assert_eq!(record.attr("SPAN_COUNT"), Some(&AttrValue::Int(4)));
        assert_eq!(record.attr("LENGTH"), Some(&AttrValue::Float(120.0)));
        assert_eq!(record.attr("TOLL"), Some(&AttrValue::Bool(true)));
        assert_eq!(record.window.start, Some(1_700_000_000_000));
        assert_eq!(record.window.end, None);
        assert!(record.geometry.is_none());
    }

    #[test]
    fn test_missing_fields_take_zero_values() {
        let schema = RecordSchema::asset();
        let record = schema
            .to_record(&raw(json!({"BRIDGE_ID": "BR-1"})), Some(&json!({"x": 1.0, "y": 2.0})))
            .unwrap();

        assert_eq!(record.surrogate_key, None);
        assert_eq!(record.attr("BRIDGE_NUM"), Some(&AttrValue::from("")));
        assert_eq!(record.attr("WIDTH"), Some(&AttrValue::Float(0.0)));
        assert_eq!(record.attr("TOLL"), Some(&AttrValue::Bool(false)));
        assert_eq!(record.geometry, Some(Geometry(json!({"x": 1.0, "y": 2.0}))));
    }

    #[test]
    fn test_null_geometry_is_dropped() {
        let schema = RecordSchema::route();
        let record = schema
            .to_record(&raw(json!({"LINKID": "01001"})), Some(&Value::Null))
            .unwrap();
        assert!(record.geometry.is_none());
    }

    #[test]
    fn test_numeric_natural_key_becomes_string() {
        let schema = RecordSchema::asset();
        let record = schema
            .to_record(&raw(json!({"BRIDGE_ID": 4000068})), None)
            .unwrap();
        assert_eq!(record.natural_key, "4000068");
    }

    #[test]
    fn test_coercion_failure_names_field() {
        let schema = RecordSchema::asset();
        let err = schema
            .to_record(&raw(json!({"BRIDGE_ID": "BR-1", "SPAN_COUNT": "many"})), None)
            .unwrap_err();
        match err {
            GatewayError::Mapping { field, value, .. } => {
                assert_eq!(field, "SPAN_COUNT");
                assert_eq!(value, "\"many\"");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_fractional_int_is_rejected() {
        assert!(FieldType::Int.coerce("N", &json!(2.5)).is_err());
        assert_eq!(FieldType::Int.coerce("N", &json!(2.0)).unwrap(), AttrValue::Int(2));
    }

    #[test]
    fn test_timestamp_from_edit_string() {
        let value = FieldType::Timestamp
            .coerce("END_DATE", &json!("01/02/2024 03:04:05"))
            .unwrap();
        assert_eq!(value, AttrValue::Timestamp(1_704_164_645_000));
    }

    #[test]
    fn test_to_attributes_skips_zero_values() {
        let schema = RecordSchema::asset();
        let record = Record::new("BR-100")
            .with_attr("BRIDGE_NAME", "Kali Progo")
            .with_attr("WIDTH", 0.0)
            .with_attr("UNDECLARED", "ignored");
        let raw = schema.to_attributes(&record);

        assert_eq!(raw.get("BRIDGE_ID"), Some(&json!("BR-100")));
        assert_eq!(raw.get("BRIDGE_NAME"), Some(&json!("Kali Progo")));
        assert!(!raw.contains_key("WIDTH"));
        assert!(!raw.contains_key("OBJECTID"));
        assert!(!raw.contains_key("UNDECLARED"));
    }

    #[test]
    fn test_round_trip_reproduces_non_zero_fields() {
        let schema = RecordSchema::asset();
        let original = Record::new("BR-7")
            .with_surrogate_key(SurrogateKey(99))
            .with_attr("BRIDGE_NAME", "Serayu")
            .with_attr("LENGTH", 42.5)
            .with_attr("SPAN_COUNT", 2i64)
            .with_attr("TOLL", true)
            .with_window(ValidityWindow::new(Some(1_000), None))
            .with_geometry(json!({"x": 110.1, "y": -7.2}));

        let raw = schema.to_attributes(&original);
        let restored = schema
            .to_record(&raw, original.geometry.as_ref().map(|g| &g.0))
            .unwrap();

        assert_eq!(restored.natural_key, original.natural_key);
        assert_eq!(restored.surrogate_key, original.surrogate_key);
        assert_eq!(restored.window, original.window);
        assert_eq!(restored.geometry, original.geometry);
        for (name, value) in &original.attributes {
            assert_eq!(restored.attr(name), Some(value), "field {name}");
        }
    }

    #[test]
    fn test_resolve_columns() {
        let schema = RecordSchema::route();
        assert_eq!(schema.resolve_columns(&[]).unwrap(), None);
        assert_eq!(
            schema
                .resolve_columns(&["linkid".to_string(), "Link_Name".to_string()])
                .unwrap(),
            Some(vec!["LINKID".to_string(), "LINK_NAME".to_string()])
        );
        assert!(matches!(
            schema.resolve_columns(&["1=1; DROP".to_string()]),
            Err(GatewayError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_validate_required() {
        let schema = RecordSchema::asset();
        assert!(schema
            .validate_required(&Record::new("BR-1").with_attr("BRIDGE_NAME", "A"))
            .is_ok());
        assert!(schema.validate_required(&Record::new("BR-1")).is_err());
        assert!(schema
            .validate_required(&Record::new("").with_attr("BRIDGE_NAME", "A"))
            .is_err());
    }

    #[test]
    fn test_configured_columns() {
        let schema = RecordSchema::route().with_validity_columns("VALID_FROM", "VALID_TO");
        let record = schema
            .to_record(&raw(json!({"LINKID": "01001", "valid_to": 5})), None)
            .unwrap();
        assert_eq!(record.window.end, Some(5));
    }
}
