//! # Store Module
//!
//! The feature store seam: query and edit requests as the gateway issues them, the
//! [`FeatureStore`] trait every backend implements, and an in-process implementation.

use crate::error::{GatewayError, Result};
use crate::model::{AttrValue, EditResult, RawAttributes, RawFeature, SurrogateKey};
use crate::predicate::{Operand, Predicate};
use crate::temporal::{self, Instant};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Spatial relationship between the filter geometry and the features
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialRelation {
    /// Features contained by the filter geometry
    Contains,
}

/// A region filter, opaque to the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialFilter {
    /// GeoJSON geometry (polygon)
    pub geometry: Value,
    /// Coordinate reference system of `geometry`, as WKT
    pub crs: String,
    pub relation: SpatialRelation,
}

/// One query as sent to the store
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub predicate: Predicate,
    /// None means all fields
    pub out_fields: Option<Vec<String>>,
    pub spatial: Option<SpatialFilter>,
    pub return_geometry: bool,
}

impl QueryRequest {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            predicate,
            out_fields: None,
            spatial: None,
            return_geometry: true,
        }
    }

    pub fn with_out_fields(mut self, out_fields: Option<Vec<String>>) -> Self {
        self.out_fields = out_fields;
        self
    }

    pub fn with_spatial(mut self, spatial: SpatialFilter) -> Self {
        self.spatial = Some(spatial);
        self
    }

    /// `*` or a comma-separated projection
    pub fn out_fields_param(&self) -> String {
        match &self.out_fields {
            Some(fields) => fields.join(","),
            None => "*".to_string(),
        }
    }
}

/// One edit call. The store applies each row independently.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditBatch {
    pub adds: Vec<RawFeature>,
    pub updates: Vec<RawFeature>,
    pub deletes: Vec<SurrogateKey>,
}

impl EditBatch {
    pub fn adds(adds: Vec<RawFeature>) -> Self {
        Self {
            adds,
            ..Self::default()
        }
    }

    pub fn updates(updates: Vec<RawFeature>) -> Self {
        Self {
            updates,
            ..Self::default()
        }
    }

    pub fn deletes(deletes: Vec<SurrogateKey>) -> Self {
        Self {
            deletes,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.adds.len() + self.updates.len() + self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-row outcomes of an [`EditBatch`], in request order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditOutcomes {
    pub add_results: Vec<EditResult>,
    pub update_results: Vec<EditResult>,
    pub delete_results: Vec<EditResult>,
}

/// A remote (or in-process) spatial feature store holding one record set.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn query(&self, request: QueryRequest) -> Result<Vec<RawFeature>>;

    async fn apply_edits(&self, batch: EditBatch) -> Result<EditOutcomes>;
}

#[derive(Debug, Default)]
struct Rows {
    rows: BTreeMap<i64, RawFeature>,
    next_key: i64,
}

/// In-process feature store.
///
/// Evaluates [`Predicate`] trees against stored rows with the store's own clock, assigns
/// surrogate keys and global ids on insert. The spatial test is an envelope check of point
/// geometries. `Predicate::Raw` cannot be evaluated and fails as a backend error.
#[derive(Debug)]
pub struct InMemoryFeatureStore {
    name: String,
    surrogate_key_field: String,
    global_id_field: String,
    max_in_values: Option<usize>,
    inner: RwLock<Rows>,
}

impl InMemoryFeatureStore {
    pub fn new(name: impl Into<String>, surrogate_key_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            surrogate_key_field: surrogate_key_field.into(),
            global_id_field: "GLOBALID".to_string(),
            max_in_values: None,
            inner: RwLock::new(Rows {
                rows: BTreeMap::new(),
                next_key: 1,
            }),
        }
    }

    /// Reject IN-lists longer than `limit`, like the remote service does
    pub fn with_max_in_values(mut self, limit: usize) -> Self {
        self.max_in_values = Some(limit);
        self
    }

    /// Seed a row directly, bypassing the edit path. Returns the assigned key.
    pub fn seed(&self, mut attributes: RawAttributes, geometry: Option<Value>) -> Result<SurrogateKey> {
        let mut inner = self.write()?;
        let key = inner.next_key;
        inner.next_key += 1;
        attributes.insert(self.surrogate_key_field.clone(), Value::from(key));
        inner.rows.insert(key, RawFeature { attributes, geometry });
        Ok(SurrogateKey(key))
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw row by surrogate key, regardless of validity
    pub fn row(&self, key: SurrogateKey) -> Option<RawFeature> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.rows.get(&key.0).cloned())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Rows>> {
        self.inner
            .write()
            .map_err(|_| GatewayError::backend("in-memory store lock poisoned"))
    }

    fn check_in_limit(&self, predicate: &Predicate) -> Result<()> {
        let Some(limit) = self.max_in_values else {
            return Ok(());
        };
        match predicate {
            Predicate::In { field, values } if values.len() > limit => {
                Err(GatewayError::backend(format!(
                    "IN list on {field} has {} values, limit is {limit}",
                    values.len()
                )))
            }
            Predicate::And(clauses) | Predicate::Or(clauses) => clauses
                .iter()
                .try_for_each(|clause| self.check_in_limit(clause)),
            _ => Ok(()),
        }
    }

    fn add(&self, inner: &mut Rows, mut feature: RawFeature) -> EditResult {
        let key = inner.next_key;
        inner.next_key += 1;
        let global_id = format!("{{{}}}", uuid::Uuid::new_v4().as_hyphenated()).to_uppercase();
        remove_field(&mut feature.attributes, &self.surrogate_key_field);
        feature
            .attributes
            .insert(self.surrogate_key_field.clone(), Value::from(key));
        feature
            .attributes
            .insert(self.global_id_field.clone(), Value::String(global_id.clone()));
        inner.rows.insert(key, feature);
        EditResult::succeeded(SurrogateKey(key), Some(global_id))
    }

    fn update(&self, inner: &mut Rows, feature: RawFeature) -> EditResult {
        let key = lookup_field(&feature.attributes, &self.surrogate_key_field).and_then(Value::as_i64);
        let Some(key) = key else {
            return EditResult::failed(None, format!("{} is required", self.surrogate_key_field));
        };
        let Some(row) = inner.rows.get_mut(&key) else {
            return EditResult::failed(Some(SurrogateKey(key)), "feature not found");
        };
        for (field, value) in feature.attributes {
            remove_field(&mut row.attributes, &field);
            row.attributes.insert(field, value);
        }
        if feature.geometry.is_some() {
            row.geometry = feature.geometry;
        }
        let global_id = lookup_field(&row.attributes, &self.global_id_field)
            .and_then(Value::as_str)
            .map(str::to_string);
        EditResult::succeeded(SurrogateKey(key), global_id)
    }
}

#[async_trait]
impl FeatureStore for InMemoryFeatureStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, request: QueryRequest) -> Result<Vec<RawFeature>> {
        self.check_in_limit(&request.predicate)?;
        let now = temporal::now();
        let inner = self
            .inner
            .read()
            .map_err(|_| GatewayError::backend("in-memory store lock poisoned"))?;

        let mut out = Vec::new();
        for row in inner.rows.values() {
            if !evaluate(&request.predicate, &row.attributes, now)? {
                continue;
            }
            if let Some(spatial) = &request.spatial {
                if !spatially_matches(spatial, row.geometry.as_ref()) {
                    continue;
                }
            }
            let attributes = match &request.out_fields {
                Some(fields) => row
                    .attributes
                    .iter()
                    .filter(|(key, _)| fields.iter().any(|field| field.eq_ignore_ascii_case(key)))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
                None => row.attributes.clone(),
            };
            out.push(RawFeature {
                attributes,
                geometry: if request.return_geometry {
                    row.geometry.clone()
                } else {
                    None
                },
            });
        }
        Ok(out)
    }

    async fn apply_edits(&self, batch: EditBatch) -> Result<EditOutcomes> {
        let mut inner = self.write()?;
        let mut outcomes = EditOutcomes::default();
        for feature in batch.adds {
            let result = self.add(&mut inner, feature);
            outcomes.add_results.push(result);
        }
        for feature in batch.updates {
            let result = self.update(&mut inner, feature);
            outcomes.update_results.push(result);
        }
        for key in batch.deletes {
            let result = match inner.rows.remove(&key.0) {
                Some(_) => EditResult::succeeded(key, None),
                None => EditResult::failed(Some(key), "feature not found"),
            };
            outcomes.delete_results.push(result);
        }
        Ok(outcomes)
    }
}

fn lookup_field<'a>(attributes: &'a RawAttributes, field: &str) -> Option<&'a Value> {
    attributes.get(field).or_else(|| {
        attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(field))
            .map(|(_, value)| value)
    })
}

fn remove_field(attributes: &mut RawAttributes, field: &str) {
    let existing: Vec<String> = attributes
        .keys()
        .filter(|key| key.eq_ignore_ascii_case(field))
        .cloned()
        .collect();
    for key in existing {
        attributes.remove(&key);
    }
}

/// Evaluate a predicate against one row. SQL semantics: comparisons with NULL are false.
pub fn evaluate(predicate: &Predicate, row: &RawAttributes, now: Instant) -> Result<bool> {
    let value_of = |field: &str| lookup_field(row, field).filter(|value| !value.is_null());
    Ok(match predicate {
        Predicate::True => true,
        Predicate::In { field, values } => match value_of(field) {
            Some(actual) => values.iter().any(|expected| loosely_equal(actual, expected)),
            None => false,
        },
        Predicate::Eq { field, value } => value_of(field).is_some_and(|actual| loosely_equal(actual, value)),
        Predicate::IsNull(field) => value_of(field).is_none(),
        Predicate::Compare { field, op, operand } => {
            let right = match operand {
                Operand::Now => Some(now as f64),
                Operand::Value(value) => numeric_attr(value),
            };
            match (value_of(field).and_then(numeric_json), right) {
                (Some(left), Some(right)) => op.holds(left, right),
                _ => false,
            }
        }
        Predicate::And(clauses) => {
            for clause in clauses {
                if !evaluate(clause, row, now)? {
                    return Ok(false);
                }
            }
            true
        }
        Predicate::Or(clauses) => {
            for clause in clauses {
                if evaluate(clause, row, now)? {
                    return Ok(true);
                }
            }
            false
        }
        Predicate::Raw(text) => {
            return Err(GatewayError::backend(format!(
                "in-memory store cannot evaluate raw clause {text:?}"
            )))
        }
    })
}

fn loosely_equal(actual: &Value, expected: &AttrValue) -> bool {
    match (actual, expected) {
        (Value::String(left), AttrValue::String(right)) => left == right,
        (Value::Bool(left), AttrValue::Bool(right)) => left == right,
        (Value::Number(_), _) => match (numeric_json(actual), numeric_attr(expected)) {
            (Some(left), Some(right)) => left == right,
            _ => expected.as_str().is_some_and(|right| actual.to_string() == right),
        },
        (Value::String(left), other) => *left == other.to_string(),
        _ => false,
    }
}

fn numeric_json(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => temporal::parse_instant(text).map(|instant| instant as f64),
        _ => None,
    }
}

fn numeric_attr(value: &AttrValue) -> Option<f64> {
    match value {
        AttrValue::Int(number) | AttrValue::Timestamp(number) => Some(*number as f64),
        AttrValue::Float(number) => Some(*number),
        _ => None,
    }
}

/// Envelope containment of a point geometry (`{x, y}` or GeoJSON `Point`).
fn spatially_matches(filter: &SpatialFilter, geometry: Option<&Value>) -> bool {
    let Some(point) = geometry.and_then(point_of) else {
        return false;
    };
    let mut coordinates = Vec::new();
    collect_positions(filter.geometry.get("coordinates").unwrap_or(&filter.geometry), &mut coordinates);
    if coordinates.is_empty() {
        return false;
    }
    let (min_x, max_x) = bounds(coordinates.iter().map(|(x, _)| *x));
    let (min_y, max_y) = bounds(coordinates.iter().map(|(_, y)| *y));
    match filter.relation {
        SpatialRelation::Contains => {
            point.0 >= min_x && point.0 <= max_x && point.1 >= min_y && point.1 <= max_y
        }
    }
}

fn point_of(geometry: &Value) -> Option<(f64, f64)> {
    if let (Some(x), Some(y)) = (
        geometry.get("x").and_then(Value::as_f64),
        geometry.get("y").and_then(Value::as_f64),
    ) {
        return Some((x, y));
    }
    let coordinates = geometry.get("coordinates")?.as_array()?;
    match coordinates.as_slice() {
        [x, y, ..] => Some((x.as_f64()?, y.as_f64()?)),
        _ => None,
    }
}

fn collect_positions(value: &Value, out: &mut Vec<(f64, f64)>) {
    let Some(items) = value.as_array() else {
        return;
    };
    match items.as_slice() {
        [Value::Number(x), Value::Number(y), ..] => {
            if let (Some(x), Some(y)) = (x.as_f64(), y.as_f64()) {
                out.push((x, y));
            }
        }
        _ => items.iter().for_each(|item| collect_positions(item, out)),
    }
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), value| {
        (min.min(value), max.max(value))
    })
}
