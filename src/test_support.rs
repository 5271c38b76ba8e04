//! Test doubles and fixtures shared by unit tests and integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{GatewayError, Result};
use crate::model::{RawAttributes, RawFeature, Record};
use crate::schema::RecordSchema;
use crate::store::{EditBatch, EditOutcomes, FeatureStore, InMemoryFeatureStore, QueryRequest};

/// Wraps a store and records every request passing through it.
///
/// Can be told to fail the n-th query (0-based) or every edit call.
pub struct RecordingStore {
    inner: Arc<dyn FeatureStore>,
    queries: Mutex<Vec<QueryRequest>>,
    edits: Mutex<Vec<EditBatch>>,
    query_calls: AtomicUsize,
    fail_query_at: Option<usize>,
    fail_edits: bool,
}

impl RecordingStore {
    pub fn new(inner: Arc<dyn FeatureStore>) -> Self {
        Self {
            inner,
            queries: Mutex::new(Vec::new()),
            edits: Mutex::new(Vec::new()),
            query_calls: AtomicUsize::new(0),
            fail_query_at: None,
            fail_edits: false,
        }
    }

    pub fn failing_query_at(mut self, call: usize) -> Self {
        self.fail_query_at = Some(call);
        self
    }

    pub fn failing_edits(mut self) -> Self {
        self.fail_edits = true;
        self
    }

    pub fn queries(&self) -> Vec<QueryRequest> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }

    pub fn edits(&self) -> Vec<EditBatch> {
        self.edits.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn query_count(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeatureStore for RecordingStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn query(&self, request: QueryRequest) -> Result<Vec<RawFeature>> {
        let call = self.query_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut queries) = self.queries.lock() {
            queries.push(request.clone());
        }
        if self.fail_query_at == Some(call) {
            return Err(GatewayError::backend(format!("injected failure on query {call}")));
        }
        self.inner.query(request).await
    }

    async fn apply_edits(&self, batch: EditBatch) -> Result<EditOutcomes> {
        if let Ok(mut edits) = self.edits.lock() {
            edits.push(batch.clone());
        }
        if self.fail_edits {
            return Err(GatewayError::backend("injected edit failure: service unavailable"));
        }
        self.inner.apply_edits(batch).await
    }
}

pub fn object(value: Value) -> RawAttributes {
    match value {
        Value::Object(map) => map,
        _ => RawAttributes::new(),
    }
}

/// Raw asset row as the store would hold it
pub fn asset_row(natural_key: &str, name: &str) -> RawAttributes {
    object(json!({
        "BRIDGE_ID": natural_key,
        "BRIDGE_NAME": name,
        "START_DATE": null,
        "END_DATE": null,
    }))
}

/// Typed asset ready for insert
pub fn asset(natural_key: &str, name: &str) -> Record {
    Record::new(natural_key).with_attr("BRIDGE_NAME", name)
}

/// Raw route row
pub fn route_row(link_id: &str, name: &str) -> RawAttributes {
    object(json!({
        "LINKID": link_id,
        "LINK_NAME": name,
    }))
}

pub fn asset_store() -> Arc<InMemoryFeatureStore> {
    let schema = RecordSchema::asset();
    Arc::new(InMemoryFeatureStore::new(schema.name, schema.surrogate_key))
}

pub fn route_store() -> Arc<InMemoryFeatureStore> {
    let schema = RecordSchema::route();
    Arc::new(InMemoryFeatureStore::new(schema.name, schema.surrogate_key))
}

/// Seed `count` active routes with keys `00001..`
pub fn seed_routes(store: &InMemoryFeatureStore, count: usize) -> Result<Vec<String>> {
    (1..=count)
        .map(|index| {
            let link_id = format!("{index:05}");
            store.seed(route_row(&link_id, &format!("Ruas {index}")), None)?;
            Ok(link_id)
        })
        .collect()
}
