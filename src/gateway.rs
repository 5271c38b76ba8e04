//! # Record Gateway
//!
//! Single entry point of the dispatch layer for one record set. Every default read path is
//! restricted to active records; edits that arrive without a surrogate key are reconciled
//! against the active records of their natural key first.
//!
//! Edits return one [`EditResult`] per outgoing record, in input order. A store that rejects
//! or fails the edit call yields `success = false` results, not an error. Errors are reserved
//! for problems found before anything is sent.

use std::sync::Arc;
use std::time::Instant as Clock;

use serde_json::Value;
use tracing::instrument;

use crate::batch::BatchExecutor;
use crate::config::LayerConfig;
use crate::error::{GatewayError, PublicError, Result};
use crate::export::{self, Exporter};
use crate::model::{EditResult, RawFeature, Record, SurrogateKey};
use crate::predicate::{Predicate, ReadMode};
use crate::reconcile::Reconciler;
use crate::schema::RecordSchema;
use crate::store::{EditBatch, EditOutcomes, FeatureStore, QueryRequest, SpatialFilter, SpatialRelation};
use crate::temporal::{self, ValidityWindow};

#[derive(Clone)]
pub struct RecordGateway {
    executor: BatchExecutor,
    reconciler: Reconciler,
    exporter: Option<Arc<dyn Exporter>>,
}

impl RecordGateway {
    pub fn new(store: Arc<dyn FeatureStore>, schema: RecordSchema) -> Self {
        Self::from_executor(BatchExecutor::new(store, Arc::new(schema)))
    }

    /// Build a gateway with the layer's columns and batching limits applied to `schema`.
    pub fn from_layer(store: Arc<dyn FeatureStore>, schema: RecordSchema, layer: &LayerConfig) -> Self {
        let executor = BatchExecutor::new(store, Arc::new(layer.apply_columns(schema)))
            .with_chunk_size(layer.chunk_size)
            .with_max_concurrent_chunks(layer.max_concurrent_chunks);
        Self::from_executor(executor)
    }

    fn from_executor(executor: BatchExecutor) -> Self {
        Self {
            reconciler: Reconciler::new(executor.clone()),
            executor,
            exporter: None,
        }
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn Exporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn schema(&self) -> &RecordSchema {
        self.executor.schema()
    }

    fn layer(&self) -> &str {
        &self.schema().name
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Active records by natural key.
    pub async fn get_by_key(&self, keys: &[String], columns: &[String]) -> Result<Vec<Record>> {
        self.get_by_key_with(keys, columns, ReadMode::Active).await
    }

    /// All versions of the given natural keys, retired and future ones included.
    pub async fn get_history(&self, keys: &[String], columns: &[String]) -> Result<Vec<Record>> {
        self.get_by_key_with(keys, columns, ReadMode::IncludeInactive)
            .await
    }

    #[instrument(skip_all, fields(layer = %self.layer(), mode = ?mode, keys = keys.len()))]
    pub async fn get_by_key_with(
        &self,
        keys: &[String],
        columns: &[String],
        mode: ReadMode,
    ) -> Result<Vec<Record>> {
        let started = Clock::now();
        let result = async {
            let out_fields = self.schema().resolve_columns(columns)?;
            self.executor
                .query_by_keys(&self.schema().natural_key, keys, out_fields, mode)
                .await
        }
        .await;
        finish("get_by_key", keys.len(), started, result.as_ref().map(Vec::len));
        result
    }

    /// Active records whose `field` equals one of `values`.
    #[instrument(skip_all, fields(layer = %self.layer(), field = %field, values = values.len()))]
    pub async fn get_by_attribute(
        &self,
        field: &str,
        values: &[String],
        columns: &[String],
    ) -> Result<Vec<Record>> {
        let started = Clock::now();
        let result = async {
            let field = self.schema().canonical_column(field).ok_or_else(|| {
                GatewayError::malformed(format!("unknown field {field:?} for {}", self.layer()))
            })?;
            let out_fields = self.schema().resolve_columns(columns)?;
            self.executor
                .query_by_keys(field, values, out_fields, ReadMode::Active)
                .await
        }
        .await;
        finish("get_by_attribute", values.len(), started, result.as_ref().map(Vec::len));
        result
    }

    /// Active records contained by a GeoJSON region.
    #[instrument(skip_all, fields(layer = %self.layer(), crs = %crs))]
    pub async fn get_by_region(&self, geojson: &str, crs: &str, columns: &[String]) -> Result<Vec<Record>> {
        let started = Clock::now();
        let result = async {
            let geometry: Value = serde_json::from_str(geojson)
                .map_err(|err| GatewayError::malformed(format!("invalid GeoJSON: {err}")))?;
            if !geometry.is_object() {
                return Err(GatewayError::malformed("GeoJSON region must be an object"));
            }
            if crs.trim().is_empty() {
                return Err(GatewayError::malformed("region CRS is required"));
            }
            let out_fields = self.schema().resolve_columns(columns)?;
            let request = QueryRequest::new(Predicate::True)
                .with_out_fields(out_fields)
                .with_spatial(SpatialFilter {
                    geometry,
                    crs: crs.to_string(),
                    relation: SpatialRelation::Contains,
                });
            self.executor.query(request, ReadMode::Active).await
        }
        .await;
        finish("get_by_region", 1, started, result.as_ref().map(Vec::len));
        result
    }

    /// Surrogate keys of the active records for one natural key.
    #[instrument(skip_all, fields(layer = %self.layer()))]
    pub async fn active_surrogate_keys(&self, natural_key: &str) -> Result<Vec<SurrogateKey>> {
        let started = Clock::now();
        let result = async {
            if natural_key.trim().is_empty() {
                return Err(GatewayError::malformed(format!(
                    "{} is required",
                    self.schema().natural_key
                )));
            }
            self.reconciler.active_keys(natural_key.trim()).await
        }
        .await;
        finish("active_surrogate_keys", 1, started, result.as_ref().map(Vec::len));
        result
    }

    // ------------------------------------------------------------------
    // Edits
    // ------------------------------------------------------------------

    /// Insert new records. The store assigns surrogate keys; any key supplied is dropped.
    #[instrument(skip_all, fields(layer = %self.layer(), records = records.len()))]
    pub async fn insert(&self, records: Vec<Record>) -> Result<Vec<EditResult>> {
        let started = Clock::now();
        let input = records.len();
        let result = async {
            self.ensure_not_empty(&records, "insert")?;
            for record in &records {
                self.schema().validate_required(record)?;
            }
            let outgoing: Vec<Record> = records
                .into_iter()
                .map(|record| Record {
                    surrogate_key: None,
                    ..record
                })
                .collect();
            let features = outgoing.iter().map(|record| self.to_feature(record)).collect();
            let outcome = self.executor.store().apply_edits(EditBatch::adds(features)).await;
            Ok::<_, GatewayError>(per_record(&outgoing, outcome, |outcomes| outcomes.add_results))
        }
        .await;
        finish("insert", input, started, result.as_ref().map(Vec::len));
        result
    }

    /// Send the mapped attributes of each record; unresolved records are reconciled first.
    #[instrument(skip_all, fields(layer = %self.layer(), records = records.len()))]
    pub async fn update(&self, records: Vec<Record>) -> Result<Vec<EditResult>> {
        let started = Clock::now();
        let input = records.len();
        let result = async {
            self.ensure_not_empty(&records, "update")?;
            let resolved = self.resolve_all(records).await?;
            Ok::<_, GatewayError>(self.send_updates(resolved).await)
        }
        .await;
        finish("update", input, started, result.as_ref().map(Vec::len));
        result
    }

    /// Close the validity window of each record at the current time.
    #[instrument(skip_all, fields(layer = %self.layer(), records = records.len()))]
    pub async fn retire(&self, records: Vec<Record>) -> Result<Vec<EditResult>> {
        let started = Clock::now();
        let input = records.len();
        let result = async {
            self.ensure_not_empty(&records, "retire")?;
            let now = temporal::now();
            let minimal = records
                .into_iter()
                .map(|record| Record {
                    natural_key: record.natural_key,
                    surrogate_key: record.surrogate_key,
                    window: ValidityWindow::new(None, Some(now)),
                    ..Record::default()
                })
                .collect();
            let resolved = self.resolve_all(minimal).await?;
            Ok::<_, GatewayError>(self.send_updates(resolved).await)
        }
        .await;
        finish("retire", input, started, result.as_ref().map(Vec::len));
        result
    }

    /// Remove the underlying rows.
    #[instrument(skip_all, fields(layer = %self.layer(), records = records.len()))]
    pub async fn delete(&self, records: Vec<Record>) -> Result<Vec<EditResult>> {
        let started = Clock::now();
        let input = records.len();
        let result = async {
            self.ensure_not_empty(&records, "delete")?;
            let resolved = self.resolve_all(records).await?;
            let keys: Vec<SurrogateKey> = resolved.iter().filter_map(|r| r.surrogate_key).collect();
            let outcome = self.executor.store().apply_edits(EditBatch::deletes(keys)).await;
            Ok::<_, GatewayError>(per_record(&resolved, outcome, |outcomes| outcomes.delete_results))
        }
        .await;
        finish("delete", input, started, result.as_ref().map(Vec::len));
        result
    }

    // ------------------------------------------------------------------
    // Export
    // ------------------------------------------------------------------

    /// Fetch the active records for `keys` and hand them to the configured exporter.
    #[instrument(skip_all, fields(layer = %self.layer(), keys = keys.len()))]
    pub async fn export(&self, keys: &[String], output_name: &str) -> Result<String> {
        let started = Clock::now();
        let result = async {
            let name = export::normalize_output_name(output_name)?;
            if keys.is_empty() {
                return Err(GatewayError::malformed("no records requested for export"));
            }
            let exporter = self
                .exporter
                .as_ref()
                .ok_or_else(|| GatewayError::backend(format!("no exporter configured for {}", self.layer())))?;

            let schema = self.schema();
            let mut projection = vec![schema.surrogate_key.clone(), schema.natural_key.clone()];
            // first declared field carries the display name
            if let Some(name_field) = schema.fields.first() {
                projection.push(name_field.name.clone());
            }
            let records = self
                .executor
                .query_by_keys(&schema.natural_key, keys, Some(projection), ReadMode::Active)
                .await?;
            exporter.export(&name, &records).await
        }
        .await;
        finish("export", keys.len(), started, result.as_ref().map(|_| 1));
        result
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn ensure_not_empty(&self, records: &[Record], op: &str) -> Result<()> {
        if records.is_empty() {
            Err(GatewayError::malformed(format!("{op} needs at least one record")))
        } else {
            Ok(())
        }
    }

    /// Resolve every candidate before anything is sent. Fan-out stays at the input position.
    async fn resolve_all(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        let mut resolved = Vec::with_capacity(records.len());
        for record in records {
            resolved.extend(self.reconciler.resolve(record).await?);
        }
        Ok(resolved)
    }

    async fn send_updates(&self, resolved: Vec<Record>) -> Vec<EditResult> {
        let features = resolved.iter().map(|record| self.to_feature(record)).collect();
        let outcome = self.executor.store().apply_edits(EditBatch::updates(features)).await;
        per_record(&resolved, outcome, |outcomes| outcomes.update_results)
    }

    fn to_feature(&self, record: &Record) -> RawFeature {
        RawFeature {
            attributes: self.schema().to_attributes(record),
            geometry: record.geometry.as_ref().map(|geometry| geometry.0.clone()),
        }
    }
}

/// Pair each sent record with its store outcome. A failed call fails every record.
fn per_record(
    sent: &[Record],
    outcome: Result<EditOutcomes>,
    select: impl FnOnce(EditOutcomes) -> Vec<EditResult>,
) -> Vec<EditResult> {
    match outcome {
        Ok(outcomes) => {
            let mut results = select(outcomes).into_iter();
            sent.iter()
                .map(|record| {
                    results.next().unwrap_or_else(|| {
                        EditResult::failed(record.surrogate_key, "store returned no result for this record")
                    })
                })
                .collect()
        }
        Err(err) => {
            let public = PublicError::from_gateway(&err);
            sent.iter()
                .map(|record| EditResult::failed(record.surrogate_key, public.message.clone()))
                .collect()
        }
    }
}

fn finish(op: &'static str, input: usize, started: Clock, outcome: Result<usize, &GatewayError>) {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(output) => tracing::info!(op, input, output, elapsed_ms, "done"),
        Err(err) => tracing::warn!(op, input, code = %err.code(), error = %err, elapsed_ms, "failed"),
    }
}
