//! # Chunked Batch Query Executor
//!
//! Splits a key-set lookup into IN-queries the feature store will accept and stitches the
//! partial results back together in key order.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};

use crate::config::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT_CHUNKS};
use crate::error::Result;
use crate::model::{RawFeature, Record};
use crate::predicate::{self, Predicate, ReadMode};
use crate::schema::RecordSchema;
use crate::store::{FeatureStore, QueryRequest};

/// A contiguous slice of a larger key set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a, K> {
    pub index: usize,
    /// Position of the first key in the original key set
    pub offset: usize,
    pub keys: &'a [K],
}

/// Split `keys` into chunks of at most `chunk_size` keys. A zero size is treated as one.
pub fn chunk_keys<K>(keys: &[K], chunk_size: usize) -> impl Iterator<Item = Chunk<'_, K>> {
    let size = chunk_size.max(1);
    keys.chunks(size).enumerate().map(move |(index, slice)| Chunk {
        index,
        offset: index * size,
        keys: slice,
    })
}

/// Runs read queries for one record set and maps the rows through its schema.
#[derive(Clone)]
pub struct BatchExecutor {
    store: Arc<dyn FeatureStore>,
    schema: Arc<RecordSchema>,
    chunk_size: usize,
    max_concurrent_chunks: usize,
}

impl BatchExecutor {
    pub fn new(store: Arc<dyn FeatureStore>, schema: Arc<RecordSchema>) -> Self {
        Self {
            store,
            schema,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_max_concurrent_chunks(mut self, limit: usize) -> Self {
        self.max_concurrent_chunks = limit.max(1);
        self
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    pub fn store(&self) -> &Arc<dyn FeatureStore> {
        &self.store
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Query records whose `field` is one of `keys`.
    ///
    /// Results come back in chunk order with the store's row order kept inside each chunk.
    /// Duplicate keys are sent as given. The first failing chunk aborts the whole call.
    pub async fn query_by_keys(
        &self,
        field: &str,
        keys: &[String],
        out_fields: Option<Vec<String>>,
        mode: ReadMode,
    ) -> Result<Vec<Record>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let requests: Vec<QueryRequest> = chunk_keys(keys, self.chunk_size)
            .map(|chunk| {
                tracing::debug!(
                    layer = %self.store.name(),
                    chunk = chunk.index,
                    offset = chunk.offset,
                    keys = chunk.keys.len(),
                    "issuing chunk query"
                );
                let base = Predicate::in_values(field, chunk.keys.iter().map(String::as_str));
                QueryRequest::new(self.scoped(base, mode)).with_out_fields(out_fields.clone())
            })
            .collect();

        let partials: Vec<Vec<RawFeature>> = stream::iter(requests)
            .map(|request| self.store.query(request))
            .buffered(self.max_concurrent_chunks)
            .try_collect()
            .await?;

        partials
            .iter()
            .flatten()
            .map(|feature| self.to_record(feature))
            .collect()
    }

    /// Run one query whose predicate is scoped by `mode`.
    pub async fn query(&self, request: QueryRequest, mode: ReadMode) -> Result<Vec<Record>> {
        let request = QueryRequest {
            predicate: self.scoped(request.predicate, mode),
            ..request
        };
        let features = self.store.query(request).await?;
        features.iter().map(|feature| self.to_record(feature)).collect()
    }

    fn scoped(&self, base: Predicate, mode: ReadMode) -> Predicate {
        predicate::scoped(base, mode, &self.schema.start_field, &self.schema.end_field)
    }

    fn to_record(&self, feature: &RawFeature) -> Result<Record> {
        self.schema
            .to_record(&feature.attributes, feature.geometry.as_ref())
    }
}
