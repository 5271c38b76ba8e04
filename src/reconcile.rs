//! # Natural-Key Reconciler
//!
//! Edit requests may name a record only by its natural key. Before such a request reaches the
//! store it is resolved against the active records carrying that key, one outgoing record per
//! match.

use crate::batch::BatchExecutor;
use crate::error::{GatewayError, Result};
use crate::model::{Record, SurrogateKey};
use crate::predicate::ReadMode;

#[derive(Clone)]
pub struct Reconciler {
    executor: BatchExecutor,
}

impl Reconciler {
    pub fn new(executor: BatchExecutor) -> Self {
        Self { executor }
    }

    /// Surrogate keys of the active records carrying `natural_key`, in store order.
    pub async fn active_keys(&self, natural_key: &str) -> Result<Vec<SurrogateKey>> {
        let schema = self.executor.schema();
        let projection = vec![schema.surrogate_key.clone(), schema.natural_key.clone()];
        let matches = self
            .executor
            .query_by_keys(
                &schema.natural_key,
                &[natural_key.to_string()],
                Some(projection),
                ReadMode::Active,
            )
            .await?;

        matches
            .iter()
            .map(|found| {
                found.surrogate_key.ok_or_else(|| {
                    GatewayError::backend(format!(
                        "store returned a {} row without {}",
                        schema.name, schema.surrogate_key
                    ))
                })
            })
            .collect()
    }

    /// Resolve a candidate into the records an edit must target.
    ///
    /// A candidate that already carries a surrogate key is returned as is. Otherwise the
    /// candidate is cloned onto every active match of its natural key.
    pub async fn resolve(&self, candidate: Record) -> Result<Vec<Record>> {
        if candidate.surrogate_key.is_some() {
            return Ok(vec![candidate]);
        }
        let natural_key = candidate.natural_key.trim();
        if natural_key.is_empty() {
            return Err(GatewayError::Identity(format!(
                "{} record has neither {} nor {}",
                self.executor.schema().name,
                self.executor.schema().surrogate_key,
                self.executor.schema().natural_key
            )));
        }

        let keys = self.active_keys(natural_key).await?;
        if keys.is_empty() {
            return Err(GatewayError::NotFound {
                natural_key: natural_key.to_string(),
            });
        }
        if keys.len() > 1 {
            tracing::warn!(
                natural_key = %natural_key,
                matches = keys.len(),
                "natural key resolves to several active records"
            );
        }

        let natural_key = natural_key.to_string();
        Ok(keys
            .into_iter()
            .map(|key| Record {
                natural_key: natural_key.clone(),
                surrogate_key: Some(key),
                ..candidate.clone()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RecordSchema;
    use crate::store::FeatureStore;
    use crate::test_support::{asset_row, asset_store, RecordingStore};
    use std::sync::Arc;

    fn reconciler(store: Arc<dyn FeatureStore>) -> Reconciler {
        Reconciler::new(BatchExecutor::new(store, Arc::new(RecordSchema::asset())))
    }

    #[tokio::test]
    async fn test_keyed_record_is_returned_unchanged() {
        let recording = Arc::new(RecordingStore::new(asset_store()));
        let candidate = Record::new("X")
            .with_surrogate_key(SurrogateKey(7))
            .with_attr("BRIDGE_NAME", "A");

        let resolved = reconciler(recording.clone())
            .resolve(candidate.clone())
            .await
            .unwrap();

        assert_eq!(resolved, vec![candidate]);
        assert_eq!(recording.query_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_identity() {
        let err = reconciler(asset_store())
            .resolve(Record::new("  ").with_attr("BRIDGE_NAME", "A"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Identity(_)));
    }

    #[tokio::test]
    async fn test_no_active_match_is_not_found() {
        let err = reconciler(asset_store())
            .resolve(Record::new("BR-404"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::NotFound {
                natural_key: "BR-404".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_fan_out_over_active_duplicates() {
        let store = asset_store();
        let first = store.seed(asset_row("X", "One"), None).unwrap();
        let second = store.seed(asset_row("X", "Two"), None).unwrap();
        store.seed(asset_row("Y", "Other"), None).unwrap();
        let recording = Arc::new(RecordingStore::new(store));

        let resolved = reconciler(recording.clone())
            .resolve(Record::new("X").with_attr("WIDTH", 9.5))
            .await
            .unwrap();

        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].surrogate_key, Some(first));
        assert_eq!(resolved[1].surrogate_key, Some(second));
        assert!(resolved
            .iter()
            .all(|r| r.natural_key == "X" && r.attr("WIDTH") == Some(&9.5.into())));

        let query = &recording.queries()[0];
        assert_eq!(
            query.out_fields,
            Some(vec!["OBJECTID".to_string(), "BRIDGE_ID".to_string()])
        );
    }

    #[tokio::test]
    async fn test_retired_rows_are_not_targets() {
        let store = asset_store();
        let mut retired = asset_row("X", "Old");
        retired.insert("END_DATE".to_string(), crate::temporal::now().into());
        store.seed(retired, None).unwrap();
        let active = store.seed(asset_row("X", "Current"), None).unwrap();

        let resolved = reconciler(store).resolve(Record::new("X")).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].surrogate_key, Some(active));
    }
}
