//! Export hand-off: output name rules and the collaborator that packages records.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{GatewayError, Result};
use crate::model::Record;

/// Packages already-resolved, active records and returns where they can be retrieved.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export(&self, name: &str, records: &[Record]) -> Result<String>;
}

/// Validate a requested output name and return its upper-cased base name.
///
/// `roads` and `roads.shp` both become `ROADS`; any other extension is rejected.
pub fn normalize_output_name(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::malformed("output file name is empty"));
    }
    let base = match trimmed.rsplit_once('.') {
        Some((base, extension)) if extension.eq_ignore_ascii_case("shp") => base,
        Some((_, extension)) => {
            return Err(GatewayError::malformed(format!(
                "output file format should be .shp, not .{extension}"
            )))
        }
        None => trimmed,
    };
    if base.is_empty() || base.contains(['/', '\\']) {
        return Err(GatewayError::malformed(format!(
            "invalid output file name {raw:?}"
        )));
    }
    Ok(base.to_uppercase())
}

/// Writes each export as a GeoJSON feature collection under a local directory.
#[derive(Debug, Clone)]
pub struct DirectoryExporter {
    dir: PathBuf,
}

impl DirectoryExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Exporter for DirectoryExporter {
    async fn export(&self, name: &str, records: &[Record]) -> Result<String> {
        let collection = feature_collection(records);
        let body = serde_json::to_vec_pretty(&collection)
            .map_err(|err| GatewayError::backend(format!("encode export {name}: {err}")))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| GatewayError::backend(format!("create {}: {err}", self.dir.display())))?;
        let path = self.dir.join(format!("{name}.geojson"));
        tokio::fs::write(&path, body)
            .await
            .map_err(|err| GatewayError::backend(format!("write {}: {err}", path.display())))?;

        tracing::info!(path = %path.display(), features = records.len(), "export written");
        Ok(format!("file://{}", path.display()))
    }
}

fn feature_collection(records: &[Record]) -> Value {
    let features: Vec<Value> = records
        .iter()
        .map(|record| {
            let mut properties = serde_json::Map::new();
            properties.insert("natural_key".to_string(), json!(record.natural_key));
            for (name, value) in &record.attributes {
                if !value.is_zero() {
                    properties.insert(name.clone(), value.to_json());
                }
            }
            json!({
                "type": "Feature",
                "id": record.surrogate_key.map(|key| key.0),
                "geometry": record.geometry.as_ref().map(|g| g.0.clone()),
                "properties": properties,
            })
        })
        .collect();
    json!({"type": "FeatureCollection", "features": features})
}
