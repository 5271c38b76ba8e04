//! Unified configuration for the geobridge server.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (geobridge.toml)
//! ```toml
//! [server]
//! listen = "0.0.0.0:50070"
//!
//! [assets]
//! url = "https://gis.example.org/arcgis/rest/services/Bridges/FeatureServer/0"
//! chunk_size = 20
//!
//! [routes]
//! url = "https://gis.example.org/arcgis/rest/services/Roads/FeatureServer/0"
//! max_concurrent_chunks = 4
//!
//! [export]
//! output_dir = "/var/lib/geobridge/exports"
//! ```
//!
//! Environment variables use the `GEOBRIDGE_` prefix and `__` between levels, e.g.
//! `GEOBRIDGE_ASSETS__CHUNK_SIZE=50`.

mod defaults;

pub use defaults::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::schema::RecordSchema;

/// Main configuration for the geobridge server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    /// Asset (bridge) layer
    pub assets: LayerConfig,
    /// Route segment layer
    pub routes: LayerConfig,
    pub ingress: IngressConfig,
    pub export: ExportConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            assets: LayerConfig::assets(),
            routes: LayerConfig::routes(),
            ingress: IngressConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(GatewayConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Field names contain underscores, so levels are split on a double underscore.
        figment = figment.merge(Env::prefixed("GEOBRIDGE_").split("__"));

        figment = figment.merge(Serialized::defaults(overrides));

        let config: GatewayConfig = figment.extract().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, layer) in [("assets", &self.assets), ("routes", &self.routes)] {
            if layer.chunk_size == 0 {
                return Err(ConfigError::new(format!("{name}.chunk_size must be at least 1")));
            }
            if layer.max_concurrent_chunks == 0 {
                return Err(ConfigError::new(format!(
                    "{name}.max_concurrent_chunks must be at least 1"
                )));
            }
            if !self.server.in_memory && layer.url.is_none() {
                return Err(ConfigError::new(format!(
                    "{name}.url is required unless server.in_memory is set"
                )));
            }
        }
        Ok(())
    }
}

/// gRPC server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Serve from in-process stores instead of the remote feature service
    pub in_memory: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 50070)),
            in_memory: false,
        }
    }
}

/// One feature layer: where it lives, how to batch against it and which columns carry
/// identity and validity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Layer endpoint, without the trailing `/query` or `/applyEdits`
    pub url: Option<String>,
    /// Static access token appended to every request
    pub token: Option<String>,
    pub timeout_secs: u64,
    pub chunk_size: usize,
    pub max_concurrent_chunks: usize,
    pub natural_key_field: String,
    pub surrogate_key_field: String,
    pub start_field: String,
    pub end_field: String,
    /// WKID of returned geometries
    pub out_sr: u32,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self::assets()
    }
}

impl LayerConfig {
    pub fn assets() -> Self {
        Self::with_columns(ASSET_NATURAL_KEY_FIELD, ASSET_START_FIELD, ASSET_END_FIELD)
    }

    pub fn routes() -> Self {
        Self::with_columns(ROUTE_NATURAL_KEY_FIELD, ROUTE_START_FIELD, ROUTE_END_FIELD)
    }

    fn with_columns(natural_key: &str, start: &str, end: &str) -> Self {
        Self {
            url: None,
            token: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            natural_key_field: natural_key.to_string(),
            surrogate_key_field: DEFAULT_SURROGATE_KEY_FIELD.to_string(),
            start_field: start.to_string(),
            end_field: end.to_string(),
            out_sr: DEFAULT_OUT_SR,
        }
    }

    /// Apply the configured key and validity columns to a built-in schema
    pub fn apply_columns(&self, schema: RecordSchema) -> RecordSchema {
        schema
            .with_key_columns(&self.natural_key_field, &self.surrogate_key_field)
            .with_validity_columns(&self.start_field, &self.end_field)
    }
}

/// Asynchronous ingress configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    pub channel_capacity: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Route export configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Directory receiving export files; export is disabled when unset
    pub output_dir: Option<PathBuf>,
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_memory: Option<bool>,
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
#[error("configuration error: {message}")]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::new(e.to_string())
    }
}
