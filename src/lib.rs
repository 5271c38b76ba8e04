//! # Geobridge
//!
//! A temporal record gateway in front of a spatial feature store.
//!
//! Two versioned record sets (bridge assets and route segments) are exposed over gRPC and an
//! asynchronous queue ingress. Every default read is restricted to records whose validity
//! window contains the current time, batch key lookups are chunked to the store's IN-list
//! limit, and edits addressed by natural key are reconciled to surrogate keys before they
//! are sent.

pub mod batch;
pub mod config;
pub mod error;
pub mod export;
pub mod gateway;
pub mod grpc_server;
pub mod ingress;
pub mod model;
pub mod predicate;
pub mod reconcile;
pub mod remote;
pub mod schema;
pub mod store;
pub mod temporal;
pub mod test_support;

// Re-export main types for convenience
pub use config::{GatewayConfig, LayerConfig};
pub use error::{ErrorCode, GatewayError, PublicError};
pub use gateway::RecordGateway;
pub use model::{AttrValue, EditResult, Record, SurrogateKey};
pub use predicate::{Predicate, ReadMode};
pub use schema::RecordSchema;
pub use store::{FeatureStore, InMemoryFeatureStore};
pub use temporal::{Instant, ValidityWindow};

use std::sync::Arc;

use export::DirectoryExporter;
use remote::HttpFeatureStore;

/// The gateways of both record sets, wired from configuration
#[derive(Clone)]
pub struct Gateways {
    pub assets: Arc<RecordGateway>,
    pub routes: Arc<RecordGateway>,
}

impl Gateways {
    /// Build both gateways against the configured feature service, or against in-process
    /// stores when `server.in_memory` is set.
    pub fn from_config(config: &GatewayConfig) -> error::Result<Self> {
        let (asset_store, route_store): (Arc<dyn FeatureStore>, Arc<dyn FeatureStore>) =
            if config.server.in_memory {
                (
                    Arc::new(InMemoryFeatureStore::new("assets", &config.assets.surrogate_key_field)),
                    Arc::new(InMemoryFeatureStore::new("routes", &config.routes.surrogate_key_field)),
                )
            } else {
                (
                    Arc::new(HttpFeatureStore::new("assets", &config.assets)?),
                    Arc::new(HttpFeatureStore::new("routes", &config.routes)?),
                )
            };
        Ok(Self::with_stores(config, asset_store, route_store))
    }

    /// Build both gateways over the given stores.
    pub fn with_stores(
        config: &GatewayConfig,
        asset_store: Arc<dyn FeatureStore>,
        route_store: Arc<dyn FeatureStore>,
    ) -> Self {
        let assets = RecordGateway::from_layer(asset_store, RecordSchema::asset(), &config.assets);
        let mut routes =
            RecordGateway::from_layer(route_store, RecordSchema::route(), &config.routes);
        if let Some(dir) = &config.export.output_dir {
            routes = routes.with_exporter(Arc::new(DirectoryExporter::new(dir)));
        }
        Self {
            assets: Arc::new(assets),
            routes: Arc::new(routes),
        }
    }
}
