use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use geobridge_rs::config::GatewayConfig;
use geobridge_rs::grpc_server::{create_grpc_services, proto, reflection_service};
use geobridge_rs::store::FeatureStore;
use geobridge_rs::test_support::{asset_store, route_store};
use geobridge_rs::{Gateways, InMemoryFeatureStore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

/// In-memory stores plus the gateways wired over them
#[allow(dead_code)]
pub struct Harness {
    pub assets: Arc<InMemoryFeatureStore>,
    pub routes: Arc<InMemoryFeatureStore>,
    pub gateways: Gateways,
}

#[allow(dead_code)]
pub fn harness(export_dir: Option<&Path>) -> Harness {
    let mut config = GatewayConfig::default();
    config.server.in_memory = true;
    config.export.output_dir = export_dir.map(Path::to_path_buf);
    let assets = asset_store();
    let routes = route_store();
    let gateways = Gateways::with_stores(
        &config,
        assets.clone() as Arc<dyn FeatureStore>,
        routes.clone() as Arc<dyn FeatureStore>,
    );
    Harness {
        assets,
        routes,
        gateways,
    }
}

#[allow(dead_code)]
pub async fn spawn_server(gateways: &Gateways) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (asset_master, road_network) =
        create_grpc_services(gateways.assets.clone(), gateways.routes.clone());
    let reflection = reflection_service()?;
    let handle = tokio::spawn(async move {
        Server::builder()
            .add_service(asset_master)
            .add_service(road_network)
            .add_service(reflection)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .expect("geobridge server");
    });
    Ok((addr, handle))
}

#[allow(dead_code)]
pub fn proto_asset(bridge_id: &str, name: &str) -> proto::Asset {
    proto::Asset {
        attributes: Some(proto::AssetAttributes {
            bridge_id: bridge_id.to_string(),
            bridge_name: name.to_string(),
            ..Default::default()
        }),
        geometry: None,
    }
}

#[allow(dead_code)]
pub fn keys(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}
