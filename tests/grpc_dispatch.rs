use geobridge_rs::grpc_server::proto::{
    asset_master_client::AssetMasterClient, road_network_client::RoadNetworkClient, Assets,
    ExportRequest, HealthCheckRequest, KeyRequest, SpatialRequest, SurrogateKeyRequest,
    ValueRequest,
};
use geobridge_rs::test_support::{asset_row, seed_routes};
use serde_json::json;
use tonic::transport::Channel;
use tonic::Code;
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient;
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1::ServerReflectionRequest;

mod support;

#[tokio::test]
async fn asset_lifecycle_over_grpc() -> anyhow::Result<()> {
    let harness = support::harness(None);
    let (addr, _handle) = support::spawn_server(&harness.gateways).await?;
    let mut client = AssetMasterClient::connect(format!("http://{addr}")).await?;

    let health = client.health_check(HealthCheckRequest {}).await?.into_inner();
    assert_eq!(health.status, "OK");

    let inserted = client
        .insert(Assets {
            assets: vec![support::proto_asset("BR-100", "Kali Progo")],
        })
        .await?
        .into_inner();
    assert_eq!(inserted.add_results.len(), 1);
    assert!(inserted.add_results[0].success);
    let objectid = inserted.add_results[0].objectid;
    assert!(objectid > 0);
    assert!(inserted.add_results[0].global_id.is_some());

    let found = client
        .get_by_key(KeyRequest {
            keys: support::keys(&["BR-100"]),
            out_fields: Vec::new(),
        })
        .await?
        .into_inner();
    assert_eq!(found.assets.len(), 1);
    let attributes = found.assets[0].attributes.clone().unwrap();
    assert_eq!(attributes.objectid, objectid);
    assert_eq!(attributes.bridge_name, "Kali Progo");
    assert_eq!(attributes.end_date, None);

    let by_name = client
        .get_by_name(ValueRequest {
            values: support::keys(&["Kali Progo"]),
            out_fields: Vec::new(),
        })
        .await?
        .into_inner();
    assert_eq!(by_name.assets.len(), 1);

    let retired = client
        .retire(Assets {
            assets: vec![support::proto_asset("BR-100", "")],
        })
        .await?
        .into_inner();
    assert_eq!(retired.update_results.len(), 1);
    assert_eq!(retired.update_results[0].objectid, objectid);

    let active = client
        .get_by_key(KeyRequest {
            keys: support::keys(&["BR-100"]),
            out_fields: Vec::new(),
        })
        .await?
        .into_inner();
    assert!(active.assets.is_empty());

    let history = client
        .get_history(KeyRequest {
            keys: support::keys(&["BR-100"]),
            out_fields: Vec::new(),
        })
        .await?
        .into_inner();
    assert_eq!(history.assets.len(), 1);
    assert!(history.assets[0].attributes.as_ref().unwrap().end_date.is_some());

    let deleted = client
        .delete(SurrogateKeyRequest {
            objectids: vec![objectid, 999],
        })
        .await?
        .into_inner();
    assert_eq!(deleted.delete_results.len(), 2);
    assert!(deleted.delete_results[0].success);
    assert!(!deleted.delete_results[1].success);
    Ok(())
}

#[tokio::test]
async fn request_errors_map_to_status_codes() -> anyhow::Result<()> {
    let harness = support::harness(None);
    let (addr, _handle) = support::spawn_server(&harness.gateways).await?;
    let mut client = AssetMasterClient::connect(format!("http://{addr}")).await?;

    let empty = client.insert(Assets { assets: Vec::new() }).await.unwrap_err();
    assert_eq!(empty.code(), Code::InvalidArgument);

    let missing_name = client
        .insert(Assets {
            assets: vec![support::proto_asset("BR-1", "")],
        })
        .await
        .unwrap_err();
    assert_eq!(missing_name.code(), Code::InvalidArgument);

    let unknown = client
        .update(Assets {
            assets: vec![support::proto_asset("BR-404", "Renamed")],
        })
        .await
        .unwrap_err();
    assert_eq!(unknown.code(), Code::NotFound);

    let no_identity = client
        .update(Assets {
            assets: vec![support::proto_asset("", "Renamed")],
        })
        .await
        .unwrap_err();
    assert_eq!(no_identity.code(), Code::FailedPrecondition);

    let bad_region = client
        .get_by_spatial_filter(SpatialRequest {
            geojson: "not json".to_string(),
            crs: "EPSG:4326".to_string(),
            out_fields: Vec::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(bad_region.code(), Code::InvalidArgument);
    Ok(())
}

#[tokio::test]
async fn spatial_filter_returns_contained_assets() -> anyhow::Result<()> {
    let harness = support::harness(None);
    harness
        .assets
        .seed(asset_row("IN", "Inside"), Some(json!({"x": 1.0, "y": 1.0})))?;
    harness
        .assets
        .seed(asset_row("OUT", "Outside"), Some(json!({"x": 9.0, "y": 9.0})))?;
    let (addr, _handle) = support::spawn_server(&harness.gateways).await?;
    let mut client = AssetMasterClient::connect(format!("http://{addr}")).await?;

    let polygon = json!({
        "type": "Polygon",
        "coordinates": [[[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0], [0.0, 0.0]]]
    });
    let found = client
        .get_by_spatial_filter(SpatialRequest {
            geojson: polygon.to_string(),
            crs: "EPSG:4326".to_string(),
            out_fields: Vec::new(),
        })
        .await?
        .into_inner();

    assert_eq!(found.assets.len(), 1);
    assert_eq!(found.assets[0].attributes.as_ref().unwrap().bridge_id, "IN");
    Ok(())
}

#[tokio::test]
async fn routes_lookup_and_export() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let harness = support::harness(Some(dir.path()));
    let keys = seed_routes(&harness.routes, 25)?;
    let (addr, _handle) = support::spawn_server(&harness.gateways).await?;
    let mut client = RoadNetworkClient::connect(format!("http://{addr}")).await?;

    let routes = client
        .get_by_route_id(KeyRequest {
            keys: keys.clone(),
            out_fields: Vec::new(),
        })
        .await?
        .into_inner();
    assert_eq!(routes.routes.len(), 25);
    assert_eq!(routes.routes[20].attributes.as_ref().unwrap().linkid, "00021");

    let exported = client
        .export_routes(ExportRequest {
            routes: keys,
            output_shp: "jalan_jabar.shp".to_string(),
        })
        .await?
        .into_inner();
    assert!(exported.path.ends_with("JALAN_JABAR.geojson"));
    assert!(dir.path().join("JALAN_JABAR.geojson").exists());

    let rejected = client
        .export_routes(ExportRequest {
            routes: support::keys(&["00001"]),
            output_shp: "jalan.gpkg".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(rejected.code(), Code::InvalidArgument);
    Ok(())
}

#[tokio::test]
async fn reflection_lists_both_services() -> anyhow::Result<()> {
    let harness = support::harness(None);
    let (addr, _handle) = support::spawn_server(&harness.gateways).await?;
    let channel = Channel::from_shared(format!("http://{addr}"))?.connect().await?;
    let mut client = ServerReflectionClient::new(channel);

    let request = ServerReflectionRequest {
        host: String::new(),
        message_request: Some(MessageRequest::ListServices(String::new())),
    };
    let mut responses = client
        .server_reflection_info(tokio_stream::once(request))
        .await?
        .into_inner();
    let response = responses.message().await?.expect("reflection response");

    let list = match response.message_response {
        Some(MessageResponse::ListServicesResponse(list)) => list,
        other => panic!("unexpected reflection response: {other:?}"),
    };
    let names: Vec<String> = list.service.into_iter().map(|service| service.name).collect();
    assert!(names.contains(&"geobridge.v1.AssetMaster".to_string()));
    assert!(names.contains(&"geobridge.v1.RoadNetwork".to_string()));
    Ok(())
}
