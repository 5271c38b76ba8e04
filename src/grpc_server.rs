//! # gRPC Server Implementation
//!
//! Dispatch layer for the `AssetMaster` and `RoadNetwork` services. Wire messages are mapped
//! to raw attribute rows and sent through the record schema, so the gateway only ever sees
//! typed records.

use crate::error::{ErrorCode, GatewayError, PublicError};
use crate::gateway::RecordGateway;
use crate::model::{AttrValue, EditResult, RawAttributes, Record, SurrogateKey};
use crate::schema::RecordSchema;
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tonic_reflection::pb::v1::server_reflection_server::{ServerReflection, ServerReflectionServer};

// Include the generated gRPC code
pub mod proto {
    tonic::include_proto!("geobridge.v1");

    /// Encoded descriptors served through gRPC reflection
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("geobridge_descriptor");
}

use proto::asset_master_server::{AssetMaster, AssetMasterServer};
use proto::road_network_server::{RoadNetwork, RoadNetworkServer};

/// Map a gateway error onto a status. Internal detail never leaves the process.
pub fn to_status(err: &GatewayError) -> Status {
    let public = PublicError::from_gateway(err);
    match public.code {
        ErrorCode::MalformedRequest => Status::invalid_argument(public.message),
        ErrorCode::Identity => Status::failed_precondition(public.message),
        ErrorCode::NotFound => Status::not_found(public.message),
        ErrorCode::Mapping => Status::internal(public.message),
        ErrorCode::Backend => Status::unavailable(public.message),
    }
}

fn parse_geometry(geometry: Option<String>) -> Result<Option<Value>, GatewayError> {
    geometry
        .filter(|text| !text.trim().is_empty())
        .map(|text| {
            serde_json::from_str(&text)
                .map_err(|err| GatewayError::malformed(format!("geometry is not JSON: {err}")))
        })
        .transpose()
}

fn text(record: &Record, field: &str) -> String {
    record
        .attr(field)
        .and_then(AttrValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn float(record: &Record, field: &str) -> f64 {
    record.attr(field).and_then(AttrValue::as_f64).unwrap_or_default()
}

fn int(record: &Record, field: &str) -> i64 {
    record.attr(field).and_then(AttrValue::as_i64).unwrap_or_default()
}

/// Key and validity columns of a wire row, under the schema's configured names
fn key_columns(
    schema: &RecordSchema,
    natural_key: String,
    objectid: i64,
    start: Option<i64>,
    end: Option<i64>,
) -> RawAttributes {
    let mut raw = RawAttributes::new();
    raw.insert(schema.natural_key.clone(), json!(natural_key));
    raw.insert(schema.surrogate_key.clone(), json!(objectid));
    raw.insert(schema.start_field.clone(), json!(start));
    raw.insert(schema.end_field.clone(), json!(end));
    raw
}

pub fn asset_to_record(schema: &RecordSchema, asset: proto::Asset) -> Result<Record, GatewayError> {
    let attributes = asset.attributes.unwrap_or_default();
    let mut raw = key_columns(
        schema,
        attributes.bridge_id,
        attributes.objectid,
        attributes.start_date,
        attributes.end_date,
    );
    raw.insert("BRIDGE_NAME".to_string(), json!(attributes.bridge_name));
    raw.insert("BRIDGE_NUM".to_string(), json!(attributes.bridge_num));
    raw.insert("LINKID".to_string(), json!(attributes.linkid));
    raw.insert("PROVINCE".to_string(), json!(attributes.province));
    raw.insert("LENGTH".to_string(), json!(attributes.length));
    raw.insert("WIDTH".to_string(), json!(attributes.width));
    raw.insert("SPAN_COUNT".to_string(), json!(attributes.span_count));
    raw.insert("BUILT_YEAR".to_string(), json!(attributes.built_year));
    raw.insert("TOLL".to_string(), json!(attributes.toll));
    let geometry = parse_geometry(asset.geometry)?;
    schema
        .to_record(&raw, geometry.as_ref())
        .map_err(GatewayError::inbound)
}

pub fn record_to_asset(record: &Record) -> proto::Asset {
    proto::Asset {
        attributes: Some(proto::AssetAttributes {
            objectid: record.surrogate_key.map(|key| key.0).unwrap_or_default(),
            bridge_id: record.natural_key.clone(),
            bridge_name: text(record, "BRIDGE_NAME"),
            bridge_num: text(record, "BRIDGE_NUM"),
            linkid: text(record, "LINKID"),
            province: text(record, "PROVINCE"),
            length: float(record, "LENGTH"),
            width: float(record, "WIDTH"),
            span_count: int(record, "SPAN_COUNT"),
            built_year: int(record, "BUILT_YEAR"),
            toll: record.attr("TOLL").and_then(AttrValue::as_bool).unwrap_or_default(),
            start_date: record.window.start,
            end_date: record.window.end,
        }),
        geometry: record.geometry.as_ref().map(|geometry| geometry.0.to_string()),
    }
}

pub fn record_to_route(record: &Record) -> proto::Route {
    proto::Route {
        attributes: Some(proto::RouteAttributes {
            objectid: record.surrogate_key.map(|key| key.0).unwrap_or_default(),
            linkid: record.natural_key.clone(),
            link_name: text(record, "LINK_NAME"),
            province: text(record, "PROVINCE"),
            length_km: float(record, "LENGTH_KM"),
            road_class: text(record, "ROAD_CLASS"),
            fromdate: record.window.start,
            todate: record.window.end,
        }),
        geometry: record.geometry.as_ref().map(|geometry| geometry.0.to_string()),
    }
}

fn edit_results(results: Vec<EditResult>) -> Vec<proto::EditResult> {
    results
        .into_iter()
        .map(|result| proto::EditResult {
            objectid: result.surrogate_key.map(|key| key.0).unwrap_or_default(),
            success: result.success,
            global_id: result.global_id,
            error: result.error,
        })
        .collect()
}

fn assets(records: Vec<Record>) -> Response<proto::Assets> {
    Response::new(proto::Assets {
        assets: records.iter().map(record_to_asset).collect(),
    })
}

/// `AssetMaster` service over the asset gateway
#[derive(Clone)]
pub struct AssetMasterService {
    gateway: Arc<RecordGateway>,
}

impl AssetMasterService {
    pub fn new(gateway: Arc<RecordGateway>) -> Self {
        Self { gateway }
    }

    fn records(&self, request: proto::Assets) -> Result<Vec<Record>, Status> {
        request
            .assets
            .into_iter()
            .map(|asset| asset_to_record(self.gateway.schema(), asset))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| to_status(&err))
    }
}

#[tonic::async_trait]
impl AssetMaster for AssetMasterService {
    async fn health_check(
        &self,
        _request: Request<proto::HealthCheckRequest>,
    ) -> Result<Response<proto::HealthCheckResponse>, Status> {
        Ok(Response::new(proto::HealthCheckResponse {
            status: "OK".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    async fn get_by_key(
        &self,
        request: Request<proto::KeyRequest>,
    ) -> Result<Response<proto::Assets>, Status> {
        let req = request.into_inner();
        self.gateway
            .get_by_key(&req.keys, &req.out_fields)
            .await
            .map(assets)
            .map_err(|err| to_status(&err))
    }

    async fn get_by_name(
        &self,
        request: Request<proto::ValueRequest>,
    ) -> Result<Response<proto::Assets>, Status> {
        let req = request.into_inner();
        self.gateway
            .get_by_attribute("BRIDGE_NAME", &req.values, &req.out_fields)
            .await
            .map(assets)
            .map_err(|err| to_status(&err))
    }

    async fn get_by_number(
        &self,
        request: Request<proto::ValueRequest>,
    ) -> Result<Response<proto::Assets>, Status> {
        let req = request.into_inner();
        self.gateway
            .get_by_attribute("BRIDGE_NUM", &req.values, &req.out_fields)
            .await
            .map(assets)
            .map_err(|err| to_status(&err))
    }

    async fn get_by_spatial_filter(
        &self,
        request: Request<proto::SpatialRequest>,
    ) -> Result<Response<proto::Assets>, Status> {
        let req = request.into_inner();
        self.gateway
            .get_by_region(&req.geojson, &req.crs, &req.out_fields)
            .await
            .map(assets)
            .map_err(|err| to_status(&err))
    }

    async fn get_history(
        &self,
        request: Request<proto::KeyRequest>,
    ) -> Result<Response<proto::Assets>, Status> {
        let req = request.into_inner();
        self.gateway
            .get_history(&req.keys, &req.out_fields)
            .await
            .map(assets)
            .map_err(|err| to_status(&err))
    }

    async fn insert(
        &self,
        request: Request<proto::Assets>,
    ) -> Result<Response<proto::EditResults>, Status> {
        let records = self.records(request.into_inner())?;
        let results = self
            .gateway
            .insert(records)
            .await
            .map_err(|err| to_status(&err))?;
        Ok(Response::new(proto::EditResults {
            add_results: edit_results(results),
            ..Default::default()
        }))
    }

    async fn update(
        &self,
        request: Request<proto::Assets>,
    ) -> Result<Response<proto::EditResults>, Status> {
        let records = self.records(request.into_inner())?;
        let results = self
            .gateway
            .update(records)
            .await
            .map_err(|err| to_status(&err))?;
        Ok(Response::new(proto::EditResults {
            update_results: edit_results(results),
            ..Default::default()
        }))
    }

    async fn delete(
        &self,
        request: Request<proto::SurrogateKeyRequest>,
    ) -> Result<Response<proto::EditResults>, Status> {
        let records: Vec<Record> = request
            .into_inner()
            .objectids
            .into_iter()
            .map(|objectid| Record::default().with_surrogate_key(SurrogateKey(objectid)))
            .collect();
        let results = self
            .gateway
            .delete(records)
            .await
            .map_err(|err| to_status(&err))?;
        Ok(Response::new(proto::EditResults {
            delete_results: edit_results(results),
            ..Default::default()
        }))
    }

    async fn retire(
        &self,
        request: Request<proto::Assets>,
    ) -> Result<Response<proto::EditResults>, Status> {
        let records = self.records(request.into_inner())?;
        let results = self
            .gateway
            .retire(records)
            .await
            .map_err(|err| to_status(&err))?;
        Ok(Response::new(proto::EditResults {
            update_results: edit_results(results),
            ..Default::default()
        }))
    }
}

/// `RoadNetwork` service over the route gateway
#[derive(Clone)]
pub struct RoadNetworkService {
    gateway: Arc<RecordGateway>,
}

impl RoadNetworkService {
    pub fn new(gateway: Arc<RecordGateway>) -> Self {
        Self { gateway }
    }
}

#[tonic::async_trait]
impl RoadNetwork for RoadNetworkService {
    async fn get_by_route_id(
        &self,
        request: Request<proto::KeyRequest>,
    ) -> Result<Response<proto::Routes>, Status> {
        let req = request.into_inner();
        let records = self
            .gateway
            .get_by_key(&req.keys, &req.out_fields)
            .await
            .map_err(|err| to_status(&err))?;
        Ok(Response::new(proto::Routes {
            routes: records.iter().map(record_to_route).collect(),
        }))
    }

    async fn export_routes(
        &self,
        request: Request<proto::ExportRequest>,
    ) -> Result<Response<proto::FilePath>, Status> {
        let req = request.into_inner();
        let path = self
            .gateway
            .export(&req.routes, &req.output_shp)
            .await
            .map_err(|err| to_status(&err))?;
        Ok(Response::new(proto::FilePath { path }))
    }
}

/// Build both services over their gateways.
pub fn create_grpc_services(
    assets: Arc<RecordGateway>,
    routes: Arc<RecordGateway>,
) -> (
    AssetMasterServer<AssetMasterService>,
    RoadNetworkServer<RoadNetworkService>,
) {
    (
        AssetMasterServer::new(AssetMasterService::new(assets)),
        RoadNetworkServer::new(RoadNetworkService::new(routes)),
    )
}

/// Server reflection over both services, so generic clients can discover them.
pub fn reflection_service() -> Result<ServerReflectionServer<impl ServerReflection>> {
    tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|e| anyhow!("Reflection setup error: {}", e))
}

/// Run the gRPC server on the specified address
pub async fn run_grpc_server(
    addr: std::net::SocketAddr,
    assets: Arc<RecordGateway>,
    routes: Arc<RecordGateway>,
) -> Result<()> {
    let (asset_master, road_network) = create_grpc_services(assets, routes);
    let reflection = reflection_service()?;

    tracing::info!(%addr, "geobridge gRPC server listening");

    tonic::transport::Server::builder()
        .add_service(asset_master)
        .add_service(road_network)
        .add_service(reflection)
        .serve(addr)
        .await
        .map_err(|e| anyhow!("Server error: {}", e))?;

    Ok(())
}
