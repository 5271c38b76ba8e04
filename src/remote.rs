//! REST feature service client.
//!
//! Talks to an ArcGIS-style feature layer: `{url}/query` for reads and `{url}/applyEdits`
//! for writes, both as form posts with `f=json`. A query the service truncates at its
//! transfer limit is paged with `resultOffset` until the last page arrives.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::LayerConfig;
use crate::error::{GatewayError, Result};
use crate::model::{EditResult, RawAttributes, RawFeature, SurrogateKey};
use crate::store::{EditBatch, EditOutcomes, FeatureStore, QueryRequest, SpatialFilter, SpatialRelation};

type Params = Vec<(&'static str, String)>;

pub struct HttpFeatureStore {
    name: String,
    base_url: String,
    token: Option<String>,
    out_sr: u32,
    client: reqwest::Client,
}

impl HttpFeatureStore {
    pub fn new(name: impl Into<String>, layer: &LayerConfig) -> Result<Self> {
        let name = name.into();
        let base_url = layer
            .url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
            .ok_or_else(|| GatewayError::malformed(format!("{name}: layer url must be http or https")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(layer.timeout_secs))
            .build()
            .map_err(|err| GatewayError::backend(format!("{name}: cannot build http client: {err}")))?;
        Ok(Self {
            name,
            base_url,
            token: layer.token.clone(),
            out_sr: layer.out_sr,
            client,
        })
    }

    pub fn query_params(&self, request: &QueryRequest) -> Result<Params> {
        let mut params: Params = vec![
            ("f", "json".to_string()),
            ("where", request.predicate.to_where_clause()),
            ("outFields", request.out_fields_param()),
            ("returnGeometry", request.return_geometry.to_string()),
            ("outSR", self.out_sr.to_string()),
        ];
        if let Some(spatial) = &request.spatial {
            params.extend(spatial_params(spatial)?);
        }
        self.push_token(&mut params);
        Ok(params)
    }

    pub fn edit_params(&self, batch: &EditBatch) -> Result<Params> {
        let mut params: Params = vec![
            ("f", "json".to_string()),
            ("rollbackOnFailure", "false".to_string()),
        ];
        if !batch.adds.is_empty() {
            params.push(("adds", encode_features(&batch.adds)?));
        }
        if !batch.updates.is_empty() {
            params.push(("updates", encode_features(&batch.updates)?));
        }
        if !batch.deletes.is_empty() {
            let keys: Vec<String> = batch.deletes.iter().map(|key| key.0.to_string()).collect();
            params.push(("deletes", keys.join(",")));
        }
        self.push_token(&mut params);
        Ok(params)
    }

    fn push_token(&self, params: &mut Params) {
        if let Some(token) = &self.token {
            params.push(("token", token.clone()));
        }
    }

    async fn post(&self, operation: &str, params: &Params) -> Result<Value> {
        let url = format!("{}/{operation}", self.base_url);
        let response = self
            .client
            .post(&url)
            .form(params)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    GatewayError::backend(format!("{} {operation} timed out", self.name))
                } else {
                    GatewayError::backend(format!("{} {operation} failed: {err}", self.name))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::backend(format!(
                "{} {operation} returned HTTP {status}: {body}",
                self.name
            )));
        }
        let body: Value = response.json().await.map_err(|err| {
            GatewayError::backend(format!("{} {operation} sent invalid JSON: {err}", self.name))
        })?;
        check_service_error(&body)?;
        Ok(body)
    }
}

#[async_trait]
impl FeatureStore for HttpFeatureStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, request: QueryRequest) -> Result<Vec<RawFeature>> {
        let mut params = self.query_params(&request)?;
        let mut features = Vec::new();
        loop {
            let body = self.post("query", &params).await?;
            let page = parse_features(&body)?;
            let received = page.features.len();
            features.extend(page.features);
            if !page.exceeded_transfer_limit {
                return Ok(features);
            }
            if received == 0 {
                return Err(GatewayError::backend(format!(
                    "{} query reported more rows but sent an empty page at offset {}",
                    self.name,
                    features.len()
                )));
            }
            tracing::debug!(layer = %self.name, offset = features.len(), "query exceeded transfer limit, paging");
            params.retain(|(key, _)| *key != "resultOffset");
            params.push(("resultOffset", features.len().to_string()));
        }
    }

    async fn apply_edits(&self, batch: EditBatch) -> Result<EditOutcomes> {
        let params = self.edit_params(&batch)?;
        let body = self.post("applyEdits", &params).await?;
        Ok(parse_edit_outcomes(&body))
    }
}

fn spatial_params(spatial: &SpatialFilter) -> Result<Params> {
    let relation = match spatial.relation {
        SpatialRelation::Contains => "esriSpatialRelContains",
    };
    let spatial_reference = json!({ "wkt": spatial.crs });
    Ok(vec![
        ("geometry", geojson_to_rings(&spatial.geometry, &spatial.crs)?.to_string()),
        ("geometryType", "esriGeometryPolygon".to_string()),
        ("spatialRel", relation.to_string()),
        ("inSR", spatial_reference.to_string()),
    ])
}

/// Convert a GeoJSON polygon (or multipolygon) into the service's ring form.
pub fn geojson_to_rings(geometry: &Value, crs: &str) -> Result<Value> {
    if let Some(rings) = geometry.get("rings") {
        return Ok(json!({ "rings": rings, "spatialReference": { "wkt": crs } }));
    }
    let kind = geometry.get("type").and_then(Value::as_str).unwrap_or_default();
    let coordinates = geometry
        .get("coordinates")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::malformed("region geometry has no coordinates"))?;
    let rings: Vec<Value> = match kind {
        "Polygon" => coordinates.clone(),
        "MultiPolygon" => coordinates
            .iter()
            .filter_map(Value::as_array)
            .flatten()
            .cloned()
            .collect(),
        other => {
            return Err(GatewayError::malformed(format!(
                "region must be a Polygon or MultiPolygon, got {other:?}"
            )))
        }
    };
    Ok(json!({ "rings": rings, "spatialReference": { "wkt": crs } }))
}

fn encode_features(features: &[RawFeature]) -> Result<String> {
    serde_json::to_string(features)
        .map_err(|err| GatewayError::backend(format!("cannot encode edit features: {err}")))
}

/// The service reports failures as HTTP 200 with an `error` envelope.
fn check_service_error(body: &Value) -> Result<()> {
    let Some(error) = body.get("error") else {
        return Ok(());
    };
    let code = error.get("code").map(Value::to_string).unwrap_or_default();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    let details: Vec<&str> = error
        .get("details")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    Err(GatewayError::backend(format!(
        "service error {code}: {message} {}",
        details.join("; ")
    )))
}

/// One page of a query response
#[derive(Debug, Clone, PartialEq)]
pub struct FeaturePage {
    pub features: Vec<RawFeature>,
    /// More rows match than the service sent
    pub exceeded_transfer_limit: bool,
}

pub fn parse_features(body: &Value) -> Result<FeaturePage> {
    let features = body
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::backend("query response has no features array"))?;
    let features = features
        .iter()
        .map(|feature| {
            let attributes: RawAttributes = feature
                .get("attributes")
                .and_then(Value::as_object)
                .cloned()
                .ok_or_else(|| GatewayError::backend("feature without attributes"))?;
            let geometry = feature.get("geometry").filter(|g| !g.is_null()).cloned();
            Ok(RawFeature { attributes, geometry })
        })
        .collect::<Result<Vec<_>>>()?;
    let exceeded_transfer_limit = body
        .get("exceededTransferLimit")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(FeaturePage {
        features,
        exceeded_transfer_limit,
    })
}

pub fn parse_edit_outcomes(body: &Value) -> EditOutcomes {
    let results = |field: &str| -> Vec<EditResult> {
        body.get(field)
            .and_then(Value::as_array)
            .map(|items| items.iter().map(parse_edit_result).collect())
            .unwrap_or_default()
    };
    EditOutcomes {
        add_results: results("addResults"),
        update_results: results("updateResults"),
        delete_results: results("deleteResults"),
    }
}

fn parse_edit_result(item: &Value) -> EditResult {
    let key = item
        .get("objectId")
        .and_then(Value::as_i64)
        .map(SurrogateKey);
    let success = item.get("success").and_then(Value::as_bool).unwrap_or(false);
    if success {
        EditResult {
            surrogate_key: key,
            success,
            global_id: item.get("globalId").and_then(Value::as_str).map(str::to_string),
            error: None,
        }
    } else {
        let description = item
            .get("error")
            .and_then(|error| error.get("description"))
            .and_then(Value::as_str)
            .unwrap_or("edit rejected by service");
        EditResult::failed(key, description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::{self, Predicate};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    fn store() -> HttpFeatureStore {
        let layer = LayerConfig {
            url: Some("https://gis.example.org/FeatureServer/0/".to_string()),
            token: Some("secret".to_string()),
            ..LayerConfig::assets()
        };
        HttpFeatureStore::new("assets", &layer).unwrap()
    }

    fn param<'a>(params: &'a Params, name: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    #[test]
    fn test_rejects_non_http_url() {
        let layer = LayerConfig {
            url: Some("ftp://gis".to_string()),
            ..LayerConfig::assets()
        };
        assert!(HttpFeatureStore::new("assets", &layer).is_err());
        assert!(HttpFeatureStore::new("assets", &LayerConfig::assets()).is_err());
    }

    #[test]
    fn test_query_params() {
        let store = store();
        let request = QueryRequest::new(predicate::build(
            Predicate::in_values("BRIDGE_ID", ["A"]),
            "START_DATE",
            "END_DATE",
        ))
        .with_out_fields(Some(vec!["OBJECTID".to_string(), "BRIDGE_ID".to_string()]));
        let params = store.query_params(&request).unwrap();

        assert_eq!(store.base_url, "https://gis.example.org/FeatureServer/0");
        assert_eq!(param(&params, "outFields"), Some("OBJECTID,BRIDGE_ID"));
        assert!(param(&params, "where").unwrap().starts_with("BRIDGE_ID IN ('A') AND "));
        assert_eq!(param(&params, "token"), Some("secret"));
        assert_eq!(param(&params, "geometry"), None);
    }

    #[test]
    fn test_spatial_params() {
        let request = QueryRequest::new(Predicate::True).with_spatial(SpatialFilter {
            geometry: json!({"type": "Polygon", "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 0]]]}),
            crs: "GEOGCS[\"WGS 84\"]".to_string(),
            relation: SpatialRelation::Contains,
        });
        let params = store().query_params(&request).unwrap();

        let geometry: Value = serde_json::from_str(param(&params, "geometry").unwrap()).unwrap();
        assert_eq!(geometry["rings"][0][1], json!([1, 0]));
        assert_eq!(geometry["spatialReference"]["wkt"], json!("GEOGCS[\"WGS 84\"]"));
        assert_eq!(param(&params, "spatialRel"), Some("esriSpatialRelContains"));
    }

    #[test]
    fn test_point_region_is_rejected() {
        let point = json!({"type": "Point", "coordinates": [1, 2]});
        assert!(matches!(
            geojson_to_rings(&point, "x"),
            Err(GatewayError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_edit_params() {
        let mut attributes = RawAttributes::new();
        attributes.insert("BRIDGE_ID".to_string(), json!("BR-1"));
        let batch = EditBatch {
            adds: vec![RawFeature::new(attributes)],
            updates: Vec::new(),
            deletes: vec![SurrogateKey(4), SurrogateKey(9)],
        };
        let params = store().edit_params(&batch).unwrap();

        assert_eq!(param(&params, "adds"), Some(r#"[{"attributes":{"BRIDGE_ID":"BR-1"}}]"#));
        assert_eq!(param(&params, "updates"), None);
        assert_eq!(param(&params, "deletes"), Some("4,9"));
    }

    #[test]
    fn test_parse_features() {
        let body = json!({
            "features": [
                {"attributes": {"OBJECTID": 1, "BRIDGE_ID": "A"}, "geometry": {"x": 1.0, "y": 2.0}},
                {"attributes": {"OBJECTID": 2, "BRIDGE_ID": "B"}}
            ]
        });
        let page = parse_features(&body).unwrap();
        assert_eq!(page.features.len(), 2);
        assert!(page.features[0].geometry.is_some());
        assert!(page.features[1].geometry.is_none());
        assert!(!page.exceeded_transfer_limit);
    }

    #[test]
    fn test_parse_features_reports_truncation() {
        let body = json!({
            "exceededTransferLimit": true,
            "features": [{"attributes": {"OBJECTID": 1, "BRIDGE_ID": "A"}}]
        });
        let page = parse_features(&body).unwrap();
        assert_eq!(page.features.len(), 1);
        assert!(page.exceeded_transfer_limit);
    }

    fn http(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let read = socket.read(&mut chunk).await.unwrap();
            if read == 0 {
                return String::new();
            }
            buf.extend_from_slice(&chunk[..read]);
            let Some(end) = buf.windows(4).position(|window| window == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let body_start = end + 4;
            if buf.len() >= body_start + length {
                return String::from_utf8_lossy(&buf[body_start..body_start + length]).into_owned();
            }
        }
    }

    /// Answer one connection per canned response; yields the request bodies.
    async fn serve(responses: Vec<String>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/FeatureServer/0", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let mut bodies = Vec::new();
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                bodies.push(read_request(&mut socket).await);
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
            bodies
        });
        (url, handle)
    }

    fn local_store(url: String, timeout_secs: u64) -> HttpFeatureStore {
        let layer = LayerConfig {
            url: Some(url),
            timeout_secs,
            ..LayerConfig::assets()
        };
        HttpFeatureStore::new("assets", &layer).unwrap()
    }

    #[tokio::test]
    async fn test_query_pages_past_transfer_limit() {
        let (url, server) = serve(vec![
            http(
                "200 OK",
                r#"{"exceededTransferLimit": true, "features": [{"attributes": {"OBJECTID": 1}}]}"#,
            ),
            http("200 OK", r#"{"features": [{"attributes": {"OBJECTID": 2}}]}"#),
        ])
        .await;

        let features = local_store(url, 5)
            .query(QueryRequest::new(Predicate::True))
            .await
            .unwrap();

        assert_eq!(features.len(), 2);
        assert_eq!(features[1].attributes.get("OBJECTID"), Some(&json!(2)));
        let bodies = server.await.unwrap();
        assert!(!bodies[0].contains("resultOffset"));
        assert!(bodies[1].contains("resultOffset=1"));
    }

    #[tokio::test]
    async fn test_empty_truncated_page_is_backend_error() {
        let (url, _server) = serve(vec![http(
            "200 OK",
            r#"{"exceededTransferLimit": true, "features": []}"#,
        )])
        .await;

        let err = local_store(url, 5)
            .query(QueryRequest::new(Predicate::True))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Backend(_)));
    }

    #[tokio::test]
    async fn test_http_error_is_backend_error() {
        let (url, _server) = serve(vec![http("500 Internal Server Error", "oops")]).await;

        let err = local_store(url, 5)
            .apply_edits(EditBatch::deletes(vec![SurrogateKey(1)]))
            .await
            .unwrap_err();
        assert!(matches!(&err, GatewayError::Backend(message) if message.contains("HTTP 500")));
    }

    #[tokio::test]
    async fn test_silent_service_times_out_as_backend_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/FeatureServer/0", listener.local_addr().unwrap());
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let err = local_store(url, 1)
            .query(QueryRequest::new(Predicate::True))
            .await
            .unwrap_err();
        assert!(matches!(&err, GatewayError::Backend(message) if message.contains("timed out")));
    }

    #[test]
    fn test_service_error_envelope() {
        let body = json!({"error": {"code": 400, "message": "Unable to complete operation.", "details": ["Invalid query"]}});
        let err = check_service_error(&body).unwrap_err();
        assert!(err.to_string().contains("Invalid query"));
        assert!(check_service_error(&json!({"features": []})).is_ok());
    }

    #[test]
    fn test_parse_edit_outcomes() {
        let body = json!({
            "addResults": [{"objectId": 10, "globalId": "{G}", "success": true}],
            "updateResults": [],
            "deleteResults": [{"objectId": 3, "success": false, "error": {"code": 1019, "description": "Object is missing."}}]
        });
        let outcomes = parse_edit_outcomes(&body);
        assert_eq!(
            outcomes.add_results,
            vec![EditResult::succeeded(SurrogateKey(10), Some("{G}".to_string()))]
        );
        assert_eq!(
            outcomes.delete_results,
            vec![EditResult::failed(Some(SurrogateKey(3)), "Object is missing.")]
        );
    }
}
