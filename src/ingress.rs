//! Asynchronous ingress.
//!
//! Messages arrive as JSON `{pid, method, feature}`; each is handled on its own task and the
//! outcome is published on the channel named by `pid`. Failures are published too, as
//! `{"error": {"code", "message"}}`, so a caller waiting on its channel always gets an answer.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::error::{GatewayError, PublicError, Result};
use crate::gateway::RecordGateway;
use crate::model::{EditResult, RawAttributes, Record};

/// Operations accepted on the queue, matched case-insensitively
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressMethod {
    GetOid,
    Get,
    Insert,
    Update,
    Retire,
    Delete,
}

impl FromStr for IngressMethod {
    type Err = GatewayError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "get_oid" => Ok(IngressMethod::GetOid),
            "get" => Ok(IngressMethod::Get),
            "insert" => Ok(IngressMethod::Insert),
            "update" => Ok(IngressMethod::Update),
            "retire" => Ok(IngressMethod::Retire),
            "delete" => Ok(IngressMethod::Delete),
            other => Err(GatewayError::malformed(format!("unsupported method {other:?}"))),
        }
    }
}

/// A published response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Published {
    pub channel: String,
    pub payload: Value,
}

/// Delivers a response on a caller's channel.
#[async_trait]
pub trait ResponsePublisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: Value) -> Result<()>;
}

/// In-process publisher backed by a tokio channel.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<Published>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Published>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ResponsePublisher for ChannelPublisher {
    async fn publish(&self, channel: &str, payload: Value) -> Result<()> {
        self.tx
            .send(Published {
                channel: channel.to_string(),
                payload,
            })
            .await
            .map_err(|_| GatewayError::backend("response channel closed"))
    }
}

pub struct IngressDispatcher {
    gateway: Arc<RecordGateway>,
    publisher: Arc<dyn ResponsePublisher>,
}

impl IngressDispatcher {
    pub fn new(gateway: Arc<RecordGateway>, publisher: Arc<dyn ResponsePublisher>) -> Self {
        Self { gateway, publisher }
    }

    /// Consume raw message bodies until the sender side closes, one task per message.
    ///
    /// Returns once every in-flight message has been answered.
    pub async fn run(self: Arc<Self>, mut messages: mpsc::Receiver<Vec<u8>>) {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(body) => {
                        let dispatcher = Arc::clone(&self);
                        in_flight.spawn(async move { dispatcher.handle_logged(&body).await });
                    }
                    None => break,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join(joined);
                }
            }
        }
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }
        tracing::info!("ingress stream closed");
    }

    pub fn spawn(self: &Arc<Self>, body: Vec<u8>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.handle_logged(&body).await })
    }

    async fn handle_logged(&self, body: &[u8]) {
        if let Err(err) = self.handle(body).await {
            tracing::warn!(error = %err, "ingress message dropped");
        }
    }

    /// Handle one message and publish its outcome.
    ///
    /// Errors only when nothing could be published: the body has no `pid` or the publisher
    /// failed.
    pub async fn handle(&self, body: &[u8]) -> Result<()> {
        let message: Value = serde_json::from_slice(body)
            .map_err(|err| GatewayError::malformed(format!("ingress body is not JSON: {err}")))?;
        let channel = channel_of(&message)
            .ok_or_else(|| GatewayError::malformed("ingress message has no pid"))?;

        let payload = match self.dispatch(&message).await {
            Ok(payload) => payload,
            Err(err) => json!({ "error": PublicError::from_gateway(&err) }),
        };
        tracing::debug!(channel = %channel, "publishing ingress response");
        self.publisher.publish(&channel, payload).await
    }

    async fn dispatch(&self, message: &Value) -> Result<Value> {
        let method: IngressMethod = message
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::malformed("ingress message has no method"))?
            .parse()?;
        let feature = message
            .get("feature")
            .filter(|feature| feature.is_object())
            .ok_or_else(|| GatewayError::malformed("ingress message has no feature object"))?;
        let schema = self.gateway.schema();

        match method {
            IngressMethod::GetOid => {
                let natural_key = self.natural_key_of(feature)?;
                let keys = self.gateway.active_surrogate_keys(&natural_key).await?;
                Ok(json!({ "objectids": keys.iter().map(|key| key.0).collect::<Vec<_>>() }))
            }
            IngressMethod::Get => {
                let natural_key = self.natural_key_of(feature)?;
                let records = self.gateway.get_by_key(&[natural_key], &[]).await?;
                let features: Vec<Value> = records
                    .iter()
                    .map(|record| {
                        json!({
                            "attributes": schema.to_attributes(record),
                            "geometry": record.geometry.as_ref().map(|g| g.0.clone()),
                        })
                    })
                    .collect();
                Ok(json!({ "features": features }))
            }
            IngressMethod::Insert => {
                let record = self.record_of(feature)?;
                Ok(edit_payload(self.gateway.insert(vec![record]).await?))
            }
            IngressMethod::Update => {
                let record = self.record_of(feature)?;
                Ok(edit_payload(self.gateway.update(vec![record]).await?))
            }
            IngressMethod::Retire => {
                let record = self.record_of(feature)?;
                Ok(edit_payload(self.gateway.retire(vec![record]).await?))
            }
            IngressMethod::Delete => {
                let record = self.record_of(feature)?;
                Ok(edit_payload(self.gateway.delete(vec![record]).await?))
            }
        }
    }

    fn natural_key_of(&self, feature: &Value) -> Result<String> {
        let record = self.record_of(feature)?;
        if record.natural_key.trim().is_empty() {
            return Err(GatewayError::malformed(format!(
                "feature has no {}",
                self.gateway.schema().natural_key
            )));
        }
        Ok(record.natural_key)
    }

    /// Accept `{attributes, geometry}` or a flat attribute object.
    fn record_of(&self, feature: &Value) -> Result<Record> {
        let empty = RawAttributes::new();
        let (attributes, geometry) = match feature.get("attributes").and_then(Value::as_object) {
            Some(attributes) => (attributes, feature.get("geometry")),
            None => (feature.as_object().unwrap_or(&empty), None),
        };
        self.gateway
            .schema()
            .to_record(attributes, geometry)
            .map_err(GatewayError::inbound)
    }
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(err) = joined {
        tracing::error!(error = %err, "ingress task failed");
    }
}

fn channel_of(message: &Value) -> Option<String> {
    match message.get("pid")? {
        Value::String(pid) if !pid.is_empty() => Some(pid.clone()),
        Value::Number(pid) => Some(pid.to_string()),
        _ => None,
    }
}

fn edit_payload(results: Vec<EditResult>) -> Value {
    let results: Vec<Value> = results
        .iter()
        .map(|result| {
            json!({
                "objectid": result.surrogate_key.map(|key| key.0),
                "success": result.success,
                "global_id": result.global_id,
                "error": result.error,
            })
        })
        .collect();
    json!({ "results": results })
}
