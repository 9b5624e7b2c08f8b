//! 回写链路：协议前端的写请求 → 配置消息发布。
//!
//! 路由任务逐条消费写请求：同一时刻只发一条配置消息，两个可写
//! 前端并发写相近字段也不会交错出半条报文；每个被接受的请求
//! 恰好发布一条消息。请求一旦入队即承诺发布，发起方断线只会
//! 丢掉回执，不会撤销发布。"发布成功" 即成功判据，不等 agent
//! 侧确认。

use async_trait::async_trait;
use bridge_mapping::MappingTable;
use bridge_telemetry::{record_write_back_failed, record_write_back_published};
use domain::{FieldValue, WriteRequest};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// 回写链路错误。
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("unmapped key: {0}")]
    Unmapped(String),
    #[error("key not writable: {0}")]
    NotWritable(String),
    #[error("publish error: {0}")]
    Publish(String),
    #[error("payload error: {0}")]
    Payload(String),
    #[error("router closed")]
    RouterClosed,
}

/// 配置消息发布器抽象。
#[async_trait]
pub trait ConfigPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ControlError>;
}

/// 空发布器（用于接线与测试）。
#[derive(Debug, Default)]
pub struct NoopPublisher;

#[async_trait]
impl ConfigPublisher for NoopPublisher {
    async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), ControlError> {
        Ok(())
    }
}

/// MQTT 发布器配置。
#[derive(Debug, Clone)]
pub struct MqttPublisherConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive_seconds: u64,
}

/// MQTT 发布器实现（配置消息走与 ingest 独立的连接）。
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn connect(
        config: MqttPublisherConfig,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), ControlError> {
        let client_id = format!("bridge-writeback-{}", uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_seconds.max(5)));
        if let (Some(username), Some(password)) = (config.username, config.password) {
            options.set_credentials(username, password);
        }
        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let handle = tokio::spawn(async move {
            loop {
                if let Err(err) = eventloop.poll().await {
                    warn!(target: "bridge.control", "mqtt writeback eventloop error: {}", err);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });
        Ok((Self { client }, handle))
    }
}

#[async_trait]
impl ConfigPublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ControlError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| ControlError::Publish(err.to_string()))
    }
}

struct RouterJob {
    request: WriteRequest,
    ack: oneshot::Sender<Result<(), ControlError>>,
}

/// 写回路由：串行化写请求并发布配置消息。
#[derive(Clone)]
pub struct WriteBackRouter {
    tx: mpsc::Sender<RouterJob>,
}

impl WriteBackRouter {
    /// 创建路由并启动消费任务。
    pub fn new(
        mapping: Arc<MappingTable>,
        publisher: Arc<dyn ConfigPublisher>,
        queue_capacity: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<RouterJob>(queue_capacity.max(1));
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = process(&mapping, publisher.as_ref(), &job.request).await;
                // 发起方可能已断线；回执丢失不影响已完成的发布
                let _ = job.ack.send(result);
            }
        });
        Self { tx }
    }

    /// 提交写请求。入队即被接受；返回 Ok 表示配置消息已交给
    /// 发布通道。
    pub async fn submit(&self, request: WriteRequest) -> Result<(), ControlError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(RouterJob {
                request,
                ack: ack_tx,
            })
            .await
            .map_err(|_| ControlError::RouterClosed)?;
        ack_rx.await.map_err(|_| ControlError::RouterClosed)?
    }
}

async fn process(
    mapping: &MappingTable,
    publisher: &dyn ConfigPublisher,
    request: &WriteRequest,
) -> Result<(), ControlError> {
    let entry = mapping
        .by_key(&request.key)
        .ok_or_else(|| ControlError::Unmapped(request.key.to_string()))?;
    if !entry.writable {
        return Err(ControlError::NotWritable(request.key.to_string()));
    }
    let topic = entry
        .config_topic
        .as_deref()
        .ok_or_else(|| ControlError::NotWritable(request.key.to_string()))?;

    let payload = config_payload(&request.key.field, &request.value)?;
    match publisher.publish(topic, payload).await {
        Ok(()) => {
            record_write_back_published();
            info!(
                target: "bridge.control",
                key = %request.key,
                value = %request.value,
                origin = request.origin.as_str(),
                topic = %topic,
                "write_back_published"
            );
            Ok(())
        }
        Err(err) => {
            record_write_back_failed();
            warn!(
                target: "bridge.control",
                key = %request.key,
                origin = request.origin.as_str(),
                error = %err,
                "write_back_failed"
            );
            Err(err)
        }
    }
}

/// 出站配置报文：`{"<field>": <原始值>}`，与被接受的写请求一致。
fn config_payload(field: &str, value: &FieldValue) -> Result<Vec<u8>, ControlError> {
    let value = match value {
        FieldValue::I64(v) => serde_json::Value::from(*v),
        FieldValue::F64(v) => serde_json::Value::from(*v),
        FieldValue::Bool(v) => serde_json::Value::from(*v),
        FieldValue::String(v) => serde_json::Value::from(v.clone()),
    };
    let body = serde_json::json!({ field: value });
    serde_json::to_vec(&body).map_err(|err| ControlError::Payload(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_payload_carries_raw_value() {
        let payload =
            config_payload("threshold_critical", &FieldValue::F64(15.0)).expect("payload");
        let body: serde_json::Value = serde_json::from_slice(&payload).expect("json");
        assert_eq!(body["threshold_critical"], 15.0);
    }

    #[test]
    fn config_payload_keeps_label_strings() {
        let payload =
            config_payload("mode", &FieldValue::String("eco".to_string())).expect("payload");
        let body: serde_json::Value = serde_json::from_slice(&payload).expect("json");
        assert_eq!(body["mode"], "eco");
    }
}
