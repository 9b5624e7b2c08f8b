//! 数据接入：MQTT 订阅 → 解码 → 最新值缓存。
//!
//! 状态机 `Disconnected → Connecting → Connected → Degraded →
//! Disconnected`，掉线按指数退避重试（封顶），期间缓存继续以
//! 最后值对外服务（由过期标记兜底）。解码失败只跳过当条消息，
//! 永不拆连接。网络接收循环与缓存写入之间隔一条有界队列：
//! 队满丢弃并计数，I/O 节奏不会压到读路径。

use bridge_store::ValueStore;
use bridge_telemetry::{
    record_envelope_received, record_envelope_rejected, record_fields_rejected,
    record_ingest_reconnect, record_queue_dropped, record_values_applied,
};
use domain::Envelope;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// 采集错误。
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("source error: {0}")]
    Source(String),
    #[error("apply channel closed")]
    ChannelClosed,
}

/// 接入链路连接状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

impl IngestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestState::Disconnected => "disconnected",
            IngestState::Connecting => "connecting",
            IngestState::Connected => "connected",
            IngestState::Degraded => "degraded",
        }
    }
}

/// 可跨任务共享的状态句柄（/health 读取）。
#[derive(Clone)]
pub struct SharedIngestState(Arc<AtomicU8>);

impl SharedIngestState {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(0)))
    }

    fn set(&self, state: IngestState) {
        let code = match state {
            IngestState::Disconnected => 0,
            IngestState::Connecting => 1,
            IngestState::Connected => 2,
            IngestState::Degraded => 3,
        };
        self.0.store(code, Ordering::Relaxed);
    }

    pub fn get(&self) -> IngestState {
        match self.0.load(Ordering::Relaxed) {
            1 => IngestState::Connecting,
            2 => IngestState::Connected,
            3 => IngestState::Degraded,
            _ => IngestState::Disconnected,
        }
    }
}

impl Default for SharedIngestState {
    fn default() -> Self {
        Self::new()
    }
}

/// MQTT 接入配置。
#[derive(Debug, Clone)]
pub struct MqttIngestConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive_seconds: u64,
    /// 订阅前缀：`{prefix}/<agent_id>`。
    pub topic_prefix: String,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub queue_capacity: usize,
}

/// MQTT 接入客户端：缓存的唯一 Envelope 写入方。
pub struct MqttIngestClient {
    config: MqttIngestConfig,
    store: Arc<ValueStore>,
    state: SharedIngestState,
}

impl MqttIngestClient {
    pub fn new(config: MqttIngestConfig, store: Arc<ValueStore>) -> Self {
        Self {
            config,
            store,
            state: SharedIngestState::new(),
        }
    }

    pub fn state_handle(&self) -> SharedIngestState {
        self.state.clone()
    }

    /// 运行接收循环。正常情况下不返回；返回 Err 表示应用侧
    /// 队列已关闭，由 Supervisor 重启。
    pub async fn run(&self) -> Result<(), IngestError> {
        let (tx, rx) = mpsc::channel::<Envelope>(self.config.queue_capacity.max(1));
        self.spawn_apply_task(rx);

        let subscribe_topic = format!("{}/#", self.config.topic_prefix.trim_end_matches('/'));
        let mut backoff_ms = self.config.backoff_initial_ms.max(1);

        loop {
            self.state.set(IngestState::Connecting);
            let client_id = format!("bridge-ingest-{}", uuid::Uuid::new_v4());
            let mut options =
                rumqttc::MqttOptions::new(client_id, self.config.host.clone(), self.config.port);
            options.set_keep_alive(Duration::from_secs(self.config.keepalive_seconds.max(5)));
            if let (Some(username), Some(password)) =
                (self.config.username.as_ref(), self.config.password.as_ref())
            {
                options.set_credentials(username, password);
            }
            let (client, mut eventloop) = rumqttc::AsyncClient::new(options, 10);

            loop {
                match eventloop.poll().await {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                        self.state.set(IngestState::Connected);
                        backoff_ms = self.config.backoff_initial_ms.max(1);
                        info!(
                            target: "bridge.ingest",
                            host = %self.config.host,
                            port = self.config.port,
                            topic = %subscribe_topic,
                            "ingest_connected"
                        );
                        if let Err(err) = client
                            .subscribe(subscribe_topic.clone(), rumqttc::QoS::AtMostOnce)
                            .await
                        {
                            warn!(target: "bridge.ingest", error = %err, "subscribe_failed");
                        }
                    }
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                        self.handle_publish(&tx, &publish.topic, &publish.payload)?;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        self.state.set(IngestState::Degraded);
                        record_ingest_reconnect();
                        warn!(
                            target: "bridge.ingest",
                            error = %err,
                            retry_in_ms = backoff_ms,
                            "ingest_connection_lost"
                        );
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = next_backoff(backoff_ms, self.config.backoff_max_ms);
                        break;
                    }
                }
            }

            self.state.set(IngestState::Disconnected);
        }
    }

    fn handle_publish(
        &self,
        tx: &mpsc::Sender<Envelope>,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), IngestError> {
        record_envelope_received();
        let topic_agent = extract_agent(&self.config.topic_prefix, topic);
        match bridge_codec::decode(topic_agent.as_deref(), payload) {
            Ok(envelope) => {
                if !envelope.skipped.is_empty() {
                    record_fields_rejected(envelope.skipped.len() as u64);
                    warn!(
                        target: "bridge.ingest",
                        agent_id = %envelope.agent_id,
                        skipped = ?envelope.skipped,
                        "envelope_fields_skipped"
                    );
                }
                match tx.try_send(envelope) {
                    Ok(()) => {}
                    Err(TrySendError::Full(envelope)) => {
                        record_queue_dropped();
                        warn!(
                            target: "bridge.ingest",
                            agent_id = %envelope.agent_id,
                            "ingest_queue_full"
                        );
                    }
                    Err(TrySendError::Closed(_)) => return Err(IngestError::ChannelClosed),
                }
            }
            Err(err) => {
                record_envelope_rejected();
                warn!(
                    target: "bridge.ingest",
                    topic = %topic,
                    error = %err,
                    "envelope_decode_failed"
                );
            }
        }
        Ok(())
    }

    fn spawn_apply_task(&self, mut rx: mpsc::Receiver<Envelope>) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let applied = store.apply_envelope(&envelope);
                record_values_applied(applied as u64);
                debug!(
                    target: "bridge.ingest",
                    agent_id = %envelope.agent_id,
                    applied = applied,
                    timestamp = ?envelope.timestamp,
                    "envelope_applied"
                );
            }
        });
    }
}

/// 指数退避：倍增并封顶。
fn next_backoff(current_ms: u64, max_ms: u64) -> u64 {
    current_ms.saturating_mul(2).min(max_ms.max(1))
}

/// 从主题推出 agent id：`predictions/pm_agent` → `pm_agent`。
fn extract_agent(prefix: &str, topic: &str) -> Option<String> {
    let prefix = prefix.trim_matches('/');
    let topic = topic.trim_matches('/');
    let rest = if prefix.is_empty() {
        topic
    } else {
        topic.strip_prefix(prefix)?
    };
    let rest = rest.trim_start_matches('/');
    let agent = rest.split('/').next()?;
    if agent.is_empty() {
        return None;
    }
    Some(agent.to_string())
}
