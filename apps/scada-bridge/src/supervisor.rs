//! 组件生命周期装配。
//!
//! 启动顺序按依赖走：映射表加载校验（失败即拒绝启动）→ 最新值
//! 缓存 → 回写路由 → 接入客户端（任务退出自动重启；掉线重连
//! 由其内部退避处理，永不触发整进程退出）→ 三个协议监听器。
//! 单个监听器绑定失败只判该监听器死亡，其余照常服务。

use bridge_config::AppConfig;
use bridge_control::{MqttPublisher, MqttPublisherConfig, WriteBackRouter};
use bridge_ingest::{MqttIngestClient, MqttIngestConfig, SharedIngestState};
use bridge_mapping::MappingTable;
use bridge_protocol::{
    AttributeTreeServer, BridgeOutstationBackend, OutstationServer, RegisterServer,
};
use bridge_store::ValueStore;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// 各组件健康状态（/health 读取）。
#[derive(Clone, Default)]
pub struct HealthState(Arc<RwLock<HashMap<String, String>>>);

impl HealthState {
    fn set(&self, component: &str, status: &str) {
        if let Ok(mut map) = self.0.write() {
            map.insert(component.to_string(), status.to_string());
        }
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.0.read().map(|map| map.clone()).unwrap_or_default()
    }
}

/// 运行中的桥：持有管理面需要的句柄。
pub struct Supervisor {
    pub store: Arc<ValueStore>,
    pub mapping: Arc<MappingTable>,
    pub ingest_state: SharedIngestState,
    pub health: HealthState,
}

impl Supervisor {
    /// 按依赖顺序启动全部组件。
    ///
    /// 映射表校验失败（地址/路径冲突）返回 Err，进程不得启动。
    pub async fn start(config: &AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        // 1. 映射表：启动期一次性加载与校验
        let mapping = load_mapping(config)?;
        let mapping = Arc::new(mapping);
        info!(
            target: "bridge.supervisor",
            entries = mapping.len(),
            agents = mapping.plan().agents().len(),
            "mapping_table_loaded"
        );

        // 2. 最新值缓存
        let store = Arc::new(ValueStore::new(Duration::from_secs(
            config.staleness_seconds,
        )));

        // 3. 回写路由（独立于 ingest 的 MQTT 连接）
        let (publisher, _eventloop) = MqttPublisher::connect(MqttPublisherConfig {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            keepalive_seconds: config.mqtt_keepalive_seconds,
        })?;
        let router = WriteBackRouter::new(
            mapping.clone(),
            Arc::new(publisher),
            config.writeback_queue_capacity,
        );

        // 4. 接入客户端：任务退出自动重启
        let ingest = Arc::new(MqttIngestClient::new(
            MqttIngestConfig {
                host: config.mqtt_host.clone(),
                port: config.mqtt_port,
                username: config.mqtt_username.clone(),
                password: config.mqtt_password.clone(),
                keepalive_seconds: config.mqtt_keepalive_seconds,
                topic_prefix: config.predictions_topic_prefix.clone(),
                backoff_initial_ms: config.ingest_backoff_initial_ms,
                backoff_max_ms: config.ingest_backoff_max_ms,
                queue_capacity: config.ingest_queue_capacity,
            },
            store.clone(),
        ));
        let ingest_state = ingest.state_handle();
        spawn_ingest(ingest);

        let health = HealthState::default();

        // 5. 协议监听器：各自独立绑定
        let attribute = AttributeTreeServer::new(store.clone(), mapping.clone(), router.clone());
        spawn_listener(
            "attribute",
            listen_addr(config.attribute_port),
            health.clone(),
            move |listener| async move { attribute.serve(listener).await },
        )
        .await;

        let register = RegisterServer::new(
            store.clone(),
            mapping.clone(),
            router.clone(),
            parse_allowlist(&config.register_ip_allowlist),
        );
        spawn_listener(
            "register",
            listen_addr(config.register_port),
            health.clone(),
            move |listener| async move { register.serve(listener).await },
        )
        .await;

        if config.outstation_enabled {
            let backend = Arc::new(BridgeOutstationBackend::new(
                store.clone(),
                mapping.clone(),
            ));
            let outstation = OutstationServer::new(backend);
            spawn_listener(
                "outstation",
                listen_addr(config.outstation_port),
                health.clone(),
                move |listener| async move { outstation.serve(listener).await },
            )
            .await;
        } else {
            info!(target: "bridge.supervisor", "outstation_disabled");
            health.set("outstation", "disabled");
        }

        Ok(Self {
            store,
            mapping,
            ingest_state,
            health,
        })
    }
}

fn load_mapping(config: &AppConfig) -> Result<MappingTable, Box<dyn std::error::Error>> {
    match &config.mapping_overrides_path {
        Some(path) => {
            let overrides = std::fs::read_to_string(path)?;
            Ok(MappingTable::default_table_with_overrides(
                &config.config_topic_prefix,
                &overrides,
            )?)
        }
        None => Ok(MappingTable::default_table(&config.config_topic_prefix)?),
    }
}

fn spawn_ingest(ingest: Arc<MqttIngestClient>) {
    tokio::spawn(async move {
        loop {
            if let Err(err) = ingest.run().await {
                warn!(
                    target: "bridge.supervisor",
                    error = %err,
                    "ingest_exited_restarting"
                );
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}

/// 绑定后交给各协议服务器；绑定失败只标记该监听器死亡。
async fn spawn_listener<F, Fut>(name: &'static str, addr: SocketAddr, health: HealthState, serve: F)
where
    F: FnOnce(TcpListener) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), bridge_protocol::ProtocolError>> + Send + 'static,
{
    match TcpListener::bind(addr).await {
        Ok(listener) => {
            info!(target: "bridge.supervisor", listener = name, %addr, "listener_up");
            health.set(name, "up");
            tokio::spawn(async move {
                if let Err(err) = serve(listener).await {
                    error!(
                        target: "bridge.supervisor",
                        listener = name,
                        error = %err,
                        "listener_failed"
                    );
                    health.set(name, "failed");
                }
            });
        }
        Err(err) => {
            error!(
                target: "bridge.supervisor",
                listener = name,
                %addr,
                error = %err,
                "listener_bind_failed"
            );
            health.set(name, "bind_failed");
        }
    }
}

fn listen_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}

fn parse_allowlist(items: &[String]) -> Vec<IpAddr> {
    items
        .iter()
        .filter_map(|item| match item.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!(
                    target: "bridge.supervisor",
                    entry = %item,
                    "allowlist_entry_invalid"
                );
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_parses_and_skips_garbage() {
        let parsed = parse_allowlist(&[
            "10.0.0.1".to_string(),
            "not-an-ip".to_string(),
            "::1".to_string(),
        ]);
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn health_state_snapshot() {
        let health = HealthState::default();
        health.set("register", "up");
        let snapshot = health.snapshot();
        assert_eq!(snapshot.get("register").map(String::as_str), Some("up"));
    }
}
