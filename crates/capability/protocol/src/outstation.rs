//! 外站桩（第三协议前端）
//!
//! 只读点表 + 最小会话握手，用来钉住扩展接缝：完整协议栈落地时
//! 替换会话层即可，数据通路（映射表 + 最新值缓存）不变。不支持
//! 写入，也不接回写路由。
//!
//! 会话协议（按行）：
//!
//! ```text
//! -> LINK station-7
//! <- LINK OK
//! -> READ ANALOG 1
//! <- ANALOG 1 87.3
//! -> READ BINARY 0
//! <- BINARY 0 1
//! -> SCAN
//! <- ANALOG 0 120.5
//! <- ...
//! <- SCAN END
//! ```

use crate::error::ProtocolError;
use bridge_mapping::{Encoding, MappingTable};
use bridge_store::ValueStore;
use domain::{FieldValue, ValueKey};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

/// 外站数据源接缝：完整协议实现替换会话框架、复用这里的取值。
pub trait OutstationBackend: Send + Sync {
    fn analog(&self, index: u16) -> Option<f64>;
    fn binary(&self, index: u16) -> Option<bool>;
    /// 完整性轮询：全部模拟量与状态量点。
    fn integrity(&self) -> (Vec<(u16, f64)>, Vec<(u16, bool)>);
}

/// 状态量点的取值谓词。
enum BinaryPredicate {
    /// 枚举字段处于表内最高严重级。
    LevelAtMax(ValueKey),
    /// 计数字段大于零。
    PositiveCount(ValueKey),
}

/// 以映射表 + 最新值缓存为数据源的默认后端。
pub struct BridgeOutstationBackend {
    store: Arc<ValueStore>,
    mapping: Arc<MappingTable>,
    analog_points: Vec<(u16, ValueKey)>,
    binary_points: Vec<(u16, BinaryPredicate)>,
}

impl BridgeOutstationBackend {
    /// 构建默认点表（寄存器/属性数据的只读子集）。
    /// 映射表里不存在的字段直接剔除并告警。
    pub fn new(store: Arc<ValueStore>, mapping: Arc<MappingTable>) -> Self {
        let analog_candidates = [
            (0u16, ("pm_agent", "rul_hours")),
            (1, ("pm_agent", "health_score")),
            (2, ("energy_agent", "consumption_kwh")),
            (3, ("energy_agent", "efficiency_score")),
            (4, ("cyber_agent", "anomaly_score")),
            (5, ("hazard_agent", "safety_score")),
            (6, ("ppe_agent", "compliance_rate")),
        ];
        let binary_candidates = [
            (0u16, ("pm_agent", "alert_level"), true),
            (1, ("cyber_agent", "active_threats"), false),
            (2, ("hazard_agent", "hazard_count"), false),
            (3, ("ppe_agent", "violations_count"), false),
        ];

        let mut analog_points = Vec::new();
        for (index, (agent, field)) in analog_candidates {
            if mapping.get(agent, field).is_some() {
                analog_points.push((index, ValueKey::new(agent, field)));
            } else {
                warn!(target: "bridge.protocol", agent, field, "outstation_point_unmapped");
            }
        }

        let mut binary_points = Vec::new();
        for (index, (agent, field), level_based) in binary_candidates {
            if mapping.get(agent, field).is_none() {
                warn!(target: "bridge.protocol", agent, field, "outstation_point_unmapped");
                continue;
            }
            let key = ValueKey::new(agent, field);
            let predicate = if level_based {
                BinaryPredicate::LevelAtMax(key)
            } else {
                BinaryPredicate::PositiveCount(key)
            };
            binary_points.push((index, predicate));
        }

        Self {
            store,
            mapping,
            analog_points,
            binary_points,
        }
    }

    fn current_value(&self, key: &ValueKey) -> Option<FieldValue> {
        match self.store.read(key) {
            Some(reading) => Some(reading.value),
            None => self.mapping.by_key(key).map(|entry| entry.default.clone()),
        }
    }

    fn evaluate(&self, predicate: &BinaryPredicate) -> Option<bool> {
        match predicate {
            BinaryPredicate::LevelAtMax(key) => {
                let entry = self.mapping.by_key(key)?;
                let Encoding::Level { labels } = &entry.encoding else {
                    return None;
                };
                let top = labels.last()?;
                match self.current_value(key)? {
                    FieldValue::String(label) => Some(label.to_ascii_lowercase() == *top),
                    _ => Some(false),
                }
            }
            BinaryPredicate::PositiveCount(key) => {
                let value = self.current_value(key)?;
                Some(value.as_f64().unwrap_or(0.0) > 0.0)
            }
        }
    }
}

impl OutstationBackend for BridgeOutstationBackend {
    fn analog(&self, index: u16) -> Option<f64> {
        let (_, key) = self.analog_points.iter().find(|(i, _)| *i == index)?;
        self.current_value(key)?.as_f64()
    }

    fn binary(&self, index: u16) -> Option<bool> {
        let (_, predicate) = self.binary_points.iter().find(|(i, _)| *i == index)?;
        self.evaluate(predicate)
    }

    fn integrity(&self) -> (Vec<(u16, f64)>, Vec<(u16, bool)>) {
        let analogs = self
            .analog_points
            .iter()
            .filter_map(|(index, key)| {
                self.current_value(key)
                    .and_then(|value| value.as_f64())
                    .map(|value| (*index, value))
            })
            .collect();
        let binaries = self
            .binary_points
            .iter()
            .filter_map(|(index, predicate)| {
                self.evaluate(predicate).map(|value| (*index, value))
            })
            .collect();
        (analogs, binaries)
    }
}

/// 外站桩服务器。
pub struct OutstationServer {
    backend: Arc<dyn OutstationBackend>,
}

impl OutstationServer {
    pub fn new(backend: Arc<dyn OutstationBackend>) -> Self {
        Self { backend }
    }

    /// 绑定端口并运行（绑定失败对本监听器致命）。
    pub async fn run(&self, addr: SocketAddr) -> Result<(), ProtocolError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| ProtocolError::Bind(err.to_string()))?;
        info!(target: "bridge.protocol", %addr, "outstation_listening");
        self.serve(listener).await
    }

    /// 在已绑定的监听器上服务。
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProtocolError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let backend = Arc::clone(&self.backend);
            tokio::spawn(async move {
                if let Err(err) = handle_session(backend, stream).await {
                    warn!(target: "bridge.protocol", peer = %peer, error = %err, "outstation_session_error");
                }
            });
        }
    }
}

async fn handle_session(
    backend: Arc<dyn OutstationBackend>,
    stream: TcpStream,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let mut linked = false;

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break;
        }
        let command = line.trim();
        if command.is_empty() {
            continue;
        }

        let reply = if !linked {
            if command.starts_with("LINK") {
                linked = true;
                "LINK OK".to_string()
            } else {
                "ERR not linked".to_string()
            }
        } else {
            respond(backend.as_ref(), command)
        };
        write_half.write_all(reply.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }
    Ok(())
}

fn respond(backend: &dyn OutstationBackend, command: &str) -> String {
    let parts: Vec<&str> = command.split_whitespace().collect();
    match parts.as_slice() {
        ["READ", "ANALOG", index] => match index.parse::<u16>().ok().and_then(|i| {
            backend.analog(i).map(|value| (i, value))
        }) {
            Some((index, value)) => format!("ANALOG {} {}", index, value),
            None => "ERR unknown point".to_string(),
        },
        ["READ", "BINARY", index] => match index.parse::<u16>().ok().and_then(|i| {
            backend.binary(i).map(|value| (i, value))
        }) {
            Some((index, value)) => format!("BINARY {} {}", index, u8::from(value)),
            None => "ERR unknown point".to_string(),
        },
        ["SCAN"] => {
            let (analogs, binaries) = backend.integrity();
            let mut lines = Vec::with_capacity(analogs.len() + binaries.len() + 1);
            for (index, value) in analogs {
                lines.push(format!("ANALOG {} {}", index, value));
            }
            for (index, value) in binaries {
                lines.push(format!("BINARY {} {}", index, u8::from(value)));
            }
            lines.push("SCAN END".to_string());
            lines.join("\n")
        }
        // 只读前端：写入形态的命令一律拒绝
        _ => "ERR unsupported".to_string(),
    }
}
