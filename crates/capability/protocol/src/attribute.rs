//! 属性树服务器
//!
//! 层级命名空间：根文件夹下每个 agent 一个域文件夹，节点带类型与
//! 可写标记；另有合成的 SystemStatus 域（读取时派生）。会话协议为
//! 每行一条 JSON 请求/应答：
//!
//! ```json
//! {"op": "browse", "path": "MultiAgentSystem/PredictiveMaintenance"}
//! {"op": "read",   "path": "PredictiveMaintenance/HealthScore"}
//! {"op": "write",  "path": "PredictiveMaintenance/ThresholdCritical", "value": 15.0}
//! ```
//!
//! 读取一律现查缓存（带过期标记）；写入校验通过后交回写路由，
//! 节点显示值不做乐观回显，等新 Envelope 进来才变。

use crate::error::ProtocolError;
use bridge_control::WriteBackRouter;
use bridge_mapping::{Encoding, MappingTable};
use bridge_store::ValueStore;
use bridge_telemetry::{
    record_attribute_read, record_attribute_write, record_stale_read,
    record_write_request_accepted, record_write_request_rejected,
};
use domain::{FieldValue, WriteOrigin, WriteRequest};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

/// 命名空间根文件夹名。
pub const ROOT_FOLDER: &str = "MultiAgentSystem";

/// 合成状态域文件夹名。
const SYSTEM_FOLDER: &str = "SystemStatus";

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum AttributeRequest {
    Browse {
        #[serde(default)]
        path: Option<String>,
    },
    Read {
        path: String,
    },
    Write {
        path: String,
        value: Value,
    },
}

struct SessionContext {
    store: Arc<ValueStore>,
    mapping: Arc<MappingTable>,
    router: WriteBackRouter,
}

/// 属性树服务器。
pub struct AttributeTreeServer {
    ctx: Arc<SessionContext>,
}

impl AttributeTreeServer {
    pub fn new(
        store: Arc<ValueStore>,
        mapping: Arc<MappingTable>,
        router: WriteBackRouter,
    ) -> Self {
        Self {
            ctx: Arc::new(SessionContext {
                store,
                mapping,
                router,
            }),
        }
    }

    /// 绑定端口并运行（绑定失败对本监听器致命）。
    pub async fn run(&self, addr: SocketAddr) -> Result<(), ProtocolError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| ProtocolError::Bind(err.to_string()))?;
        info!(target: "bridge.protocol", %addr, "attribute_server_listening");
        self.serve(listener).await
    }

    /// 在已绑定的监听器上服务（测试从这里进）。
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProtocolError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                if let Err(err) = handle_session(ctx, stream).await {
                    warn!(target: "bridge.protocol", peer = %peer, error = %err, "attribute_session_error");
                }
            });
        }
    }
}

/// 单会话循环：会话之间无共享可变状态，互不干扰。
async fn handle_session(ctx: Arc<SessionContext>, stream: TcpStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break;
        }
        let data = line.trim();
        if data.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<AttributeRequest>(data) {
            Ok(request) => dispatch(&ctx, request).await,
            Err(err) => json!({ "ok": false, "error": format!("invalid request: {}", err) }),
        };

        let mut out = serde_json::to_vec(&response)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        out.push(b'\n');
        write_half.write_all(&out).await?;
    }
    Ok(())
}

async fn dispatch(ctx: &SessionContext, request: AttributeRequest) -> Value {
    match request {
        AttributeRequest::Browse { path } => browse(ctx, path.as_deref()),
        AttributeRequest::Read { path } => read_node(ctx, &path),
        AttributeRequest::Write { path, value } => write_node(ctx, &path, value).await,
    }
}

fn browse(ctx: &SessionContext, path: Option<&str>) -> Value {
    let normalized = normalize_path(path.unwrap_or(""));

    if normalized.is_empty() {
        let mut nodes: Vec<Value> = ctx
            .mapping
            .domains()
            .iter()
            .map(|(domain, _)| json!({ "name": domain, "kind": "folder" }))
            .collect();
        nodes.push(json!({ "name": SYSTEM_FOLDER, "kind": "folder" }));
        return json!({ "ok": true, "root": ROOT_FOLDER, "nodes": nodes });
    }

    if normalized == SYSTEM_FOLDER {
        let nodes = vec![
            json!({ "name": "OverallHealth", "kind": "float", "writable": false }),
            json!({ "name": "ActiveAgents", "kind": "int", "writable": false }),
            json!({ "name": "TotalAlerts", "kind": "int", "writable": false }),
        ];
        return json!({ "ok": true, "nodes": nodes });
    }

    let entries = ctx.mapping.entries_in_domain(&normalized);
    if entries.is_empty() {
        return json!({ "ok": false, "error": format!("unknown path: {}", normalized) });
    }
    let nodes: Vec<Value> = entries
        .iter()
        .filter_map(|entry| {
            let path = entry.node_path.as_deref()?;
            let name = path.split_once('/').map(|(_, name)| name)?;
            Some(json!({
                "name": name,
                "kind": node_kind(&entry.encoding),
                "writable": entry.writable,
            }))
        })
        .collect();
    json!({ "ok": true, "nodes": nodes })
}

fn read_node(ctx: &SessionContext, path: &str) -> Value {
    let normalized = normalize_path(path);
    record_attribute_read();

    if let Some(name) = normalized.strip_prefix(&format!("{}/", SYSTEM_FOLDER)) {
        let status = crate::status::system_status(&ctx.store, &ctx.mapping);
        let value = match name {
            "OverallHealth" => json!(status.overall_health),
            "ActiveAgents" => json!(status.active_agents),
            "TotalAlerts" => json!(status.total_alerts),
            _ => return json!({ "ok": false, "error": format!("unknown node: {}", normalized) }),
        };
        let kind = if name == "OverallHealth" { "float" } else { "int" };
        return json!({ "ok": true, "value": value, "kind": kind, "stale": false });
    }

    let Some(entry) = ctx.mapping.by_path(&normalized) else {
        return json!({ "ok": false, "error": format!("unknown node: {}", normalized) });
    };

    let (value, stale) = match ctx.store.read(&entry.key()) {
        Some(reading) => (reading.value, reading.stale),
        // 首条 Envelope 之前用映射默认值，按过期呈现
        None => (entry.default.clone(), true),
    };
    if stale {
        record_stale_read();
    }
    json!({
        "ok": true,
        "value": field_value_to_json(&value),
        "kind": node_kind(&entry.encoding),
        "stale": stale,
    })
}

async fn write_node(ctx: &SessionContext, path: &str, value: Value) -> Value {
    let normalized = normalize_path(path);
    let Some(entry) = ctx.mapping.by_path(&normalized) else {
        record_write_request_rejected();
        return json!({ "ok": false, "error": format!("unknown node: {}", normalized) });
    };

    let Some(proposed) = field_value_from_json(&value, &entry.encoding) else {
        record_write_request_rejected();
        return json!({
            "ok": false,
            "error": format!("invalid value type for {}", normalized),
        });
    };

    if let Err(err) = entry.validate_write(&proposed) {
        record_write_request_rejected();
        return json!({ "ok": false, "error": err.to_string() });
    }

    let request = WriteRequest {
        key: entry.key(),
        value: proposed,
        origin: WriteOrigin::AttributeTree,
    };
    match ctx.router.submit(request).await {
        Ok(()) => {
            record_write_request_accepted();
            record_attribute_write();
            json!({ "ok": true })
        }
        Err(err) => {
            record_write_request_rejected();
            json!({ "ok": false, "error": err.to_string() })
        }
    }
}

/// 去掉根前缀与多余斜杠：`MultiAgentSystem/X/Y` → `X/Y`。
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed == ROOT_FOLDER {
        return String::new();
    }
    match trimmed.strip_prefix(&format!("{}/", ROOT_FOLDER)) {
        Some(rest) => rest.to_string(),
        None => trimmed.to_string(),
    }
}

fn node_kind(encoding: &Encoding) -> &'static str {
    match encoding {
        Encoding::Scaled { .. } => "float",
        Encoding::Level { .. } => "string",
        Encoding::Flag => "bool",
        Encoding::Count => "int",
        Encoding::Text => "string",
    }
}

fn field_value_to_json(value: &FieldValue) -> Value {
    match value {
        FieldValue::I64(v) => json!(v),
        FieldValue::F64(v) => json!(v),
        FieldValue::Bool(v) => json!(v),
        FieldValue::String(v) => json!(v),
    }
}

/// JSON 写入值 → 编码规则期望的原始值；类型不符返回 None。
fn field_value_from_json(value: &Value, encoding: &Encoding) -> Option<FieldValue> {
    match encoding {
        Encoding::Scaled { .. } => value.as_f64().map(FieldValue::F64),
        Encoding::Count => value.as_i64().map(FieldValue::I64),
        Encoding::Flag => value.as_bool().map(FieldValue::Bool),
        Encoding::Level { .. } | Encoding::Text => {
            value.as_str().map(|label| FieldValue::String(label.to_string()))
        }
    }
}
