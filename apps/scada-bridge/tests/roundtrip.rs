//! 端到端往返：一条预测报文进缓存后，三个协议面读到一致的值。

use async_trait::async_trait;
use bridge_control::{ConfigPublisher, ControlError, WriteBackRouter};
use bridge_mapping::MappingTable;
use bridge_protocol::{AttributeTreeServer, RegisterServer};
use bridge_store::ValueStore;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

struct CapturingPublisher {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl ConfigPublisher for CapturingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ControlError> {
        self.messages.lock().await.push((topic.to_string(), payload));
        Ok(())
    }
}

async fn bind_and_spawn<S, F, Fut>(server: S, serve: F) -> std::net::SocketAddr
where
    S: Send + 'static,
    F: FnOnce(S, TcpListener) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        serve(server, listener).await;
    });
    addr
}

#[tokio::test]
async fn one_envelope_serves_both_front_ends_consistently() {
    let store = Arc::new(ValueStore::new(Duration::from_secs(30)));
    let mapping = Arc::new(MappingTable::default_table("config").expect("default table"));
    let publisher = Arc::new(CapturingPublisher {
        messages: Mutex::new(Vec::new()),
    });
    let router = WriteBackRouter::new(mapping.clone(), publisher.clone(), 8);

    // 入站：与消息通道上的报文同构，走同一套解码
    let payload = br#"{
        "agent_id": "pm_agent",
        "timestamp": "2026-08-04T10:00:00Z",
        "prediction": { "health_score": 87.3, "alert_level": "warning" }
    }"#;
    let envelope = bridge_codec::decode(Some("pm_agent"), payload).expect("decoded");
    assert_eq!(store.apply_envelope(&envelope), 2);

    // 属性树读
    let attribute = AttributeTreeServer::new(store.clone(), mapping.clone(), router.clone());
    let attr_addr = bind_and_spawn(attribute, |server, listener| async move {
        let _ = server.serve(listener).await;
    })
    .await;

    let stream = TcpStream::connect(attr_addr).await.expect("connect");
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line =
        serde_json::to_vec(&json!({"op": "read", "path": "PredictiveMaintenance/HealthScore"}))
            .expect("encode");
    line.push(b'\n');
    writer.write_all(&line).await.expect("send");
    let mut response = String::new();
    reader.read_line(&mut response).await.expect("recv");
    let body: Value = serde_json::from_str(&response).expect("json");
    assert_eq!(body["value"], 87.3);
    assert_eq!(body["stale"], false);

    // 寄存器读：health ×10 → 873，alert warning → 1
    let register = RegisterServer::new(store.clone(), mapping.clone(), router, Vec::new());
    let reg_addr = bind_and_spawn(register, |server, listener| async move {
        let _ = server.serve(listener).await;
    })
    .await;

    let mut stream = TcpStream::connect(reg_addr).await.expect("connect");
    let mut request = Vec::new();
    request.extend_from_slice(&1u16.to_be_bytes());
    request.extend_from_slice(&0u16.to_be_bytes());
    request.extend_from_slice(&6u16.to_be_bytes());
    request.push(1);
    request.extend_from_slice(&[0x03, 0x00, 0x01, 0x00, 0x02]);
    stream.write_all(&request).await.expect("send");

    let mut header = [0u8; 7];
    stream.read_exact(&mut header).await.expect("header");
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut body = vec![0u8; length - 1];
    stream.read_exact(&mut body).await.expect("body");
    assert_eq!(body[0], 0x03);
    assert_eq!(body[1], 4);
    let health = i16::from_be_bytes([body[2], body[3]]);
    let alert = i16::from_be_bytes([body[4], body[5]]);
    assert_eq!(health, 873);
    assert_eq!(alert, 1);

    // 纯读路径：没有任何配置消息被发布
    assert!(publisher.messages.lock().await.is_empty());
}
