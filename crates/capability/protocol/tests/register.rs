use async_trait::async_trait;
use bridge_control::{ConfigPublisher, ControlError, WriteBackRouter};
use bridge_mapping::MappingTable;
use bridge_protocol::RegisterServer;
use bridge_store::ValueStore;
use domain::{FieldValue, ValueKey};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
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

struct Harness {
    store: Arc<ValueStore>,
    publisher: Arc<CapturingPublisher>,
    stream: TcpStream,
}

async fn start_with_allowlist(allowlist: Vec<IpAddr>) -> Harness {
    let store = Arc::new(ValueStore::new(Duration::from_secs(30)));
    let mapping = Arc::new(MappingTable::default_table("config").expect("default table"));
    let publisher = Arc::new(CapturingPublisher {
        messages: Mutex::new(Vec::new()),
    });
    let router = WriteBackRouter::new(mapping.clone(), publisher.clone(), 8);
    let server = RegisterServer::new(store.clone(), mapping, router, allowlist);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    let stream = TcpStream::connect(addr).await.expect("connect");
    Harness {
        store,
        publisher,
        stream,
    }
}

async fn start() -> Harness {
    start_with_allowlist(Vec::new()).await
}

/// MBAP 帧：tid + 协议 0 + 长度 + unit 1 + PDU。
fn frame(transaction_id: u16, pdu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + pdu.len());
    out.extend_from_slice(&transaction_id.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    out.push(1);
    out.extend_from_slice(pdu);
    out
}

fn read_request(address: u16, quantity: u16) -> Vec<u8> {
    let mut pdu = vec![0x03];
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    pdu
}

fn write_request(address: u16, value: u16) -> Vec<u8> {
    let mut pdu = vec![0x06];
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

impl Harness {
    async fn exchange(&mut self, transaction_id: u16, pdu: &[u8]) -> Vec<u8> {
        self.stream
            .write_all(&frame(transaction_id, pdu))
            .await
            .expect("send");
        let mut header = [0u8; 7];
        self.stream.read_exact(&mut header).await.expect("header");
        assert_eq!(
            u16::from_be_bytes([header[0], header[1]]),
            transaction_id,
            "transaction id echoed"
        );
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut body = vec![0u8; length - 1];
        self.stream.read_exact(&mut body).await.expect("body");
        body
    }

    async fn read_registers(&mut self, address: u16, quantity: u16) -> Vec<i16> {
        let body = self.exchange(7, &read_request(address, quantity)).await;
        assert_eq!(body[0], 0x03);
        let count = body[1] as usize;
        assert_eq!(count, quantity as usize * 2);
        body[2..2 + count]
            .chunks(2)
            .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
            .collect()
    }
}

#[tokio::test]
async fn read_computes_scaled_value_on_demand() {
    let mut harness = start().await;
    harness.store.update(
        ValueKey::new("pm_agent", "health_score"),
        FieldValue::F64(87.3),
    );

    let values = harness.read_registers(1, 1).await;
    assert_eq!(values, vec![873]);
}

#[tokio::test]
async fn read_maps_enum_labels_through_table() {
    let mut harness = start().await;
    harness.store.update(
        ValueKey::new("pm_agent", "alert_level"),
        FieldValue::String("warning".to_string()),
    );

    let values = harness.read_registers(2, 1).await;
    assert_eq!(values, vec![1]);
}

#[tokio::test]
async fn unknown_enum_label_reads_sentinel() {
    let mut harness = start().await;
    harness.store.update(
        ValueKey::new("pm_agent", "alert_level"),
        FieldValue::String("mystery".to_string()),
    );

    let values = harness.read_registers(2, 1).await;
    assert_eq!(values, vec![-1]);
}

#[tokio::test]
async fn read_spans_block_with_defaults_and_zeros() {
    let mut harness = start().await;
    harness.store.update(
        ValueKey::new("pm_agent", "rul_hours"),
        FieldValue::F64(120.7),
    );

    // 0: rul ×1，1: health 默认 0，2: alert 默认 normal=0，3: 概率默认 0，4: 空槽
    let values = harness.read_registers(0, 5).await;
    assert_eq!(values, vec![120, 0, 0, 0, 0]);
}

#[tokio::test]
async fn read_clamps_overflowing_scaled_value() {
    let mut harness = start().await;
    harness.store.update(
        ValueKey::new("pm_agent", "health_score"),
        FieldValue::F64(99999.0),
    );

    let values = harness.read_registers(1, 1).await;
    assert_eq!(values, vec![32767]);
}

#[tokio::test]
async fn read_outside_address_space_is_exception() {
    let mut harness = start().await;
    let body = harness.exchange(9, &read_request(590, 20)).await;
    assert_eq!(body, vec![0x83, 0x02]);
}

#[tokio::test]
async fn system_block_reports_derived_status() {
    let mut harness = start().await;
    harness.store.update(
        ValueKey::new("pm_agent", "health_score"),
        FieldValue::F64(80.0),
    );
    harness.store.update(
        ValueKey::new("hazard_agent", "safety_score"),
        FieldValue::F64(60.0),
    );
    harness.store.update(
        ValueKey::new("pm_agent", "alert_level"),
        FieldValue::String("critical".to_string()),
    );

    let values = harness.read_registers(500, 4).await;
    // 健康 70，两个活跃 agent，一个最高级告警字段，状态 operational
    assert_eq!(values, vec![70, 2, 1, 0]);
}

#[tokio::test]
async fn write_to_writable_register_publishes_raw_value() {
    let mut harness = start().await;
    let body = harness.exchange(11, &write_request(10, 150)).await;
    assert_eq!(body, write_request(10, 150));

    let messages = harness.publisher.messages.lock().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, "config/pm_agent");
    let payload: Value = serde_json::from_slice(&messages[0].1).expect("payload");
    // 逆缩放后的原始值：150 / 10 = 15.0
    assert_eq!(payload, serde_json::json!({"threshold_critical": 15.0}));
}

#[tokio::test]
async fn write_to_read_only_register_is_exception() {
    let mut harness = start().await;
    let body = harness.exchange(13, &write_request(1, 500)).await;
    assert_eq!(body, vec![0x86, 0x02]);
    assert!(harness.publisher.messages.lock().await.is_empty());
}

#[tokio::test]
async fn write_to_unmapped_register_is_exception() {
    let mut harness = start().await;
    let body = harness.exchange(15, &write_request(50, 1)).await;
    assert_eq!(body, vec![0x86, 0x02]);
    assert!(harness.publisher.messages.lock().await.is_empty());
}

#[tokio::test]
async fn write_out_of_range_is_exception() {
    let mut harness = start().await;
    // 2000 → 200.0，超出 threshold_critical 的 0-100 范围
    let body = harness.exchange(17, &write_request(10, 2000)).await;
    assert_eq!(body, vec![0x86, 0x03]);
    assert!(harness.publisher.messages.lock().await.is_empty());
}

#[tokio::test]
async fn unsupported_function_code_is_exception() {
    let mut harness = start().await;
    let body = harness.exchange(19, &[0x10, 0, 0, 0, 1, 2, 0, 0]).await;
    assert_eq!(body, vec![0x90, 0x01]);
}

#[tokio::test]
async fn allowlist_rejects_connection_before_any_access() {
    let mut harness =
        start_with_allowlist(vec!["10.9.9.9".parse().expect("ip")]).await;

    // 服务器在 accept 时已丢弃连接；读端只会看到 EOF
    let _ = harness.stream.write_all(&frame(21, &read_request(0, 1))).await;
    let mut buffer = [0u8; 8];
    let read = harness.stream.read(&mut buffer).await.unwrap_or(0);
    assert_eq!(read, 0);
    assert!(harness.publisher.messages.lock().await.is_empty());
}
