use async_trait::async_trait;
use bridge_control::{ConfigPublisher, ControlError, WriteBackRouter};
use bridge_mapping::MappingTable;
use domain::{FieldValue, ValueKey, WriteOrigin, WriteRequest};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

struct CapturingPublisher {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
    delay: Duration,
    in_flight: AtomicUsize,
    overlapped: AtomicUsize,
}

impl CapturingPublisher {
    fn new(delay: Duration) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            delay,
            in_flight: AtomicUsize::new(0),
            overlapped: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ConfigPublisher for CapturingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ControlError> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.fetch_add(1, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.messages.lock().await.push((topic.to_string(), payload));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn write_request(agent: &str, field: &str, value: FieldValue) -> WriteRequest {
    WriteRequest {
        key: ValueKey::new(agent, field),
        value,
        origin: WriteOrigin::AttributeTree,
    }
}

fn mapping() -> Arc<MappingTable> {
    Arc::new(MappingTable::default_table("config").expect("default table"))
}

#[tokio::test]
async fn accepted_write_publishes_exactly_one_message() {
    let publisher = Arc::new(CapturingPublisher::new(Duration::ZERO));
    let router = WriteBackRouter::new(mapping(), publisher.clone(), 8);

    router
        .submit(write_request(
            "pm_agent",
            "threshold_critical",
            FieldValue::F64(15.0),
        ))
        .await
        .expect("published");

    let messages = publisher.messages.lock().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, "config/pm_agent");
    let body: serde_json::Value = serde_json::from_slice(&messages[0].1).expect("json");
    assert_eq!(body, serde_json::json!({"threshold_critical": 15.0}));
}

#[tokio::test]
async fn non_writable_key_publishes_nothing() {
    let publisher = Arc::new(CapturingPublisher::new(Duration::ZERO));
    let router = WriteBackRouter::new(mapping(), publisher.clone(), 8);

    let err = router
        .submit(write_request(
            "pm_agent",
            "health_score",
            FieldValue::F64(1.0),
        ))
        .await
        .expect_err("not writable");
    assert!(matches!(err, ControlError::NotWritable(_)));

    let err = router
        .submit(write_request("pm_agent", "no_such_field", FieldValue::I64(1)))
        .await
        .expect_err("unmapped");
    assert!(matches!(err, ControlError::Unmapped(_)));

    assert!(publisher.messages.lock().await.is_empty());
}

#[tokio::test]
async fn concurrent_writes_serialize_without_interleaving() {
    let publisher = Arc::new(CapturingPublisher::new(Duration::from_millis(10)));
    let router = WriteBackRouter::new(mapping(), publisher.clone(), 8);

    let mut handles = Vec::new();
    for index in 0..5 {
        let router = router.clone();
        handles.push(tokio::spawn(async move {
            let field = if index % 2 == 0 {
                "threshold_critical"
            } else {
                "threshold_warning"
            };
            router
                .submit(write_request("pm_agent", field, FieldValue::F64(index as f64)))
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("published");
    }

    assert_eq!(publisher.messages.lock().await.len(), 5);
    assert_eq!(publisher.overlapped.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn requester_cancellation_does_not_cancel_accepted_write() {
    let publisher = Arc::new(CapturingPublisher::new(Duration::from_millis(80)));
    let router = WriteBackRouter::new(mapping(), publisher.clone(), 8);

    let submit_router = router.clone();
    let handle = tokio::spawn(async move {
        submit_router
            .submit(write_request(
                "pm_agent",
                "threshold_warning",
                FieldValue::F64(42.0),
            ))
            .await
    });

    // 请求已入队、发布进行中时掐断发起方
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.abort();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let messages = publisher.messages.lock().await;
    assert_eq!(messages.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&messages[0].1).expect("json");
    assert_eq!(body, serde_json::json!({"threshold_warning": 42.0}));
}
