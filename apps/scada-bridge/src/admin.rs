//! 管理面端点。
//!
//! - GET /health：各组件状态（ingest 连接态、监听器、缓存规模）
//! - GET /metrics：telemetry 计数快照

use crate::supervisor::{HealthState, Supervisor};
use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};
use bridge_ingest::SharedIngestState;
use bridge_store::ValueStore;
use bridge_telemetry::metrics;
use std::sync::Arc;

#[derive(Clone)]
pub struct AdminState {
    health: HealthState,
    ingest: SharedIngestState,
    store: Arc<ValueStore>,
}

impl AdminState {
    pub fn from_supervisor(supervisor: &Supervisor) -> Self {
        Self {
            health: supervisor.health.clone(),
            ingest: supervisor.ingest_state.clone(),
            store: supervisor.store.clone(),
        }
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "ingest": state.ingest.get().as_str(),
        "listeners": state.health.snapshot(),
        "cached_values": state.store.len(),
    }))
}

async fn get_metrics() -> impl IntoResponse {
    let snapshot = metrics().snapshot();
    Json(serde_json::json!({
        "envelopes_received": snapshot.envelopes_received,
        "envelopes_rejected": snapshot.envelopes_rejected,
        "fields_rejected": snapshot.fields_rejected,
        "values_applied": snapshot.values_applied,
        "ingest_reconnects": snapshot.ingest_reconnects,
        "queue_dropped": snapshot.queue_dropped,
        "stale_reads": snapshot.stale_reads,
        "register_reads": snapshot.register_reads,
        "register_writes": snapshot.register_writes,
        "attribute_reads": snapshot.attribute_reads,
        "attribute_writes": snapshot.attribute_writes,
        "encode_clamped": snapshot.encode_clamped,
        "write_requests_accepted": snapshot.write_requests_accepted,
        "write_requests_rejected": snapshot.write_requests_rejected,
        "write_back_published": snapshot.write_back_published,
        "write_back_failed": snapshot.write_back_failed,
    }))
}
