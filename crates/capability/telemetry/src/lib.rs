//! 追踪初始化与桥内指标计数。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 基础指标快照。
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub envelopes_received: u64,
    pub envelopes_rejected: u64,
    pub fields_rejected: u64,
    pub values_applied: u64,
    pub ingest_reconnects: u64,
    pub queue_dropped: u64,
    pub stale_reads: u64,
    pub register_reads: u64,
    pub register_writes: u64,
    pub attribute_reads: u64,
    pub attribute_writes: u64,
    pub encode_clamped: u64,
    pub write_requests_accepted: u64,
    pub write_requests_rejected: u64,
    pub write_back_published: u64,
    pub write_back_failed: u64,
}

/// 基础指标。
pub struct TelemetryMetrics {
    envelopes_received: AtomicU64,
    envelopes_rejected: AtomicU64,
    fields_rejected: AtomicU64,
    values_applied: AtomicU64,
    ingest_reconnects: AtomicU64,
    queue_dropped: AtomicU64,
    stale_reads: AtomicU64,
    register_reads: AtomicU64,
    register_writes: AtomicU64,
    attribute_reads: AtomicU64,
    attribute_writes: AtomicU64,
    encode_clamped: AtomicU64,
    write_requests_accepted: AtomicU64,
    write_requests_rejected: AtomicU64,
    write_back_published: AtomicU64,
    write_back_failed: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            envelopes_received: AtomicU64::new(0),
            envelopes_rejected: AtomicU64::new(0),
            fields_rejected: AtomicU64::new(0),
            values_applied: AtomicU64::new(0),
            ingest_reconnects: AtomicU64::new(0),
            queue_dropped: AtomicU64::new(0),
            stale_reads: AtomicU64::new(0),
            register_reads: AtomicU64::new(0),
            register_writes: AtomicU64::new(0),
            attribute_reads: AtomicU64::new(0),
            attribute_writes: AtomicU64::new(0),
            encode_clamped: AtomicU64::new(0),
            write_requests_accepted: AtomicU64::new(0),
            write_requests_rejected: AtomicU64::new(0),
            write_back_published: AtomicU64::new(0),
            write_back_failed: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            envelopes_received: self.envelopes_received.load(Ordering::Relaxed),
            envelopes_rejected: self.envelopes_rejected.load(Ordering::Relaxed),
            fields_rejected: self.fields_rejected.load(Ordering::Relaxed),
            values_applied: self.values_applied.load(Ordering::Relaxed),
            ingest_reconnects: self.ingest_reconnects.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            stale_reads: self.stale_reads.load(Ordering::Relaxed),
            register_reads: self.register_reads.load(Ordering::Relaxed),
            register_writes: self.register_writes.load(Ordering::Relaxed),
            attribute_reads: self.attribute_reads.load(Ordering::Relaxed),
            attribute_writes: self.attribute_writes.load(Ordering::Relaxed),
            encode_clamped: self.encode_clamped.load(Ordering::Relaxed),
            write_requests_accepted: self.write_requests_accepted.load(Ordering::Relaxed),
            write_requests_rejected: self.write_requests_rejected.load(Ordering::Relaxed),
            write_back_published: self.write_back_published.load(Ordering::Relaxed),
            write_back_failed: self.write_back_failed.load(Ordering::Relaxed),
        }
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 记录 Envelope 接收次数。
pub fn record_envelope_received() {
    metrics().envelopes_received.fetch_add(1, Ordering::Relaxed);
}

/// 记录整条 Envelope 解码失败次数。
pub fn record_envelope_rejected() {
    metrics().envelopes_rejected.fetch_add(1, Ordering::Relaxed);
}

/// 记录字段级丢弃次数（非标量等）。
pub fn record_fields_rejected(count: u64) {
    metrics().fields_rejected.fetch_add(count, Ordering::Relaxed);
}

/// 记录写入缓存的字段值次数。
pub fn record_values_applied(count: u64) {
    metrics().values_applied.fetch_add(count, Ordering::Relaxed);
}

/// 记录 ingest 重连次数。
pub fn record_ingest_reconnect() {
    metrics().ingest_reconnects.fetch_add(1, Ordering::Relaxed);
}

/// 记录有界队列满导致的丢弃次数（背压可观测）。
pub fn record_queue_dropped() {
    metrics().queue_dropped.fetch_add(1, Ordering::Relaxed);
}

/// 记录被标记为过期的读取次数。
pub fn record_stale_read() {
    metrics().stale_reads.fetch_add(1, Ordering::Relaxed);
}

/// 记录寄存器读次数。
pub fn record_register_read() {
    metrics().register_reads.fetch_add(1, Ordering::Relaxed);
}

/// 记录寄存器写次数。
pub fn record_register_write() {
    metrics().register_writes.fetch_add(1, Ordering::Relaxed);
}

/// 记录属性树读次数。
pub fn record_attribute_read() {
    metrics().attribute_reads.fetch_add(1, Ordering::Relaxed);
}

/// 记录属性树写次数。
pub fn record_attribute_write() {
    metrics().attribute_writes.fetch_add(1, Ordering::Relaxed);
}

/// 记录编码越界钳制次数。
pub fn record_encode_clamped() {
    metrics().encode_clamped.fetch_add(1, Ordering::Relaxed);
}

/// 记录被路由接受的写请求次数。
pub fn record_write_request_accepted() {
    metrics()
        .write_requests_accepted
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录在协议边界被拒绝的写请求次数。
pub fn record_write_request_rejected() {
    metrics()
        .write_requests_rejected
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录配置消息发布成功次数。
pub fn record_write_back_published() {
    metrics()
        .write_back_published
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录配置消息发布失败次数。
pub fn record_write_back_failed() {
    metrics().write_back_failed.fetch_add(1, Ordering::Relaxed);
}
