//! 最新值缓存。
//!
//! 按 (agent, field) 保存每个字段的最新值。写入走分片 map 的
//! 按 key 原子替换，单个 agent 的更新不会卡住其它 key 的读取；
//! 过期与否在读取时计算，不跑后台清扫线程。
//!
//! 不变式：同一 key 只保留到达序号最高的条目，最新值以到达
//! 顺序为准，不看生产方自报时间。条目建立后不删除，停止上报的
//! 生产方留下最后值，由过期标记兜底。

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use domain::{Envelope, FieldValue, ValueKey};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// 缓存内单条记录。
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub value: FieldValue,
    /// 到达序号（缓存分配，单调递增）。
    pub seq: u64,
    /// 到达时刻（毫秒时间戳）。
    pub updated_at_ms: i64,
}

/// 一次读取结果（`stale` 为读取时刻计算）。
#[derive(Debug, Clone)]
pub struct ValueReading {
    pub value: FieldValue,
    pub seq: u64,
    pub updated_at_ms: i64,
    pub stale: bool,
}

/// 最新值缓存。
pub struct ValueStore {
    entries: DashMap<ValueKey, StoredValue>,
    seq: AtomicU64,
    staleness_ms: i64,
}

impl ValueStore {
    /// 创建缓存，`staleness` 为过期判定窗口。
    pub fn new(staleness: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            seq: AtomicU64::new(0),
            staleness_ms: staleness.as_millis() as i64,
        }
    }

    /// 写入一个字段值，返回分配的到达序号。
    ///
    /// 并发写同一 key 时只有序号更高的一方留下。
    pub fn update(&self, key: ValueKey, value: FieldValue) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let record = StoredValue {
            value,
            seq,
            updated_at_ms: now_epoch_ms(),
        };
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if seq > occupied.get().seq {
                    occupied.insert(record);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record);
            }
        }
        seq
    }

    /// 应用一条 Envelope 的全部字段，返回写入条数。
    pub fn apply_envelope(&self, envelope: &Envelope) -> usize {
        let mut applied = 0;
        for (field, value) in &envelope.fields {
            self.update(
                ValueKey::new(envelope.agent_id.clone(), field.clone()),
                value.clone(),
            );
            applied += 1;
        }
        applied
    }

    /// 读取一个字段的最新值；key 未出现过返回 None。
    pub fn read(&self, key: &ValueKey) -> Option<ValueReading> {
        let entry = self.entries.get(key)?;
        let age_ms = now_epoch_ms().saturating_sub(entry.updated_at_ms);
        Some(ValueReading {
            value: entry.value.clone(),
            seq: entry.seq,
            updated_at_ms: entry.updated_at_ms,
            stale: age_ms > self.staleness_ms,
        })
    }

    /// 当前出现过的 agent 去重列表。
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .map(|entry| entry.key().agent_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// 至少持有一个未过期值的 agent 数（SystemStatus 用）。
    pub fn active_agents(&self) -> usize {
        let now = now_epoch_ms();
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| now.saturating_sub(entry.updated_at_ms) <= self.staleness_ms)
            .map(|entry| entry.key().agent_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }

    /// 缓存条目数（用于测试与 /health）。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 获取当前时间戳（毫秒）
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
