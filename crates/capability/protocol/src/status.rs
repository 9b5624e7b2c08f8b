//! 系统状态汇总（派生值，不单独接入）。
//!
//! 属性树的 `SystemStatus/*` 与寄存器系统块（500-599）共用这里的
//! 计算：读取时现算，不维护影子副本。

use bridge_mapping::{Encoding, MappingTable};
use bridge_store::ValueStore;
use domain::FieldValue;

/// 一次读取时刻的系统状态快照。
#[derive(Debug, Clone, Copy)]
pub struct SystemStatus {
    /// 整体健康度：pm 健康分与作业安全分的均值。
    pub overall_health: f64,
    /// 持有未过期值的 agent 数。
    pub active_agents: i64,
    /// 当前处于最高严重级的枚举字段数。
    pub total_alerts: i64,
    /// 0 = operational，1 = degraded，2 = error。
    pub state: i64,
}

/// 计算当前系统状态。
pub fn system_status(store: &ValueStore, mapping: &MappingTable) -> SystemStatus {
    let mut health_parts = Vec::new();
    if let Some(score) = numeric_value(store, mapping, "pm_agent", "health_score") {
        health_parts.push(score);
    }
    if let Some(score) = numeric_value(store, mapping, "hazard_agent", "safety_score") {
        health_parts.push(score);
    }
    let overall_health = if health_parts.is_empty() {
        0.0
    } else {
        health_parts.iter().sum::<f64>() / health_parts.len() as f64
    };

    let total_alerts = mapping
        .entries()
        .filter(|entry| severity_maxed(store, entry))
        .count() as i64;

    let state = if overall_health >= 50.0 {
        0
    } else if overall_health >= 25.0 {
        1
    } else {
        2
    };

    SystemStatus {
        overall_health,
        active_agents: store.active_agents() as i64,
        total_alerts,
        state,
    }
}

/// 当前原始数值：缓存值优先，未出现过用映射默认值。
fn numeric_value(
    store: &ValueStore,
    mapping: &MappingTable,
    agent_id: &str,
    field: &str,
) -> Option<f64> {
    let entry = mapping.get(agent_id, field)?;
    match store.read(&entry.key()) {
        Some(reading) => reading.value.as_f64(),
        None => entry.default.as_f64(),
    }
}

/// 枚举字段是否处于表内最高严重级。
fn severity_maxed(store: &ValueStore, entry: &bridge_mapping::MappingEntry) -> bool {
    let Encoding::Level { labels } = &entry.encoding else {
        return false;
    };
    let Some(top) = labels.last() else {
        return false;
    };
    let current = match store.read(&entry.key()) {
        Some(reading) => reading.value,
        None => entry.default.clone(),
    };
    match current {
        FieldValue::String(label) => label.to_ascii_lowercase() == *top,
        _ => false,
    }
}
