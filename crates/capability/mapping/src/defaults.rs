//! 出厂默认映射表。
//!
//! 字段集合与编码倍率沿用五个预测 agent 的约定：
//! 浮点惯用 ×10，概率类 ×100，`rul_hours` 量纲大保持 ×1。

use crate::{BlockPlan, Encoding, MappingEntry};
use domain::FieldValue;

/// 默认块分配：五个 agent 按固定顺序各占 100 槽。
pub fn default_plan() -> BlockPlan {
    BlockPlan::new(vec![
        "pm_agent".to_string(),
        "energy_agent".to_string(),
        "cyber_agent".to_string(),
        "hazard_agent".to_string(),
        "ppe_agent".to_string(),
    ])
}

fn entry(
    agent_id: &str,
    field: &str,
    node_path: Option<&str>,
    register: Option<u16>,
    encoding: Encoding,
    default: FieldValue,
) -> MappingEntry {
    MappingEntry {
        agent_id: agent_id.to_string(),
        field: field.to_string(),
        node_path: node_path.map(str::to_string),
        register,
        encoding,
        valid_range: None,
        writable: false,
        config_topic: None,
        default,
    }
}

fn writable_entry(
    agent_id: &str,
    field: &str,
    node_path: Option<&str>,
    register: Option<u16>,
    encoding: Encoding,
    valid_range: (f64, f64),
    config_prefix: &str,
    default: FieldValue,
) -> MappingEntry {
    let mut item = entry(agent_id, field, node_path, register, encoding, default);
    item.valid_range = Some(valid_range);
    item.writable = true;
    item.config_topic = Some(format!(
        "{}/{}",
        config_prefix.trim_end_matches('/'),
        agent_id
    ));
    item
}

fn levels(labels: &[&str]) -> Encoding {
    Encoding::Level {
        labels: labels.iter().map(|label| label.to_string()).collect(),
    }
}

/// 出厂默认条目集合。
pub fn default_entries(config_prefix: &str) -> Vec<MappingEntry> {
    vec![
        // pm_agent：预测性维护（块 0-99）
        entry(
            "pm_agent",
            "rul_hours",
            Some("PredictiveMaintenance/RemainingUsefulLife"),
            Some(0),
            Encoding::Scaled { factor: 1 },
            FieldValue::F64(0.0),
        ),
        entry(
            "pm_agent",
            "health_score",
            Some("PredictiveMaintenance/HealthScore"),
            Some(1),
            Encoding::Scaled { factor: 10 },
            FieldValue::F64(0.0),
        ),
        entry(
            "pm_agent",
            "alert_level",
            Some("PredictiveMaintenance/AlertLevel"),
            Some(2),
            levels(&["normal", "warning", "critical"]),
            FieldValue::String("normal".to_string()),
        ),
        entry(
            "pm_agent",
            "failure_probability",
            Some("PredictiveMaintenance/FailureProbability"),
            Some(3),
            Encoding::Scaled { factor: 100 },
            FieldValue::F64(0.0),
        ),
        entry(
            "pm_agent",
            "recommended_action",
            Some("PredictiveMaintenance/RecommendedAction"),
            None,
            Encoding::Text,
            FieldValue::String("No action required".to_string()),
        ),
        writable_entry(
            "pm_agent",
            "threshold_critical",
            Some("PredictiveMaintenance/ThresholdCritical"),
            Some(10),
            Encoding::Scaled { factor: 10 },
            (0.0, 100.0),
            config_prefix,
            FieldValue::F64(20.0),
        ),
        writable_entry(
            "pm_agent",
            "threshold_warning",
            Some("PredictiveMaintenance/ThresholdWarning"),
            Some(11),
            Encoding::Scaled { factor: 10 },
            (0.0, 100.0),
            config_prefix,
            FieldValue::F64(50.0),
        ),
        // energy_agent：能耗优化（块 100-199）
        entry(
            "energy_agent",
            "consumption_kwh",
            Some("EnergyOptimization/ConsumptionKWh"),
            Some(100),
            Encoding::Scaled { factor: 10 },
            FieldValue::F64(0.0),
        ),
        entry(
            "energy_agent",
            "efficiency_score",
            Some("EnergyOptimization/EfficiencyScore"),
            Some(101),
            Encoding::Scaled { factor: 10 },
            FieldValue::F64(0.0),
        ),
        entry(
            "energy_agent",
            "predicted_consumption",
            Some("EnergyOptimization/PredictedConsumption"),
            Some(102),
            Encoding::Scaled { factor: 10 },
            FieldValue::F64(0.0),
        ),
        entry(
            "energy_agent",
            "is_anomaly",
            Some("EnergyOptimization/IsAnomaly"),
            Some(103),
            Encoding::Flag,
            FieldValue::Bool(false),
        ),
        entry(
            "energy_agent",
            "anomaly_score",
            Some("EnergyOptimization/AnomalyScore"),
            Some(104),
            Encoding::Scaled { factor: 10 },
            FieldValue::F64(0.0),
        ),
        // cyber_agent：网络安全（块 200-299）
        entry(
            "cyber_agent",
            "threat_level",
            Some("CyberSecurity/ThreatLevel"),
            Some(200),
            levels(&["low", "medium", "high", "critical"]),
            FieldValue::String("low".to_string()),
        ),
        entry(
            "cyber_agent",
            "anomaly_score",
            Some("CyberSecurity/AnomalyScore"),
            Some(201),
            Encoding::Scaled { factor: 10 },
            FieldValue::F64(0.0),
        ),
        entry(
            "cyber_agent",
            "active_threats",
            Some("CyberSecurity/ActiveThreats"),
            Some(202),
            Encoding::Count,
            FieldValue::I64(0),
        ),
        entry(
            "cyber_agent",
            "network_health",
            Some("CyberSecurity/NetworkHealth"),
            Some(203),
            Encoding::Scaled { factor: 10 },
            FieldValue::F64(100.0),
        ),
        // hazard_agent：作业安全（块 300-399）
        entry(
            "hazard_agent",
            "risk_level",
            Some("WorkplaceSafety/RiskLevel"),
            Some(300),
            levels(&["low", "medium", "high"]),
            FieldValue::String("low".to_string()),
        ),
        entry(
            "hazard_agent",
            "hazard_count",
            Some("WorkplaceSafety/HazardCount"),
            Some(301),
            Encoding::Count,
            FieldValue::I64(0),
        ),
        entry(
            "hazard_agent",
            "safety_score",
            Some("WorkplaceSafety/SafetyScore"),
            Some(302),
            Encoding::Scaled { factor: 10 },
            FieldValue::F64(100.0),
        ),
        entry(
            "hazard_agent",
            "active_warnings",
            Some("WorkplaceSafety/ActiveWarnings"),
            Some(303),
            Encoding::Count,
            FieldValue::I64(0),
        ),
        // ppe_agent：PPE 合规（块 400-499）
        entry(
            "ppe_agent",
            "compliance_rate",
            Some("PPECompliance/ComplianceRate"),
            Some(400),
            Encoding::Scaled { factor: 10 },
            FieldValue::F64(100.0),
        ),
        entry(
            "ppe_agent",
            "violations_count",
            Some("PPECompliance/ViolationsCount"),
            Some(401),
            Encoding::Count,
            FieldValue::I64(0),
        ),
        entry(
            "ppe_agent",
            "workers_monitored",
            Some("PPECompliance/WorkersMonitored"),
            Some(402),
            Encoding::Count,
            FieldValue::I64(0),
        ),
        entry(
            "ppe_agent",
            "helmet_compliance",
            Some("PPECompliance/HelmetCompliance"),
            Some(403),
            Encoding::Scaled { factor: 10 },
            FieldValue::F64(100.0),
        ),
        entry(
            "ppe_agent",
            "vest_compliance",
            Some("PPECompliance/VestCompliance"),
            Some(404),
            Encoding::Scaled { factor: 10 },
            FieldValue::F64(100.0),
        ),
    ]
}
