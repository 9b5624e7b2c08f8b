//! 预测 Envelope 编解码。
//!
//! 入站报文形如：
//!
//! ```json
//! { "agent_id": "pm_agent", "timestamp": "2026-01-01T00:00:00Z",
//!   "prediction": { "health_score": 87.3, "alert_level": "warning" } }
//! ```
//!
//! 解码按字段降级：非标量字段丢进 `skipped`，其余字段照常生效；
//! 整条报文只有在不是 JSON 对象或缺少字段表时才判失败。
//! 未知 agent 一律接受（缓存按需建立命名空间，不设生产方白名单）。

use domain::{Envelope, FieldValue};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// 解码错误。
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid json: {0}")]
    Json(String),
    #[error("payload is not a json object")]
    NotObject,
    #[error("missing agent id")]
    MissingAgentId,
    #[error("missing prediction map")]
    MissingPrediction,
}

/// 解码一条入站报文。
///
/// `topic_agent` 是从订阅主题（`predictions/<agent_id>`）推出的
/// 生产方标识，payload 未携带 `agent_id` 时作为回退。
pub fn decode(topic_agent: Option<&str>, payload: &[u8]) -> Result<Envelope, DecodeError> {
    let root: Value =
        serde_json::from_slice(payload).map_err(|err| DecodeError::Json(err.to_string()))?;
    let root = root.as_object().ok_or(DecodeError::NotObject)?;

    let agent_id = match root.get("agent_id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => topic_agent
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or(DecodeError::MissingAgentId)?,
    };

    // 自报时间仅作参考，不参与最新值判定，按原样保留
    let timestamp = root
        .get("timestamp")
        .and_then(Value::as_str)
        .map(str::to_string);

    let prediction = root
        .get("prediction")
        .and_then(Value::as_object)
        .ok_or(DecodeError::MissingPrediction)?;

    let mut fields = BTreeMap::new();
    let mut skipped = Vec::new();
    for (name, value) in prediction {
        match scalar_from_json(value) {
            Some(value) => {
                fields.insert(name.clone(), value);
            }
            None => {
                debug!(
                    target: "bridge.codec",
                    agent_id = %agent_id,
                    field = %name,
                    "non_scalar_field_skipped"
                );
                skipped.push(name.clone());
            }
        }
    }

    Ok(Envelope {
        agent_id,
        timestamp,
        fields,
        skipped,
    })
}

/// JSON 标量 → FieldValue；对象/数组/null 返回 None。
fn scalar_from_json(value: &Value) -> Option<FieldValue> {
    match value {
        Value::Bool(v) => Some(FieldValue::Bool(*v)),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Some(FieldValue::I64(v))
            } else {
                n.as_f64().map(FieldValue::F64)
            }
        }
        Value::String(v) => Some(FieldValue::String(v.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_full_envelope() {
        let payload = br#"{
            "agent_id": "pm_agent",
            "timestamp": "2026-01-01T00:00:00Z",
            "prediction": {
                "health_score": 87.3,
                "alert_level": "warning",
                "active": true,
                "cycles": 12
            }
        }"#;
        let envelope = decode(None, payload).expect("decoded");
        assert_eq!(envelope.agent_id, "pm_agent");
        assert_eq!(envelope.timestamp.as_deref(), Some("2026-01-01T00:00:00Z"));
        assert_eq!(
            envelope.fields.get("health_score"),
            Some(&FieldValue::F64(87.3))
        );
        assert_eq!(
            envelope.fields.get("alert_level"),
            Some(&FieldValue::String("warning".to_string()))
        );
        assert_eq!(envelope.fields.get("active"), Some(&FieldValue::Bool(true)));
        assert_eq!(envelope.fields.get("cycles"), Some(&FieldValue::I64(12)));
        assert!(envelope.skipped.is_empty());
    }

    #[test]
    fn missing_timestamp_is_none() {
        let payload = br#"{"agent_id": "pm_agent", "prediction": {"x": 1}}"#;
        let envelope = decode(None, payload).expect("decoded");
        assert!(envelope.timestamp.is_none());
    }

    #[test]
    fn falls_back_to_topic_agent() {
        let payload = br#"{"prediction": {"x": 1}}"#;
        let envelope = decode(Some("energy_agent"), payload).expect("decoded");
        assert_eq!(envelope.agent_id, "energy_agent");
    }

    #[test]
    fn rejects_without_any_agent_id() {
        let payload = br#"{"prediction": {"x": 1}}"#;
        let err = decode(None, payload).expect_err("missing agent id");
        assert_eq!(err.to_string(), "missing agent id");
    }

    #[test]
    fn skips_non_scalar_fields_but_applies_rest() {
        let payload = br#"{
            "agent_id": "pm_agent",
            "prediction": {
                "health_score": 50.0,
                "detail": {"nested": 1},
                "history": [1, 2, 3],
                "empty": null
            }
        }"#;
        let envelope = decode(None, payload).expect("decoded");
        assert_eq!(envelope.fields.len(), 1);
        assert_eq!(
            envelope.fields.get("health_score"),
            Some(&FieldValue::F64(50.0))
        );
        let mut skipped = envelope.skipped.clone();
        skipped.sort();
        assert_eq!(skipped, vec!["detail", "empty", "history"]);
    }

    #[test]
    fn rejects_malformed_json() {
        let err = decode(Some("pm_agent"), b"{not json").expect_err("bad json");
        assert!(matches!(err, DecodeError::Json(_)));
    }

    #[test]
    fn rejects_missing_prediction_map() {
        let payload = br#"{"agent_id": "pm_agent"}"#;
        let err = decode(None, payload).expect_err("no prediction");
        assert_eq!(err.to_string(), "missing prediction map");
    }

    #[test]
    fn accepts_unknown_agent() {
        let payload = br#"{"agent_id": "brand_new_agent", "prediction": {"x": 1}}"#;
        let envelope = decode(None, payload).expect("decoded");
        assert_eq!(envelope.agent_id, "brand_new_agent");
    }
}
