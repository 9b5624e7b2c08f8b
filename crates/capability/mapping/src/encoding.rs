//! 寄存器编码规则。
//!
//! 寄存器宽度为 Int16：越界一律钳制并告警，绝不回绕。
//! 枚举表按序号映射（如 normal=0 / warning=1 / critical=2）；
//! 未识别的标签读出保留哨兵值而不是报错，写方向则视为不可逆。

use crate::MappingError;
use bridge_telemetry::record_encode_clamped;
use domain::FieldValue;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// 未识别枚举标签的保留哨兵值。
pub const UNKNOWN_LEVEL_SENTINEL: i16 = -1;

/// 字段的值编码规则。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Encoding {
    /// 浮点按固定倍率缩放后截断成整数（惯用默认 ×10，概率类 ×100）。
    Scaled { factor: i32 },
    /// 有序枚举表：寄存器值 = 标签序号。
    Level { labels: Vec<String> },
    /// 布尔 0/1。
    Flag,
    /// 整数计数直通。
    Count,
    /// 纯文本，仅属性树可见，不占寄存器。
    Text,
}

impl Encoding {
    /// 当前值 → 寄存器值。读路径永不失败：类型不符退化为 0，
    /// 未识别标签读出哨兵值。
    pub fn encode_register(&self, value: &FieldValue) -> i16 {
        match self {
            Encoding::Scaled { factor } => {
                let raw = value.as_f64().unwrap_or(0.0) * (*factor as f64);
                clamp_i16(raw)
            }
            Encoding::Level { labels } => match value {
                FieldValue::String(label) => {
                    let label = label.to_ascii_lowercase();
                    match labels.iter().position(|item| *item == label) {
                        Some(index) => index as i16,
                        None => {
                            warn!(
                                target: "bridge.mapping",
                                label = %label,
                                "unknown_level_label"
                            );
                            UNKNOWN_LEVEL_SENTINEL
                        }
                    }
                }
                _ => UNKNOWN_LEVEL_SENTINEL,
            },
            Encoding::Flag => match value {
                FieldValue::Bool(true) => 1,
                _ => 0,
            },
            Encoding::Count => clamp_i16(value.as_f64().unwrap_or(0.0)),
            Encoding::Text => 0,
        }
    }

    /// 寄存器值 → 原始值（缩放/枚举的精确逆变换）。
    /// 不可逆（枚举越界、非 0/1 布尔、文本字段）即拒绝。
    pub fn decode_register(&self, raw: i16) -> Result<FieldValue, MappingError> {
        match self {
            Encoding::Scaled { factor } => Ok(FieldValue::F64(raw as f64 / *factor as f64)),
            Encoding::Level { labels } => {
                if raw < 0 || raw as usize >= labels.len() {
                    return Err(MappingError::NonInvertible(format!(
                        "level index {} out of table",
                        raw
                    )));
                }
                Ok(FieldValue::String(labels[raw as usize].clone()))
            }
            Encoding::Flag => match raw {
                0 => Ok(FieldValue::Bool(false)),
                1 => Ok(FieldValue::Bool(true)),
                _ => Err(MappingError::NonInvertible(format!(
                    "flag register must be 0 or 1, got {}",
                    raw
                ))),
            },
            Encoding::Count => Ok(FieldValue::I64(raw as i64)),
            Encoding::Text => Err(MappingError::NonInvertible(
                "text field has no register form".to_string(),
            )),
        }
    }

    /// 写入值的类型校验（枚举标签必须在表内）。
    pub fn check_kind(&self, value: &FieldValue) -> Result<(), MappingError> {
        match (self, value) {
            (Encoding::Scaled { .. }, FieldValue::F64(_) | FieldValue::I64(_)) => Ok(()),
            (Encoding::Level { labels }, FieldValue::String(label)) => {
                let label = label.to_ascii_lowercase();
                if labels.iter().any(|item| *item == label) {
                    Ok(())
                } else {
                    Err(MappingError::NonInvertible(format!(
                        "label '{}' not in table",
                        label
                    )))
                }
            }
            (Encoding::Flag, FieldValue::Bool(_)) => Ok(()),
            (Encoding::Count, FieldValue::I64(_)) => Ok(()),
            (Encoding::Text, FieldValue::String(_)) => Ok(()),
            (_, value) => Err(MappingError::TypeMismatch {
                expected: self.kind_name(),
                actual: value.kind(),
            }),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Encoding::Scaled { .. } => "float",
            Encoding::Level { .. } => "level label",
            Encoding::Flag => "bool",
            Encoding::Count => "int",
            Encoding::Text => "string",
        }
    }
}

fn clamp_i16(raw: f64) -> i16 {
    let truncated = raw.trunc();
    if truncated > i16::MAX as f64 {
        warn!(target: "bridge.mapping", value = raw, "register_value_clamped_high");
        record_encode_clamped();
        i16::MAX
    } else if truncated < i16::MIN as f64 {
        warn!(target: "bridge.mapping", value = raw, "register_value_clamped_low");
        record_encode_clamped();
        i16::MIN
    } else {
        truncated as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(labels: &[&str]) -> Encoding {
        Encoding::Level {
            labels: labels.iter().map(|label| label.to_string()).collect(),
        }
    }

    #[test]
    fn scaled_encode_truncates() {
        let encoding = Encoding::Scaled { factor: 10 };
        assert_eq!(encoding.encode_register(&FieldValue::F64(87.3)), 873);
        assert_eq!(encoding.encode_register(&FieldValue::F64(87.39)), 873);
        assert_eq!(encoding.encode_register(&FieldValue::I64(5)), 50);
    }

    #[test]
    fn scaled_encode_clamps_never_wraps() {
        let encoding = Encoding::Scaled { factor: 10 };
        assert_eq!(encoding.encode_register(&FieldValue::F64(99999.0)), 32767);
        assert_eq!(encoding.encode_register(&FieldValue::F64(-99999.0)), -32768);
    }

    #[test]
    fn level_encode_by_position() {
        let encoding = levels(&["normal", "warning", "critical"]);
        assert_eq!(
            encoding.encode_register(&FieldValue::String("normal".to_string())),
            0
        );
        assert_eq!(
            encoding.encode_register(&FieldValue::String("warning".to_string())),
            1
        );
        assert_eq!(
            encoding.encode_register(&FieldValue::String("CRITICAL".to_string())),
            2
        );
    }

    #[test]
    fn unknown_label_reads_sentinel() {
        let encoding = levels(&["normal", "warning", "critical"]);
        assert_eq!(
            encoding.encode_register(&FieldValue::String("bogus".to_string())),
            UNKNOWN_LEVEL_SENTINEL
        );
    }

    #[test]
    fn flag_and_count_encode() {
        assert_eq!(Encoding::Flag.encode_register(&FieldValue::Bool(true)), 1);
        assert_eq!(Encoding::Flag.encode_register(&FieldValue::Bool(false)), 0);
        assert_eq!(Encoding::Count.encode_register(&FieldValue::I64(7)), 7);
    }

    #[test]
    fn decode_inverts_scale() {
        let encoding = Encoding::Scaled { factor: 10 };
        assert_eq!(
            encoding.decode_register(873).expect("decoded"),
            FieldValue::F64(87.3)
        );
    }

    #[test]
    fn decode_rejects_out_of_table_level() {
        let encoding = levels(&["low", "medium", "high"]);
        assert_eq!(
            encoding.decode_register(1).expect("decoded"),
            FieldValue::String("medium".to_string())
        );
        assert!(encoding.decode_register(3).is_err());
        assert!(encoding.decode_register(UNKNOWN_LEVEL_SENTINEL).is_err());
    }

    #[test]
    fn decode_rejects_bad_flag() {
        assert!(Encoding::Flag.decode_register(2).is_err());
        assert_eq!(
            Encoding::Flag.decode_register(1).expect("decoded"),
            FieldValue::Bool(true)
        );
    }

    #[test]
    fn check_kind_matches_encoding() {
        let encoding = Encoding::Scaled { factor: 10 };
        assert!(encoding.check_kind(&FieldValue::F64(1.0)).is_ok());
        assert!(
            encoding
                .check_kind(&FieldValue::String("x".to_string()))
                .is_err()
        );

        let levels = levels(&["low", "high"]);
        assert!(
            levels
                .check_kind(&FieldValue::String("HIGH".to_string()))
                .is_ok()
        );
        assert!(
            levels
                .check_kind(&FieldValue::String("bogus".to_string()))
                .is_err()
        );
    }
}
