use std::collections::BTreeMap;
use std::fmt;

/// 字段标量值。
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    I64(i64),
    F64(f64),
    Bool(bool),
    String(String),
}

impl FieldValue {
    /// 值类别名（用于日志与属性树节点类型标注）。
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::I64(_) => "int",
            FieldValue::F64(_) => "float",
            FieldValue::Bool(_) => "bool",
            FieldValue::String(_) => "string",
        }
    }

    /// 数值视图：整数与浮点都按 f64 返回，其余为 None。
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::I64(v) => Some(*v as f64),
            FieldValue::F64(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::I64(v) => write!(f, "{}", v),
            FieldValue::F64(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::String(v) => write!(f, "{}", v),
        }
    }
}

/// 预测 Envelope：一条入站消息携带的单个 agent 的字段集合。
///
/// `timestamp` 为生产方自报时间，仅作参考；最新值判定一律以
/// 到达顺序为准（生产方时钟不假定同步）。
#[derive(Debug, Clone)]
pub struct Envelope {
    pub agent_id: String,
    pub timestamp: Option<String>,
    pub fields: BTreeMap<String, FieldValue>,
    /// 解码时因非标量而丢弃的字段名（仅用于日志）。
    pub skipped: Vec<String>,
}

/// 最新值缓存的键：(agent, field)。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueKey {
    pub agent_id: String,
    pub field: String,
}

impl ValueKey {
    pub fn new(agent_id: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for ValueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_id, self.field)
    }
}

/// 写请求来源协议。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    AttributeTree,
    RegisterFile,
}

impl WriteOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOrigin::AttributeTree => "attribute_tree",
            WriteOrigin::RegisterFile => "register_file",
        }
    }
}

/// 协议前端发起的写请求（原始值，已去缩放/去枚举）。
///
/// 生命周期：前端校验通过后创建，回写路由一次事务内消费完毕。
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub key: ValueKey,
    pub value: FieldValue,
    pub origin: WriteOrigin,
}
