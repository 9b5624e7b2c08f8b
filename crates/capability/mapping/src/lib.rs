//! # 映射表能力模块
//!
//! 静态配置：描述每个 (agent, field) 如何暴露到各协议面。
//!
//! - 属性树路径（`Domain/Field`，全局唯一）
//! - 寄存器地址（全局唯一，且必须落在 agent 预留块内）
//! - 编码规则（缩放倍率 / 枚举表 / 布尔 / 计数 / 文本）
//! - 可写标记与回写目标 topic
//!
//! 启动加载时一次性校验，此后不可变；校验失败即拒绝启动。
//!
//! ## 地址规划
//!
//! ```text
//! 每个 agent 预留 100 个寄存器槽位：
//!   pm_agent     0-99      energy_agent 100-199
//!   cyber_agent  200-299   hazard_agent 300-399
//!   ppe_agent    400-499
//! 系统状态块 500-599 保留，映射条目不得占用。
//! ```

mod defaults;
pub mod encoding;

pub use defaults::{default_entries, default_plan};
pub use encoding::{Encoding, UNKNOWN_LEVEL_SENTINEL};

use domain::{FieldValue, ValueKey};
use serde::Deserialize;
use std::collections::HashMap;

/// 每个 agent 预留的寄存器槽位数。
pub const REGISTERS_PER_AGENT: u16 = 100;
/// 系统状态块起始地址。
pub const SYSTEM_BLOCK_BASE: u16 = 500;
/// 系统状态块结束地址（含）。
pub const SYSTEM_BLOCK_END: u16 = 599;

/// 映射表错误。
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("duplicate register address: {0}")]
    DuplicateRegister(u16),
    #[error("duplicate node path: {0}")]
    DuplicatePath(String),
    #[error("register {register} outside reserved block of {agent}")]
    RegisterOutOfBlock { agent: String, register: u16 },
    #[error("no reserved block for agent: {0}")]
    UnknownAgentBlock(String),
    #[error("mapping entry {0} has neither path nor register")]
    MissingAddress(String),
    #[error("writable entry {0} missing config topic")]
    MissingConfigTopic(String),
    #[error("text field {0} cannot occupy a register")]
    TextRegister(String),
    #[error("not writable")]
    NotWritable,
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("value {value} outside range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },
    #[error("not invertible: {0}")]
    NonInvertible(String),
    #[error("overrides parse error: {0}")]
    Overrides(String),
}

/// 单条映射：一个对外暴露的字段。
#[derive(Debug, Clone)]
pub struct MappingEntry {
    pub agent_id: String,
    pub field: String,
    /// 属性树路径 `Domain/Field`；None 表示不进属性树。
    pub node_path: Option<String>,
    /// 寄存器地址；None 表示不占寄存器。
    pub register: Option<u16>,
    pub encoding: Encoding,
    /// 写入校验范围（对数值编码生效）。
    pub valid_range: Option<(f64, f64)>,
    pub writable: bool,
    /// 可写条目的回写目标 topic。
    pub config_topic: Option<String>,
    /// 首条 Envelope 到达前对外呈现的默认值（读取时标记过期）。
    pub default: FieldValue,
}

impl MappingEntry {
    pub fn key(&self) -> ValueKey {
        ValueKey::new(self.agent_id.clone(), self.field.clone())
    }

    /// 写入校验：可写标记 + 类型 + 范围。两个可写前端共用。
    pub fn validate_write(&self, value: &FieldValue) -> Result<(), MappingError> {
        if !self.writable {
            return Err(MappingError::NotWritable);
        }
        self.encoding.check_kind(value)?;
        if let (Some((min, max)), Some(number)) = (self.valid_range, value.as_f64()) {
            if number < min || number > max {
                return Err(MappingError::OutOfRange {
                    value: number,
                    min,
                    max,
                });
            }
        }
        Ok(())
    }
}

/// agent → 寄存器块的分配方案（顺序即块序）。
#[derive(Debug, Clone)]
pub struct BlockPlan {
    agents: Vec<String>,
}

impl BlockPlan {
    pub fn new(agents: Vec<String>) -> Self {
        Self { agents }
    }

    /// agent 的块起始地址。
    pub fn block_base(&self, agent_id: &str) -> Option<u16> {
        self.agents
            .iter()
            .position(|item| item == agent_id)
            .map(|index| index as u16 * REGISTERS_PER_AGENT)
    }

    pub fn agents(&self) -> &[String] {
        &self.agents
    }
}

/// 校验后的只读映射表。
#[derive(Debug)]
pub struct MappingTable {
    entries: Vec<MappingEntry>,
    plan: BlockPlan,
    by_register: HashMap<u16, usize>,
    by_path: HashMap<String, usize>,
    by_key: HashMap<ValueKey, usize>,
    /// (域文件夹名, agent_id)，按块序。
    domains: Vec<(String, String)>,
}

impl MappingTable {
    /// 从条目集合构建并校验映射表。
    ///
    /// 启动期校验失败属于致命错误，由调用方终止进程。
    pub fn from_entries(
        plan: BlockPlan,
        entries: Vec<MappingEntry>,
    ) -> Result<Self, MappingError> {
        let mut by_register = HashMap::new();
        let mut by_path = HashMap::new();
        let mut by_key = HashMap::new();
        let mut agent_domains: HashMap<String, String> = HashMap::new();

        for (index, entry) in entries.iter().enumerate() {
            if entry.node_path.is_none() && entry.register.is_none() {
                return Err(MappingError::MissingAddress(entry.key().to_string()));
            }
            if entry.writable && entry.config_topic.is_none() {
                return Err(MappingError::MissingConfigTopic(entry.key().to_string()));
            }

            if let Some(register) = entry.register {
                if matches!(entry.encoding, Encoding::Text) {
                    return Err(MappingError::TextRegister(entry.key().to_string()));
                }
                let base = plan
                    .block_base(&entry.agent_id)
                    .ok_or_else(|| MappingError::UnknownAgentBlock(entry.agent_id.clone()))?;
                if register < base || register >= base + REGISTERS_PER_AGENT {
                    return Err(MappingError::RegisterOutOfBlock {
                        agent: entry.agent_id.clone(),
                        register,
                    });
                }
                if by_register.insert(register, index).is_some() {
                    return Err(MappingError::DuplicateRegister(register));
                }
            }

            if let Some(path) = &entry.node_path {
                if by_path.insert(path.clone(), index).is_some() {
                    return Err(MappingError::DuplicatePath(path.clone()));
                }
                if let Some((domain, _)) = path.split_once('/') {
                    agent_domains
                        .entry(entry.agent_id.clone())
                        .or_insert_with(|| domain.to_string());
                }
            }

            by_key.insert(entry.key(), index);
        }

        let domains = plan
            .agents()
            .iter()
            .filter_map(|agent| {
                agent_domains
                    .get(agent)
                    .map(|domain| (domain.clone(), agent.clone()))
            })
            .collect();

        Ok(Self {
            entries,
            plan,
            by_register,
            by_path,
            by_key,
            domains,
        })
    }

    /// 出厂默认映射表。
    pub fn default_table(config_prefix: &str) -> Result<Self, MappingError> {
        Self::from_entries(default_plan(), default_entries(config_prefix))
    }

    /// 出厂默认 + JSON 覆盖（倍率/枚举表/范围可调）。
    pub fn default_table_with_overrides(
        config_prefix: &str,
        overrides_json: &str,
    ) -> Result<Self, MappingError> {
        let overrides: Vec<MappingOverride> = serde_json::from_str(overrides_json)
            .map_err(|err| MappingError::Overrides(err.to_string()))?;
        let mut entries = default_entries(config_prefix);
        for item in overrides {
            let Some(entry) = entries
                .iter_mut()
                .find(|entry| entry.agent_id == item.agent_id && entry.field == item.field)
            else {
                return Err(MappingError::Overrides(format!(
                    "unknown entry {}/{}",
                    item.agent_id, item.field
                )));
            };
            if let Some(factor) = item.scale {
                entry.encoding = Encoding::Scaled { factor };
            }
            if let Some(labels) = item.labels {
                entry.encoding = Encoding::Level { labels };
            }
            if let Some(range) = item.valid_range {
                entry.valid_range = Some(range);
            }
        }
        Self::from_entries(default_plan(), entries)
    }

    pub fn by_register(&self, register: u16) -> Option<&MappingEntry> {
        self.by_register
            .get(&register)
            .map(|index| &self.entries[*index])
    }

    pub fn by_path(&self, path: &str) -> Option<&MappingEntry> {
        self.by_path.get(path).map(|index| &self.entries[*index])
    }

    pub fn by_key(&self, key: &ValueKey) -> Option<&MappingEntry> {
        self.by_key.get(key).map(|index| &self.entries[*index])
    }

    pub fn get(&self, agent_id: &str, field: &str) -> Option<&MappingEntry> {
        self.by_key(&ValueKey::new(agent_id, field))
    }

    pub fn entries(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.iter()
    }

    /// 某个域文件夹下的全部条目（按节点名排序）。
    pub fn entries_in_domain(&self, domain: &str) -> Vec<&MappingEntry> {
        let prefix = format!("{}/", domain);
        let mut items: Vec<&MappingEntry> = self
            .entries
            .iter()
            .filter(|entry| {
                entry
                    .node_path
                    .as_deref()
                    .is_some_and(|path| path.starts_with(&prefix))
            })
            .collect();
        items.sort_by(|a, b| a.node_path.cmp(&b.node_path));
        items
    }

    /// (域文件夹名, agent_id)，按块序。
    pub fn domains(&self) -> &[(String, String)] {
        &self.domains
    }

    pub fn plan(&self) -> &BlockPlan {
        &self.plan
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 映射表覆盖项（JSON 文件，运维侧可调倍率与枚举表）。
#[derive(Debug, Deserialize)]
pub struct MappingOverride {
    pub agent_id: String,
    pub field: String,
    pub scale: Option<i32>,
    pub labels: Option<Vec<String>>,
    pub valid_range: Option<(f64, f64)>,
}
