//! 应用运行配置加载。

use std::env;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 应用运行配置。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_keepalive_seconds: u64,
    /// 预测数据订阅前缀（`{prefix}/<agent_id>`）。
    pub predictions_topic_prefix: String,
    /// 配置回写发布前缀（`{prefix}/<agent_id>`）。
    pub config_topic_prefix: String,
    pub attribute_port: u16,
    pub register_port: u16,
    pub outstation_enabled: bool,
    pub outstation_port: u16,
    pub admin_addr: String,
    pub staleness_seconds: u64,
    pub ingest_backoff_initial_ms: u64,
    pub ingest_backoff_max_ms: u64,
    pub ingest_queue_capacity: usize,
    pub writeback_queue_capacity: usize,
    /// 寄存器协议客户端来源白名单（空 = 放行所有）。
    pub register_ip_allowlist: Vec<String>,
    /// 可选的映射表覆盖文件（JSON）。
    pub mapping_overrides_path: Option<String>,
}

impl AppConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let mqtt_host = env::var("BRIDGE_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let mqtt_port = read_u16_with_default("BRIDGE_MQTT_PORT", 1883)?;
        let mqtt_username = read_optional("BRIDGE_MQTT_USERNAME");
        let mqtt_password = read_optional("BRIDGE_MQTT_PASSWORD");
        let mqtt_keepalive_seconds = read_u64_with_default("BRIDGE_MQTT_KEEPALIVE_SECONDS", 60)?;
        let predictions_topic_prefix = env::var("BRIDGE_PREDICTIONS_TOPIC_PREFIX")
            .unwrap_or_else(|_| "predictions".to_string());
        let config_topic_prefix =
            env::var("BRIDGE_CONFIG_TOPIC_PREFIX").unwrap_or_else(|_| "config".to_string());
        let attribute_port = read_u16_with_default("BRIDGE_ATTRIBUTE_PORT", 4840)?;
        let register_port = read_u16_with_default("BRIDGE_REGISTER_PORT", 502)?;
        let outstation_enabled = read_bool_with_default("BRIDGE_OUTSTATION", false);
        let outstation_port = read_u16_with_default("BRIDGE_OUTSTATION_PORT", 20000)?;
        let admin_addr =
            env::var("BRIDGE_ADMIN_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let staleness_seconds = read_u64_with_default("BRIDGE_STALENESS_SECONDS", 30)?;
        let ingest_backoff_initial_ms =
            read_u64_with_default("BRIDGE_INGEST_BACKOFF_INITIAL_MS", 1000)?;
        let ingest_backoff_max_ms = read_u64_with_default("BRIDGE_INGEST_BACKOFF_MAX_MS", 60_000)?;
        let ingest_queue_capacity =
            read_u64_with_default("BRIDGE_INGEST_QUEUE_CAPACITY", 256)? as usize;
        let writeback_queue_capacity =
            read_u64_with_default("BRIDGE_WRITEBACK_QUEUE_CAPACITY", 64)? as usize;
        let register_ip_allowlist = read_list("BRIDGE_REGISTER_IP_ALLOWLIST");
        let mapping_overrides_path = read_optional("BRIDGE_MAPPING_OVERRIDES");

        Ok(Self {
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_keepalive_seconds,
            predictions_topic_prefix,
            config_topic_prefix,
            attribute_port,
            register_port,
            outstation_enabled,
            outstation_port,
            admin_addr,
            staleness_seconds,
            ingest_backoff_initial_ms,
            ingest_backoff_max_ms,
            ingest_queue_capacity,
            writeback_queue_capacity,
            register_ip_allowlist,
            mapping_overrides_path,
        })
    }
}

fn read_u16_with_default(key: &str, default: u16) -> Result<u16, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}

/// 逗号分隔列表（空项忽略）。
fn read_list(key: &str) -> Vec<String> {
    match env::var(key) {
        Ok(value) => value
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        Err(_) => Vec::new(),
    }
}
