//! 协议错误类型定义

/// 协议服务错误
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// 监听端口绑定失败（对该监听器致命）
    #[error("bind error: {0}")]
    Bind(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 帧解析错误
    #[error("frame error: {0}")]
    Frame(String),
}
