//! # 协议服务能力模块
//!
//! 把最新值缓存对外暴露成三种工业协议面：
//! - **属性树**：层级命名空间 + 类型化节点，JSON 行协议
//! - **寄存器**：Modbus TCP 子集（FC03 读 / FC06 写），Int16 定宽
//! - **外站桩**：只读点表 + 最小握手，留扩展接缝
//!
//! ## 架构设计
//!
//! ```text
//!            ValueStore（读路径，永不阻塞在消息通道上）
//!            MappingTable（地址/路径/编码规则）
//!                 │
//!     ┌───────────┼─────────────┐
//!     ▼           ▼             ▼
//! AttributeTree RegisterServer OutstationStub（只读）
//!     │           │
//!     └─────┬─────┘  写请求（校验后）
//!           ▼
//!     WriteBackRouter → 配置消息
//! ```
//!
//! 每个监听器独立 accept，连接各自 `tokio::spawn` 处理；慢客户端
//! 拖不住别的会话，也拖不住接入链路。

mod attribute;
mod error;
mod outstation;
mod register;
mod status;

pub use attribute::{AttributeTreeServer, ROOT_FOLDER};
pub use error::ProtocolError;
pub use outstation::{BridgeOutstationBackend, OutstationBackend, OutstationServer};
pub use register::RegisterServer;
pub use status::{system_status, SystemStatus};
