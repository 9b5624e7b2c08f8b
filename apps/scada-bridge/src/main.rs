//! 多协议遥测桥运行时入口。
//!
//! 订阅预测消息，汇入最新值缓存，并经属性树 / 寄存器 / 外站桩
//! 三个协议面对外暴露；可写节点的写入经回写路由转成配置消息
//! 发回消息通道。组件在这里显式构造、按引用注入，不走全局态。

mod admin;
mod supervisor;

use bridge_config::AppConfig;
use bridge_telemetry::init_tracing;
use supervisor::Supervisor;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 从环境变量加载运行配置
    let config = AppConfig::from_env()?;
    // 初始化结构化日志
    init_tracing();

    // 启动全部组件（映射表校验失败会在这里终止进程）
    let supervisor = Supervisor::start(&config).await?;

    info!(
        target: "bridge.supervisor",
        attribute_port = config.attribute_port,
        register_port = config.register_port,
        outstation = config.outstation_enabled,
        mqtt = %format!("{}:{}", config.mqtt_host, config.mqtt_port),
        "bridge_running"
    );

    // 管理面：/health 与 /metrics
    let app = admin::router(admin::AdminState::from_supervisor(&supervisor));
    let listener = tokio::net::TcpListener::bind(&config.admin_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(target: "bridge.supervisor", "bridge_stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!(target: "bridge.supervisor", "shutdown_signal_received");
}
