use odm_dashboard_rust::{config::AppConfig, logging, server, AppState};
use tracing::info;

const CONFIG_PATH: &str = "config/app.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置（日志系统尚未初始化，加载告警不会输出）
    let config = AppConfig::load_or_default(CONFIG_PATH).await;

    // 初始化日志系统（guard 必须保持存活）
    let _log_guard = logging::init_logging(&config.log);

    info!("ODM Dashboard 上传服务启动中...");
    info!("任务仓库: {}", config.repository.base_url);
    info!(
        "上传参数: 并发={}, 最大重试={}, 退避基准={}ms",
        config.upload.parallel_uploads, config.upload.max_retries, config.upload.retry_base_delay_ms
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);

    // 初始化应用状态
    let app_state = AppState::new(config)?;
    info!("应用状态初始化完成");

    let app = server::build_router(app_state.clone());

    // 启动服务器
    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);
    info!("WebSocket: ws://{}/api/v1/ws", addr);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // 使用 select! 监听关闭信号，支持优雅关闭
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    info!("正在取消进行中的上传...");
    app_state.shutdown();
    info!("应用已安全退出");

    Ok(())
}
