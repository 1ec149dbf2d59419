pub mod apikey;
pub mod config;
pub mod credential;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod gateway;
pub mod logging;
pub mod pool;
pub mod router;
pub mod service;
pub mod stats;
pub mod storage;
pub mod types;
pub mod upstream;
pub mod util;

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);
    logging::set_level(logging::LogLevel::parse(&cfg.debug));

    let store = Arc::new(credential::Store::new(&cfg.data_dir));
    let upstream: Arc<dyn upstream::UpstreamCaller> = Arc::new(upstream::HttpUpstream::new());
    let service = Arc::new(service::ProxyService::new(
        PathBuf::from(&cfg.data_dir),
        store,
        upstream,
    ));

    service
        .init(cfg.host_override.clone(), cfg.port_override)
        .await
        .context("初始化代理服务失败")?;

    // 独立进程没有第二个入口，autoStart/enabled 与否都直接监听。
    service.start().await.context("启动代理服务失败")?;

    shutdown_signal().await;
    service.stop().await;
    Ok(())
}

fn init_tracing(cfg: &config::Config) {
    // DEBUG 控制详细请求日志块的开关；这里保证本项目自身日志至少为 info，
    // 避免环境中预设的 RUST_LOG=warn 把关键日志过滤掉。
    let own_level = if logging::LogLevel::parse(&cfg.debug) >= logging::LogLevel::Medium {
        "debug"
    } else {
        "info"
    };
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new(format!("warn,kiro2api={own_level}"))
    } else if env.contains("kiro2api") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},kiro2api={own_level}"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
