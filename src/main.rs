use anyhow::{Context, Result};
use clap::Parser;
use hashwatch::logging::init_logging;
use hashwatch::{Args, Config, MonitorContext, MonitorManager};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("hashwatch: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // 解析命令行参数
    let args = Args::parse();

    // 加载配置
    let mut config = Config::load_or_default(&args.config)?;
    config.apply_args(&args);

    // guard 必须活到进程退出，否则文件日志会丢
    let _log_guard = init_logging(config.log_config())?;

    info!("Starting {} v{}", hashwatch::NAME, hashwatch::VERSION);
    info!("Configuration loaded from: {}", args.config);

    let context = MonitorContext::from_config(config)
        .await
        .context("Failed to initialize monitor")?;
    let manager = Arc::new(MonitorManager::new(Arc::new(context)));

    manager.start().await?;
    info!("Monitor running, press Ctrl-C to stop");

    wait_for_shutdown().await?;
    info!("Received shutdown signal");

    if let Err(e) = manager.stop().await {
        error!("Error during shutdown: {}", e);
    }
    info!("Monitor stopped gracefully");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Error waiting for Ctrl-C")?,
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await.context("Error waiting for Ctrl-C")
}
