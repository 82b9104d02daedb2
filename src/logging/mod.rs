//! 日志系统

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 日志级别
    pub level: String,
    /// 日志文件路径（JSON 格式）
    pub file_path: Option<PathBuf>,
    /// 是否启用彩色输出
    pub colored: bool,
    /// 是否显示线程ID
    pub show_thread_id: bool,
    /// 是否显示目标模块
    pub show_target: bool,
    /// 日志轮转配置
    pub rotation: LogRotation,
}

/// 日志轮转配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// 不轮转
    Never,
    /// 每小时轮转
    Hourly,
    /// 每天轮转
    Daily,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            colored: true,
            show_thread_id: false,
            show_target: true,
            rotation: LogRotation::Daily,
        }
    }
}

/// 解析日志级别，无法识别时回退到 info
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// 初始化日志系统
///
/// 配置了日志文件时返回后台写线程的 guard，调用方需要持有到进程退出。
pub fn init_logging(config: LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::from_default_env().add_directive(parse_level(&config.level).into());

    let console_layer = fmt::layer()
        .with_ansi(config.colored)
        .with_target(config.show_target)
        .with_thread_ids(config.show_thread_id)
        .boxed();

    let registry = tracing_subscriber::registry().with(env_filter).with(console_layer);

    let Some(file_path) = config.file_path else {
        registry.try_init().context("Failed to install tracing subscriber")?;
        return Ok(None);
    };

    let directory = file_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = file_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("hashwatch.log");

    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;

    let appender = match config.rotation {
        LogRotation::Never => rolling::never(directory, file_name),
        LogRotation::Hourly => rolling::hourly(directory, file_name),
        LogRotation::Daily => rolling::daily(directory, file_name),
    };
    let (writer, guard) = non_blocking(appender);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .json();

    registry
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(Some(guard))
}

/// 设备相关日志，附带设备 id
#[macro_export]
macro_rules! miner_info {
    ($device_id:expr, $($arg:tt)*) => {
        tracing::info!(target: "miner", device_id = %$device_id, $($arg)*)
    };
}

#[macro_export]
macro_rules! miner_warn {
    ($device_id:expr, $($arg:tt)*) => {
        tracing::warn!(target: "miner", device_id = %$device_id, $($arg)*)
    };
}

/// 存储相关告警，附带资源名
#[macro_export]
macro_rules! storage_warn {
    ($resource:expr, $($arg:tt)*) => {
        tracing::warn!(target: "storage", resource = %$resource, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), tracing::Level::DEBUG);
        assert_eq!(parse_level("warn"), tracing::Level::WARN);
        assert_eq!(parse_level("verbose"), tracing::Level::INFO);
    }

    #[test]
    fn test_rotation_from_config_text() {
        #[derive(Deserialize)]
        struct Wrapper {
            rotation: LogRotation,
        }
        let parsed: Wrapper = toml::from_str("rotation = \"hourly\"").unwrap();
        assert_eq!(parsed.rotation, LogRotation::Hourly);
    }

    #[test]
    fn test_macros_expand() {
        miner_info!("m1", "poll ok");
        miner_warn!("m1", "poll slow: {}ms", 1200);
        storage_warn!("database", "busy");
    }
}
