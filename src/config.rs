use crate::logging::{LogConfig, LogRotation};
use crate::resilience::{resources, BreakerRegistry, CircuitBreakerConfig, RetryPolicy};
use crate::storage::{CacheConfig, PoolConfig, SqliteManager};
use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "hashwatch.toml")]
    pub config: String,

    /// Enable debug mode
    #[arg(short, long)]
    pub debug: bool,

    /// Log level (overrides the config file)
    #[arg(long)]
    pub log_level: Option<String>,

    /// SQLite database path (overrides the config file)
    #[arg(long)]
    pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub database: DatabaseConfig,
    pub retry: RetryConfig,
    pub breakers: BreakersConfig,
    pub cache: CacheSettings,
    pub retention: RetentionConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub log_rotation: LogRotation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: usize,
    pub acquire_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub busy_timeout_ms: u64,
    pub wal: bool,
}

/// 单个命名重试策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
    /// 每次尝试经过的熔断器
    pub breaker: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub policies: BTreeMap<String, RetryPolicyConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakersConfig {
    pub default: CircuitBreakerConfig,
    /// 按资源名覆盖默认阈值
    pub overrides: HashMap<String, CircuitBreakerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub capacity: usize,
    pub default_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub detailed_days: u32,
    pub aggregated_days: u32,
    pub status_days: u32,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            log_rotation: LogRotation::Daily,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/hashwatch.db"),
            max_connections: 5,
            acquire_timeout_secs: 30,
            health_check_interval_secs: 60,
            busy_timeout_ms: 5000,
            wal: true,
        }
    }
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            breaker: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let mut policies = BTreeMap::new();
        policies.insert(
            resources::DATABASE.to_string(),
            RetryPolicyConfig {
                max_attempts: 3,
                base_delay_ms: 500,
                max_delay_ms: 10_000,
                breaker: Some(resources::DATABASE.to_string()),
                ..Default::default()
            },
        );
        policies.insert(
            resources::DATABASE_CONNECT.to_string(),
            RetryPolicyConfig {
                max_attempts: 5,
                base_delay_ms: 200,
                max_delay_ms: 5_000,
                breaker: Some(resources::DATABASE_CONNECT.to_string()),
                ..Default::default()
            },
        );
        // 矿机 I/O 的熔断器按设备区分，由监控循环指定
        policies.insert(
            resources::MINER_IO.to_string(),
            RetryPolicyConfig {
                max_attempts: 3,
                base_delay_ms: 1_000,
                max_delay_ms: 10_000,
                ..Default::default()
            },
        );
        Self { policies }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl_secs: 60,
            sweep_interval_secs: 300,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            detailed_days: 7,
            aggregated_days: 90,
            status_days: 30,
            sweep_interval_secs: 3600,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { poll_interval_secs: 30 }
    }
}

impl RetryPolicyConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(self.max_attempts)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.multiplier)
            .with_jitter(self.jitter);

        match &self.breaker {
            Some(breaker) => policy.with_breaker(breaker.clone()),
            None => policy,
        }
    }
}

impl RetryConfig {
    /// 取命名策略，未配置时使用默认值
    pub fn policy(&self, name: &str) -> RetryPolicy {
        self.policies
            .get(name)
            .map(RetryPolicyConfig::to_policy)
            .unwrap_or_default()
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let config_content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;

        Ok(config)
    }

    /// 文件不存在时使用默认配置
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let config_content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(path, config_content)
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    /// 命令行参数覆盖配置文件
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(level) = &args.log_level {
            self.general.log_level = level.clone();
        }
        if args.debug {
            self.general.log_level = "debug".to_string();
        }
        if let Some(path) = &args.database {
            self.database.path = path.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        // 验证重试策略
        for (name, policy) in &self.retry.policies {
            if policy.max_attempts < 1 {
                anyhow::bail!("Retry policy '{}' max_attempts must be at least 1", name);
            }
            if !policy.multiplier.is_finite() || policy.multiplier < 1.0 {
                anyhow::bail!("Retry policy '{}' multiplier must be >= 1.0", name);
            }
            if policy.base_delay_ms > policy.max_delay_ms {
                anyhow::bail!("Retry policy '{}' base delay exceeds max delay", name);
            }
        }

        // 验证熔断器阈值
        let breakers = std::iter::once(("default", &self.breakers.default))
            .chain(self.breakers.overrides.iter().map(|(name, config)| (name.as_str(), config)));
        for (name, breaker) in breakers {
            if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
                anyhow::bail!("Circuit breaker '{}' thresholds must be greater than 0", name);
            }
        }

        // 验证数据库配置
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }
        if self.database.acquire_timeout_secs == 0 || self.database.health_check_interval_secs == 0 {
            anyhow::bail!("Database timeouts and intervals must be greater than 0");
        }

        // 验证缓存配置
        if self.cache.capacity == 0 {
            anyhow::bail!("Cache capacity must be greater than 0");
        }
        if self.cache.sweep_interval_secs == 0 {
            anyhow::bail!("Cache sweep interval must be greater than 0");
        }

        // 验证保留策略
        if self.retention.aggregated_days < self.retention.detailed_days {
            anyhow::bail!(
                "Aggregated retention ({} days) must not be shorter than detailed retention ({} days)",
                self.retention.aggregated_days,
                self.retention.detailed_days
            );
        }
        if self.retention.sweep_interval_secs == 0 {
            anyhow::bail!("Retention sweep interval must be greater than 0");
        }

        if self.monitor.poll_interval_secs == 0 {
            anyhow::bail!("Monitor poll interval must be greater than 0");
        }

        Ok(())
    }

    /// 检查配置是否有效
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.general.log_level.clone(),
            file_path: self.general.log_file.clone(),
            rotation: self.general.log_rotation,
            ..LogConfig::default()
        }
    }

    pub fn breaker_registry(&self) -> BreakerRegistry {
        BreakerRegistry::new(self.breakers.default.clone()).with_overrides(self.breakers.overrides.clone())
    }

    pub fn sqlite_manager(&self) -> SqliteManager {
        SqliteManager::new(&self.database.path)
            .with_busy_timeout(Duration::from_millis(self.database.busy_timeout_ms))
            .with_wal(self.database.wal)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.database.max_connections,
            acquire_timeout: Duration::from_secs(self.database.acquire_timeout_secs),
            health_check_interval: Duration::from_secs(self.database.health_check_interval_secs),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache.capacity,
            default_ttl: Duration::from_secs(self.cache.default_ttl_secs),
        }
    }
}

#[cfg(test)]
mod tests;
