//! Hashwatch - 比特币 solo 挖矿设备的监控核心
//!
//! 周期性轮询矿机，把结果写入内存状态和 SQLite 时序库，并推送给订阅者。
//!
//! ## 组成
//!
//! ### 容错
//! - 指数退避 + 抖动的重试引擎
//! - 按资源名独立计数的熔断器
//!
//! ### 存储
//! - 有上限的连接池（超时等待、健康检查、故障连接替换）
//! - 带 TTL 的查询缓存
//! - 串行化的原子事务
//! - 时序存储：采样、状态快照、聚合和保留策略
//!
//! ### 实时状态
//! - 读写锁保护的设备状态表
//! - 按主题分发的订阅注册表

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod resilience;
pub mod state;
pub mod storage;
pub mod utils;

pub use config::{Args, Config};
pub use error::{Classify, ErrorClass, HashwatchError};
pub use monitor::{MinerCollector, MinerPoll, MonitorContext, MonitorManager};
pub use resilience::{BreakerRegistry, CircuitBreaker, RetryExecutor, RetryPolicy};
pub use state::{SharedStateStore, SubscriptionRegistry};
pub use storage::{AtomicTransactionExecutor, ConnectionPool, QueryCache, TimeSeriesStore};

/// 程序版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 程序名称
pub const NAME: &str = "hashwatch";
