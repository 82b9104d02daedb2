//! 容错层
//!
//! - [`RetryExecutor`]：指数退避 + 抖动的重试引擎，按 [`ErrorClass`] 决定是否重试
//! - [`CircuitBreaker`] / [`BreakerRegistry`]：按资源名独立计数的熔断器
//!
//! 两者通过 [`RetryPolicy::breaker`] 组合：策略里指定了熔断器名时，
//! 每一次尝试都经过该熔断器。
//!
//! [`ErrorClass`]: crate::error::ErrorClass

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitStatus,
};
pub use retry::{RetryExecutor, RetryPolicy, RetryStats};

/// 常用资源名
pub mod resources {
    /// 数据库读写
    pub const DATABASE: &str = "database";
    /// 建立数据库连接
    pub const DATABASE_CONNECT: &str = "database_connect";
    /// 矿机 I/O（按设备再细分为 `miner:<id>`）
    pub const MINER_IO: &str = "miner_io";

    /// 单台矿机的熔断器名
    pub fn miner(device_id: &str) -> String {
        format!("miner:{}", device_id)
    }
}
