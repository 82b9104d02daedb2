//! 重试引擎
//!
//! | 第 N 次重试 | 理论延迟                                   |
//! |-------------|--------------------------------------------|
//! | 0           | `base_delay`                               |
//! | n           | `min(base_delay * multiplier^n, max_delay)` |
//!
//! 开启抖动时在理论值上做 ±10% 的随机扰动，结果仍不超过 `max_delay`。

use crate::error::{CircuitOpenError, Classify};
use crate::resilience::BreakerRegistry;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 抖动幅度（±10%）
const JITTER_RATIO: f64 = 0.1;

/// 重试策略（构造后不可变）
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    breaker: Option<String>,
}

impl RetryPolicy {
    /// 创建新的重试策略，`max_attempts` 至少为 1
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// 只尝试一次
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    pub fn with_base_delay(self, base_delay: Duration) -> Self {
        Self { base_delay, ..self }
    }

    pub fn with_max_delay(self, max_delay: Duration) -> Self {
        Self { max_delay, ..self }
    }

    /// 倍率小于 1 时按 1 处理
    pub fn with_multiplier(self, multiplier: f64) -> Self {
        let multiplier = if multiplier.is_finite() && multiplier >= 1.0 { multiplier } else { 1.0 };
        Self { multiplier, ..self }
    }

    pub fn with_jitter(self, jitter: bool) -> Self {
        Self { jitter, ..self }
    }

    /// 每次尝试都经过指定名称的熔断器
    pub fn with_breaker(self, name: impl Into<String>) -> Self {
        Self { breaker: Some(name.into()), ..self }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    pub fn breaker(&self) -> Option<&str> {
        self.breaker.as_deref()
    }

    /// 第 `retry` 次重试（从 0 开始）的理论延迟，不含抖动
    pub fn base_delay_for_retry(&self, retry: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !raw.is_finite() || raw >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(raw.max(0.0))
        }
    }

    /// 第 `retry` 次重试（从 0 开始）实际使用的延迟
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let delay = self.base_delay_for_retry(retry);
        if !self.jitter {
            return delay;
        }

        let factor = 1.0 - JITTER_RATIO + fastrand::f64() * 2.0 * JITTER_RATIO;
        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * factor);
        jittered.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            breaker: None,
        }
    }
}

#[derive(Debug, Default)]
struct RetryCounters {
    operations: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
}

/// 重试统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStats {
    pub operations: u64,
    pub attempts: u64,
    pub retries: u64,
    pub exhausted: u64,
}

/// 重试执行器
///
/// 克隆开销很小，所有克隆共享同一个熔断器注册表和统计。
#[derive(Clone)]
pub struct RetryExecutor {
    breakers: Arc<BreakerRegistry>,
    counters: Arc<RetryCounters>,
}

enum Outcome {
    Retry(Duration),
    GiveUp,
}

impl RetryExecutor {
    /// 创建新的重试执行器
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            breakers,
            counters: Arc::new(RetryCounters::default()),
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// 按策略执行异步操作
    ///
    /// 退避期间使用 `tokio::time::sleep`，丢弃返回的 future 即可取消。
    pub async fn execute<F, Fut, T, E>(&self, policy: &RetryPolicy, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + From<CircuitOpenError> + Display,
    {
        let breaker = policy.breaker().map(|name| self.breakers.get_or_create(name));
        self.counters.operations.fetch_add(1, Ordering::Relaxed);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);

            let result = match &breaker {
                Some(breaker) => breaker.call(|| operation()).await,
                None => operation().await,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) => match self.next_step(policy, attempt, &e) {
                    Outcome::Retry(delay) => tokio::time::sleep(delay).await,
                    Outcome::GiveUp => return Err(e),
                },
            }
        }
    }

    /// 按策略执行同步操作，退避期间阻塞当前线程
    pub fn execute_blocking<F, T, E>(&self, policy: &RetryPolicy, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Classify + From<CircuitOpenError> + Display,
    {
        let breaker = policy.breaker().map(|name| self.breakers.get_or_create(name));
        self.counters.operations.fetch_add(1, Ordering::Relaxed);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);

            let result = match &breaker {
                Some(breaker) => breaker.call_blocking(|| operation()),
                None => operation(),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) => match self.next_step(policy, attempt, &e) {
                    Outcome::Retry(delay) => std::thread::sleep(delay),
                    Outcome::GiveUp => return Err(e),
                },
            }
        }
    }

    /// 获取统计信息
    pub fn stats(&self) -> RetryStats {
        RetryStats {
            operations: self.counters.operations.load(Ordering::Relaxed),
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
        }
    }

    fn next_step<E: Classify + Display>(&self, policy: &RetryPolicy, attempt: u32, error: &E) -> Outcome {
        let label = policy.breaker().unwrap_or("operation");

        if !error.is_retryable() {
            debug!("{} failed with non-retryable {:?} error: {}", label, error.class(), error);
            return Outcome::GiveUp;
        }

        if attempt >= policy.max_attempts() {
            warn!("{} failed after {} attempts: {}", label, attempt, error);
            self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
            return Outcome::GiveUp;
        }

        let delay = policy.delay_for_retry(attempt - 1);
        warn!(
            "{} attempt {}/{} failed: {}, retrying in {:?}",
            label,
            attempt,
            policy.max_attempts(),
            error,
            delay
        );
        self.counters.retries.fetch_add(1, Ordering::Relaxed);
        Outcome::Retry(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::resilience::{CircuitBreakerConfig, CircuitStatus};
    use std::sync::atomic::AtomicU32;

    fn executor() -> RetryExecutor {
        RetryExecutor::new(Arc::new(BreakerRegistry::default()))
    }

    fn transient() -> StorageError {
        StorageError::DatabaseConnection { reason: "connection refused".to_string() }
    }

    #[test]
    fn test_delay_without_jitter_is_exact() {
        let policy = RetryPolicy::new(10)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .with_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_retry(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(200), Duration::from_secs(1));
    }

    #[test]
    fn test_jittered_delay_bounds() {
        let policy = RetryPolicy::new(10)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1500))
            .with_multiplier(3.0)
            .with_jitter(true);

        for retry in 0..8 {
            let theoretical = policy.base_delay_for_retry(retry).as_secs_f64();
            for _ in 0..200 {
                let delay = policy.delay_for_retry(retry);
                assert!(delay <= policy.max_delay());
                let secs = delay.as_secs_f64();
                assert!(secs >= theoretical * 0.9 - 1e-9, "retry {} delay {} too small", retry, secs);
                assert!(secs <= theoretical * 1.1 + 1e-9, "retry {} delay {} too large", retry, secs);
            }
        }
    }

    #[test]
    fn test_policy_normalizes_inputs() {
        let policy = RetryPolicy::new(0).with_multiplier(0.5);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.multiplier(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors_until_success() {
        let executor = executor();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5).with_jitter(false);

        let result: Result<u32, StorageError> = executor
            .execute(&policy, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stats = executor.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.exhausted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_propagates_immediately() {
        let executor = executor();
        let calls = AtomicU32::new(0);

        let result: Result<(), StorageError> = executor
            .execute(&RetryPolicy::new(5), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::InvalidArgument { reason: "bad device id".to_string() })
            })
            .await;

        assert!(matches!(result, Err(StorageError::InvalidArgument { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_returns_last_error() {
        let executor = executor();
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let policy = RetryPolicy::new(3)
            .with_base_delay(Duration::from_secs(1))
            .with_jitter(false);

        let result: Result<(), StorageError> = executor
            .execute(&policy, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::DatabaseConnection { reason: format!("attempt {}", n) })
            })
            .await;

        match result {
            Err(StorageError::DatabaseConnection { reason }) => assert_eq!(reason, "attempt 2"),
            other => panic!("unexpected result: {:?}", other),
        }
        // 1s + 2s 的退避
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(executor.stats().exhausted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_open_is_not_retried() {
        let registry = Arc::new(BreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 1,
        }));
        let executor = RetryExecutor::new(registry.clone());
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5).with_jitter(false).with_breaker("database");

        let result: Result<(), StorageError> = executor
            .execute(&policy, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        // 两次真实尝试后熔断器打开，第三次被快速拒绝
        assert!(matches!(result, Err(StorageError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.get_or_create("database").status(), CircuitStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_cancellable() {
        let executor = executor();
        let policy = RetryPolicy::new(5)
            .with_base_delay(Duration::from_secs(60))
            .with_jitter(false);

        let attempt = executor.execute(&policy, || async { Err::<(), StorageError>(transient()) });
        let outcome = tokio::time::timeout(Duration::from_secs(1), attempt).await;

        assert!(outcome.is_err());
        assert_eq!(executor.stats().attempts, 1);
    }

    #[test]
    fn test_execute_blocking() {
        let executor = executor();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false);

        let result: Result<&str, StorageError> = executor.execute_blocking(&policy, || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(transient())
            } else {
                Ok("ok")
            }
        });

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
