//! 熔断器
//!
//! 状态机：CLOSED → OPEN → HALF_OPEN → CLOSED。
//! 锁只保护熔断器自身的状态，被包装的操作在锁外执行。

use crate::error::{CircuitOpenError, Classify, ErrorClass};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    /// 正常放行
    #[default]
    Closed,
    /// 快速失败
    Open,
    /// 试探恢复
    HalfOpen,
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitStatus::Closed => write!(f, "CLOSED"),
            CircuitStatus::Open => write!(f, "OPEN"),
            CircuitStatus::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// 熔断器阈值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// 连续失败多少次后打开
    pub failure_threshold: u32,
    /// 打开后多久允许试探
    #[serde(with = "duration_secs")]
    pub recovery_timeout: Duration,
    /// 半开状态下连续成功多少次后关闭
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    status: CircuitStatus,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    next_attempt_time: Option<Instant>,
    /// 半开状态下已放行、尚未结束的试探调用
    trials_in_flight: u32,
}

/// 熔断器状态快照（只读）
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub status: CircuitStatus,
    pub failure_count: u32,
    pub success_count: u32,
    /// 距离允许试探还剩多久（仅 OPEN 状态）
    pub retry_after: Option<Duration>,
    /// 距最后一次失败多久
    pub since_last_failure: Option<Duration>,
}

/// 单个资源的熔断器
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// 创建新的熔断器
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// 通过熔断器执行异步操作
    ///
    /// OPEN 且未到恢复时间时直接返回 [`CircuitOpenError`]，不调用 `operation`。
    /// 只有 `Retryable` 类错误计为失败；参数错误之类说明资源本身仍在响应，原样返回且不改变状态。
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError> + Classify,
    {
        let _admission = self.admit()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    /// 同步版本的 [`call`](Self::call)
    pub fn call_blocking<F, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<CircuitOpenError> + Classify,
    {
        let _admission = self.admit()?;

        match operation() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    /// 检查是否放行，必要时 OPEN → HALF_OPEN
    ///
    /// 只做检查，不占用半开状态的试探名额。
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let mut state = self.lock();
        self.check(&mut state)
    }

    /// 放行一次调用；半开状态下最多同时放行 `success_threshold` 个试探
    fn admit(&self) -> Result<Admission<'_>, CircuitOpenError> {
        let mut state = self.lock();
        self.check(&mut state)?;

        let trial = state.status == CircuitStatus::HalfOpen;
        if trial {
            if state.trials_in_flight >= self.config.success_threshold.max(1) {
                debug!(
                    "Circuit breaker '{}' rejecting call, {} trial calls in flight",
                    self.name, state.trials_in_flight
                );
                return Err(CircuitOpenError {
                    resource: self.name.clone(),
                    failures: state.failure_count,
                    retry_after: Duration::ZERO,
                });
            }
            state.trials_in_flight += 1;
        }

        Ok(Admission { breaker: self, trial })
    }

    fn check(&self, state: &mut BreakerState) -> Result<(), CircuitOpenError> {
        if state.status == CircuitStatus::Open {
            let now = Instant::now();
            match state.next_attempt_time {
                Some(next) if now < next => {
                    return Err(CircuitOpenError {
                        resource: self.name.clone(),
                        failures: state.failure_count,
                        retry_after: next - now,
                    });
                }
                _ => {
                    state.status = CircuitStatus::HalfOpen;
                    state.success_count = 0;
                    info!("Circuit breaker '{}' half-open, probing", self.name);
                }
            }
        }

        Ok(())
    }

    fn record_error<E: Classify>(&self, error: &E) {
        match error.class() {
            ErrorClass::Retryable => self.record_failure(),
            class => debug!("Circuit breaker '{}' not counting {:?} error", self.name, class),
        }
    }

    /// 记录一次成功
    pub fn record_success(&self) {
        let mut state = self.lock();

        match state.status {
            CircuitStatus::Closed => {
                state.failure_count = 0;
            }
            CircuitStatus::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.status = CircuitStatus::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.next_attempt_time = None;
                    info!("Circuit breaker '{}' closed after recovery", self.name);
                }
            }
            // 另一个并发调用已经重新打开了熔断器
            CircuitStatus::Open => {}
        }
    }

    /// 记录一次失败
    pub fn record_failure(&self) {
        let mut state = self.lock();
        let now = Instant::now();
        state.last_failure_time = Some(now);

        match state.status {
            CircuitStatus::Closed => {
                state.failure_count += 1;
                debug!(
                    "Circuit breaker '{}' failure {}/{}",
                    self.name, state.failure_count, self.config.failure_threshold
                );
                if state.failure_count >= self.config.failure_threshold {
                    self.trip(&mut state, now);
                }
            }
            CircuitStatus::HalfOpen => {
                state.failure_count += 1;
                self.trip(&mut state, now);
            }
            CircuitStatus::Open => {
                state.failure_count += 1;
                state.next_attempt_time = Some(now + self.config.recovery_timeout);
            }
        }
    }

    /// 当前状态
    pub fn status(&self) -> CircuitStatus {
        self.lock().status
    }

    /// 状态快照
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.lock();
        let now = Instant::now();

        let retry_after = match (state.status, state.next_attempt_time) {
            (CircuitStatus::Open, Some(next)) => Some(next.saturating_duration_since(now)),
            _ => None,
        };

        BreakerSnapshot {
            name: self.name.clone(),
            status: state.status,
            failure_count: state.failure_count,
            success_count: state.success_count,
            retry_after,
            since_last_failure: state.last_failure_time.map(|t| now.saturating_duration_since(t)),
        }
    }

    /// 管理操作：强制关闭并清零计数
    pub fn reset(&self) {
        let mut state = self.lock();
        warn!(
            "Circuit breaker '{}' manually reset from {} ({} failures)",
            self.name, state.status, state.failure_count
        );
        *state = BreakerState::default();
    }

    /// 管理操作：强制打开
    pub fn force_open(&self) {
        let mut state = self.lock();
        warn!("Circuit breaker '{}' manually forced open", self.name);
        let now = Instant::now();
        state.last_failure_time = Some(now);
        self.trip(&mut state, now);
    }

    fn trip(&self, state: &mut BreakerState, now: Instant) {
        state.status = CircuitStatus::Open;
        state.success_count = 0;
        state.next_attempt_time = Some(now + self.config.recovery_timeout);
        warn!(
            "Circuit breaker '{}' opened after {} failures, cooling down for {:?}",
            self.name, state.failure_count, self.config.recovery_timeout
        );
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 一次放行；试探调用结束（包括被取消）时归还名额
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial {
            let mut state = self.breaker.lock();
            state.trials_in_flight = state.trials_in_flight.saturating_sub(1);
        }
    }
}

/// 熔断器注册表
///
/// 每个资源名一个独立的熔断器，一个资源故障不会拖累其他资源。
pub struct BreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// 创建新的注册表
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            overrides: HashMap::new(),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// 按资源名覆盖阈值
    pub fn with_overrides(mut self, overrides: HashMap<String, CircuitBreakerConfig>) -> Self {
        self.overrides = overrides;
        self
    }

    /// 获取或创建熔断器
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                debug!("Registering circuit breaker '{}'", name);
                Arc::new(CircuitBreaker::new(name, config))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    /// 所有熔断器的快照，按名称排序
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        let mut snapshots: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// 管理操作：重置指定熔断器，不存在时返回 false
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(failures: u32, recovery_secs: u64, successes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: failures,
                recovery_timeout: Duration::from_secs(recovery_secs),
                success_threshold: successes,
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), StorageError> {
        b.call(|| async {
            Err::<(), _>(StorageError::DatabaseConnection { reason: "refused".to_string() })
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), StorageError> {
        b.call(|| async { Ok::<(), StorageError>(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_exactly_at_threshold() {
        let b = breaker(3, 10, 1);

        assert!(fail(&b).await.is_err());
        assert!(fail(&b).await.is_err());
        assert_eq!(b.status(), CircuitStatus::Closed);

        assert!(fail(&b).await.is_err());
        assert_eq!(b.status(), CircuitStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count_while_closed() {
        let b = breaker(3, 10, 1);

        let _ = fail(&b).await;
        let _ = fail(&b).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.snapshot().failure_count, 0);

        let _ = fail(&b).await;
        let _ = fail(&b).await;
        assert_eq!(b.status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_fails_fast_without_invoking_operation() {
        let b = breaker(1, 10, 1);
        let _ = fail(&b).await;

        let calls = AtomicU32::new(0);
        let result: Result<(), StorageError> = b
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(StorageError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_only_after_recovery_timeout() {
        let b = breaker(1, 10, 1);
        let _ = fail(&b).await;

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(b.try_acquire().is_err());
        assert_eq!(b.status(), CircuitStatus::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(b.try_acquire().is_ok());
        assert_eq!(b.status(), CircuitStatus::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_regardless_of_successes() {
        let b = breaker(1, 5, 3);
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        succeed(&b).await.unwrap();
        succeed(&b).await.unwrap();
        assert_eq!(b.status(), CircuitStatus::HalfOpen);
        assert_eq!(b.snapshot().success_count, 2);

        let _ = fail(&b).await;
        let snapshot = b.snapshot();
        assert_eq!(snapshot.status, CircuitStatus::Open);
        assert_eq!(snapshot.success_count, 0);
        assert_eq!(snapshot.retry_after, Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let b = breaker(2, 5, 2);
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        succeed(&b).await.unwrap();
        assert_eq!(b.status(), CircuitStatus::HalfOpen);
        succeed(&b).await.unwrap();

        let snapshot = b.snapshot();
        assert_eq!(snapshot.status, CircuitStatus::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reset_and_force_open() {
        let b = breaker(1, 60, 1);
        b.force_open();
        assert_eq!(b.status(), CircuitStatus::Open);

        b.reset();
        assert_eq!(b.status(), CircuitStatus::Closed);
        assert!(succeed(&b).await.is_ok());
    }

    #[test]
    fn test_call_blocking() {
        let b = breaker(1, 60, 1);
        let result: Result<u32, StorageError> = b.call_blocking(|| Ok(7));
        assert_eq!(result.unwrap(), 7);

        let result: Result<u32, StorageError> =
            b.call_blocking(|| Err(StorageError::PoolClosed));
        assert!(matches!(result, Err(StorageError::PoolClosed)));
        assert_eq!(b.status(), CircuitStatus::Closed);

        let result: Result<u32, StorageError> = b.call_blocking(|| {
            Err(StorageError::DatabaseConnection { reason: "refused".to_string() })
        });
        assert!(matches!(result, Err(StorageError::DatabaseConnection { .. })));

        let result: Result<u32, StorageError> = b.call_blocking(|| Ok(7));
        assert!(matches!(result, Err(StorageError::CircuitOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_errors_do_not_trip() {
        let b = breaker(2, 10, 1);

        for _ in 0..5 {
            let result: Result<(), StorageError> = b
                .call(|| async { Err(StorageError::TableNotFound { table: "miner_metrics".to_string() }) })
                .await;
            assert!(matches!(result, Err(StorageError::TableNotFound { .. })));
        }
        let result: Result<(), StorageError> = b
            .call(|| async { Err(StorageError::InvalidArgument { reason: "empty device id".to_string() }) })
            .await;
        assert!(result.is_err());

        let snapshot = b.snapshot();
        assert_eq!(snapshot.status, CircuitStatus::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_trial_calls() {
        let b = breaker(1, 5, 2);
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        let first = b.admit().unwrap();
        let second = b.admit().unwrap();
        assert_eq!(b.status(), CircuitStatus::HalfOpen);

        let rejected = b.admit().err().unwrap();
        assert_eq!(rejected.retry_after, Duration::ZERO);

        drop(first);
        let third = b.admit().unwrap();
        drop(second);
        drop(third);
        assert_eq!(b.lock().trials_in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_call_releases_slot() {
        let b = breaker(1, 5, 1);
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        let stuck = b.call(|| futures::future::pending::<Result<(), StorageError>>());
        assert!(tokio::time::timeout(Duration::from_secs(1), stuck).await.is_err());

        succeed(&b).await.unwrap();
        assert_eq!(b.status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_isolates_resources() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "database".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
        );
        let registry = BreakerRegistry::default().with_overrides(overrides);

        let db = registry.get_or_create("database");
        let miner = registry.get_or_create("miner:m1");
        assert!(Arc::ptr_eq(&db, &registry.get_or_create("database")));

        let _ = fail(&db).await;
        assert_eq!(db.status(), CircuitStatus::Open);
        assert_eq!(miner.status(), CircuitStatus::Closed);

        let names: Vec<String> = registry.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["database".to_string(), "miner:m1".to_string()]);

        assert!(registry.reset("database"));
        assert!(!registry.reset("unknown"));
        assert_eq!(db.status(), CircuitStatus::Closed);
    }
}
