//! 自愈连接池
//!
//! 已创建连接数（空闲 + 借出）始终不超过 `max_connections`。
//! 借出前做一次健康检查，失败的连接直接丢弃并补建；
//! 使用中出错的连接不归还（fail-closed），正常归还前再检查一次。
//! 借出中途被取消的 `acquire` 不会提前释放名额，准备好的连接回到空闲队列。

use crate::error::StorageError;
use crate::resilience::{RetryExecutor, RetryPolicy};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 连接管理器
///
/// 所有方法都是同步的，连接池在阻塞线程池里调用它们。
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// 建立新连接
    fn connect(&self) -> Result<Self::Connection, StorageError>;

    /// 一次简单的往返检查
    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), StorageError>;

    /// 不做 I/O 的快速损坏检查
    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }

    /// 关闭连接
    fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// 连接池配置
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub acquire_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

/// 连接池统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub max_connections: usize,
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub discarded: u64,
    pub timeouts: u64,
}

struct PoolState<C> {
    idle: VecDeque<C>,
    total: usize,
    closed: bool,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    discarded: AtomicU64,
    timeouts: AtomicU64,
}

struct Shared<M: ConnectionManager> {
    manager: Arc<M>,
    config: PoolConfig,
    state: Mutex<PoolState<M::Connection>>,
    released: Notify,
    retry: RetryExecutor,
    connect_policy: RetryPolicy,
    counters: PoolCounters,
}

impl<M: ConnectionManager> Shared<M> {
    fn lock(&self) -> MutexGuard<'_, PoolState<M::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 释放一个名额（连接已经不存在）
    fn release_slot(&self) {
        {
            let mut state = self.lock();
            state.total = state.total.saturating_sub(1);
        }
        self.released.notify_one();
    }

    fn discard(&self, conn: M::Connection, reason: &str) {
        debug!("Discarding database connection: {}", reason);
        self.manager.close(conn);
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        self.release_slot();
    }

    fn push_idle(&self, conn: M::Connection) {
        let rejected = {
            let mut state = self.lock();
            if state.closed {
                Some(conn)
            } else {
                state.idle.push_back(conn);
                None
            }
        };

        match rejected {
            Some(conn) => self.discard(conn, "pool is shut down"),
            None => self.released.notify_one(),
        }
    }

    /// 在阻塞线程里做健康检查，返回健康的连接
    async fn validate(self: &Arc<Self>, conn: M::Connection) -> Result<Option<M::Connection>, StorageError> {
        let manager = self.manager.clone();
        let (conn, health) = tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            let health = manager.is_valid(&mut conn);
            (conn, health)
        })
        .await?;

        match health {
            Ok(()) => Ok(Some(conn)),
            Err(e) => {
                warn!("Database connection failed health check: {}", e);
                self.discard(conn, "failed health check");
                Ok(None)
            }
        }
    }

    /// 通过重试引擎建立并检查新连接
    async fn create(&self) -> Result<M::Connection, StorageError> {
        let conn = self
            .retry
            .execute(&self.connect_policy, || {
                let manager = self.manager.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        let mut conn = manager.connect()?;
                        if let Err(e) = manager.is_valid(&mut conn) {
                            manager.close(conn);
                            return Err(StorageError::DatabaseConnection {
                                reason: format!("new connection failed health check: {}", e),
                            });
                        }
                        Ok::<_, StorageError>(conn)
                    })
                    .await?
                }
            })
            .await?;

        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    fn lend(self: &Arc<Self>, conn: M::Connection) -> PooledConnection<M> {
        PooledConnection {
            conn: Some(conn),
            shared: self.clone(),
            broken: false,
        }
    }

    /// 在独立任务里检查或新建连接
    ///
    /// 名额在任务结束前一直被占用。调用方中途放弃时，准备好的连接由任务归还到池中。
    fn spawn_checkout(self: &Arc<Self>, checkout: Checkout<M::Connection>) -> oneshot::Receiver<Prepared<M>> {
        let (tx, rx) = oneshot::channel();
        let shared = self.clone();

        tokio::spawn(async move {
            let prepared = match checkout {
                Checkout::Validate(conn) => shared.validate(conn).await,
                Checkout::Create => shared.create().await.map(|conn| {
                    debug!("Opened new database connection");
                    Some(conn)
                }),
            };

            let prepared = match prepared {
                Ok(conn) => Ok(conn.map(|conn| shared.lend(conn))),
                Err(e) => {
                    shared.release_slot();
                    Err(e)
                }
            };

            if tx.send(prepared).is_err() {
                debug!("Connection acquirer went away, returning connection to the pool");
            }
        });

        rx
    }

    /// 归还连接：检查通过后放回空闲队列
    async fn check_in(self: Arc<Self>, conn: M::Connection) {
        match self.validate(conn).await {
            Ok(Some(conn)) => self.push_idle(conn),
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to check connection back in: {}", e);
                self.release_slot();
            }
        }
    }

    fn check_in_blocking(&self, conn: M::Connection) {
        let mut conn = conn;
        match self.manager.is_valid(&mut conn) {
            Ok(()) => self.push_idle(conn),
            Err(e) => {
                warn!("Database connection failed health check: {}", e);
                self.discard(conn, "failed health check");
            }
        }
    }

    /// 重新检查所有空闲连接
    async fn revalidate_idle(self: &Arc<Self>) -> (usize, usize) {
        let drained: Vec<M::Connection> = {
            let mut state = self.lock();
            state.idle.drain(..).collect()
        };

        let mut healthy = 0;
        let mut discarded = 0;
        for conn in drained {
            match self.validate(conn).await {
                Ok(Some(conn)) => {
                    healthy += 1;
                    self.push_idle(conn);
                }
                Ok(None) => discarded += 1,
                Err(e) => {
                    warn!("Idle connection check failed: {}", e);
                    discarded += 1;
                    self.release_slot();
                }
            }
        }

        (healthy, discarded)
    }
}

/// 借出前的准备工作
enum Checkout<C> {
    Validate(C),
    Create,
}

enum Step<C> {
    Checkout(Checkout<C>),
    Wait,
}

type Prepared<M> = Result<Option<PooledConnection<M>>, StorageError>;

/// 有界连接池
pub struct ConnectionPool<M: ConnectionManager> {
    shared: Arc<Shared<M>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl<M: ConnectionManager> ConnectionPool<M> {
    /// 创建新的连接池（不预建连接）
    pub fn new(manager: M, config: PoolConfig, retry: RetryExecutor, connect_policy: RetryPolicy) -> Self {
        let config = PoolConfig {
            max_connections: config.max_connections.max(1),
            ..config
        };

        Self {
            shared: Arc::new(Shared {
                manager: Arc::new(manager),
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    closed: false,
                }),
                released: Notify::new(),
                retry,
                connect_policy,
                counters: PoolCounters::default(),
            }),
            health_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// 借出一个连接，离开作用域时自动归还
    ///
    /// 池满时最多等待 `acquire_timeout`，超时返回 [`StorageError::DatabaseTimeout`]。
    pub async fn acquire(&self) -> Result<PooledConnection<M>, StorageError> {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.config.acquire_timeout;

        loop {
            // 先登记等待，再检查状态，避免错过检查与等待之间的归还通知
            let notified = shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = shared.lock();
                if state.closed {
                    return Err(StorageError::PoolClosed);
                }
                if let Some(conn) = state.idle.pop_front() {
                    Step::Checkout(Checkout::Validate(conn))
                } else if state.total < shared.config.max_connections {
                    state.total += 1;
                    Step::Checkout(Checkout::Create)
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Checkout(checkout) => match shared.spawn_checkout(checkout).await {
                    Ok(Ok(Some(conn))) => return Ok(conn),
                    // 健康检查失败，名额已经释放
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        return Err(StorageError::DatabaseConnection {
                            reason: "connection checkout task ended unexpectedly".to_string(),
                        })
                    }
                },
                Step::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        shared.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "Timed out after {:?} waiting for a database connection",
                            shared.config.acquire_timeout
                        );
                        return Err(StorageError::DatabaseTimeout {
                            waited: shared.config.acquire_timeout,
                        });
                    }
                }
            }
        }
    }

    /// 启动后台健康检查任务
    pub fn start_health_checks(&self) {
        let mut task = self.health_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        let shared = self.shared.clone();
        let period = shared.config.health_check_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if shared.lock().closed {
                    break;
                }
                let (healthy, discarded) = shared.revalidate_idle().await;
                if discarded > 0 {
                    warn!("Pool health check: {} healthy, {} discarded", healthy, discarded);
                } else {
                    debug!("Pool health check: {} idle connections healthy", healthy);
                }
            }
        }));
    }

    /// 立即检查所有空闲连接，返回 (健康, 丢弃)
    pub async fn check_idle_connections(&self) -> (usize, usize) {
        self.shared.revalidate_idle().await
    }

    /// 关闭连接池：停止后台任务并关闭所有连接
    ///
    /// 借出中的连接在归还时关闭。
    pub fn shutdown(&self) {
        if let Some(task) = self.health_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }

        let drained: Vec<M::Connection> = {
            let mut state = self.shared.lock();
            state.closed = true;
            let drained: Vec<M::Connection> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };

        let closed = drained.len();
        for conn in drained {
            self.shared.manager.close(conn);
        }
        self.shared.released.notify_waiters();
        info!("Connection pool shut down, closed {} idle connections", closed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// 获取统计信息
    pub fn stats(&self) -> PoolStats {
        let (total, idle) = {
            let state = self.shared.lock();
            (state.total, state.idle.len())
        };

        PoolStats {
            max_connections: self.shared.config.max_connections,
            total,
            idle,
            in_use: total.saturating_sub(idle),
            created: self.shared.counters.created.load(Ordering::Relaxed),
            discarded: self.shared.counters.discarded.load(Ordering::Relaxed),
            timeouts: self.shared.counters.timeouts.load(Ordering::Relaxed),
        }
    }
}

impl<M: ConnectionManager> Drop for ConnectionPool<M> {
    fn drop(&mut self) {
        if let Some(task) = self.health_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

/// 借出的连接
///
/// 同一时刻只属于一个调用方；drop 时自动归还或丢弃。
pub struct PooledConnection<M: ConnectionManager> {
    conn: Option<M::Connection>,
    shared: Arc<Shared<M>>,
    broken: bool,
}

impl<M: ConnectionManager> PooledConnection<M> {
    /// 在阻塞线程里使用连接
    ///
    /// 闭包返回错误时连接被标记为损坏，归还时直接关闭。
    pub async fn run<F, R>(&mut self, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut M::Connection) -> Result<R, StorageError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.take().ok_or_else(|| StorageError::DatabaseConnection {
            reason: "connection lost by a cancelled operation".to_string(),
        })?;

        // 阻塞任务持有连接期间由它负责归还，调用方被取消时名额不会提前释放
        let mut lent = self.shared.lend(conn);
        let was_broken = self.broken;
        let joined = tokio::task::spawn_blocking(move || {
            lent.broken = true;
            let result = match lent.conn.as_mut() {
                Some(conn) => f(conn),
                None => Err(StorageError::DatabaseConnection {
                    reason: "connection lost by a cancelled operation".to_string(),
                }),
            };
            lent.broken = was_broken || result.is_err();
            (lent, result)
        })
        .await;

        let (mut lent, result) = match joined {
            Ok(pair) => pair,
            Err(e) => return Err(e.into()),
        };

        self.conn = lent.conn.take();
        self.broken = lent.broken;
        result
    }

    /// 标记为损坏，归还时关闭而不是放回池中
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        // 连接在阻塞任务里，由它归还
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        if self.broken || self.shared.manager.has_broken(&mut conn) {
            self.shared.discard(conn, "failed during use");
            return;
        }

        let shared = self.shared.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(shared.check_in(conn));
            }
            Err(_) => shared.check_in_blocking(conn),
        }
    }
}
