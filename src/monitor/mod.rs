//! 监控编排
//!
//! 数据流：采集器 → SharedStateStore.update → TimeSeriesStore.save → SubscriptionRegistry.broadcast

pub mod collector;

pub use collector::{MinerCollector, MinerPoll};

use crate::config::Config;
use crate::error::{ConfigError, ErrorStats, HashwatchError, StorageError};
use crate::metrics::flatten_metrics;
use crate::resilience::{resources, BreakerRegistry, RetryExecutor};
use crate::state::{miner_topic, SharedStateStore, SubscriptionRegistry, ALL_MINERS_TOPIC};
use crate::storage::{
    AtomicTransactionExecutor, CachedQuery, ConnectionPool, QueryCache, RetentionReport, SqliteManager,
    TimeSeriesStore,
};
use crate::{miner_info, miner_warn};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// 启动时构建一次的组件集合，显式注入到需要的地方
pub struct MonitorContext {
    pub config: Config,
    pub breakers: Arc<BreakerRegistry>,
    pub retry: RetryExecutor,
    pub pool: Arc<ConnectionPool<SqliteManager>>,
    pub cache: Arc<QueryCache<CachedQuery>>,
    pub transactions: Arc<AtomicTransactionExecutor>,
    pub state: Arc<SharedStateStore>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub store: Arc<TimeSeriesStore>,
    errors: std::sync::Mutex<ErrorStats>,
}

impl MonitorContext {
    /// 按配置构建所有组件并建表
    pub async fn from_config(config: Config) -> Result<Self, HashwatchError> {
        config.validate().map_err(|e| ConfigError::ValidationError {
            field: "config".to_string(),
            reason: e.to_string(),
        })?;

        let breakers = Arc::new(config.breaker_registry());
        let retry = RetryExecutor::new(breakers.clone());
        let pool = Arc::new(ConnectionPool::new(
            config.sqlite_manager(),
            config.pool_config(),
            retry.clone(),
            config.retry.policy(resources::DATABASE_CONNECT),
        ));
        let cache = Arc::new(QueryCache::new(config.cache_config()));
        let transactions = Arc::new(AtomicTransactionExecutor::new(pool.clone()));
        let store = Arc::new(TimeSeriesStore::new(
            transactions.clone(),
            cache.clone(),
            retry.clone(),
            config.retry.policy(resources::DATABASE),
        ));

        store.init_schema().await?;
        info!("Storage ready at {}", config.database.path.display());

        Ok(Self {
            config,
            breakers,
            retry,
            pool,
            cache,
            transactions,
            state: Arc::new(SharedStateStore::new()),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            store,
            errors: std::sync::Mutex::new(ErrorStats::default()),
        })
    }

    /// 处理一次轮询结果
    pub async fn ingest(&self, device_id: &str, poll: MinerPoll) -> Result<(), HashwatchError> {
        let mut attributes: Map<String, Value> = flatten_metrics(&poll.metrics)
            .into_iter()
            .map(|(name, value)| (name, json!(value)))
            .collect();
        attributes.insert("status".to_string(), poll.status.clone());
        attributes.insert("online".to_string(), Value::Bool(true));

        let record = self.state.update(device_id, attributes).await;
        let observed_at = Some(record.last_updated);

        self.store.save_metrics(device_id, &poll.metrics, observed_at).await?;
        self.store.save_status(device_id, &poll.status, observed_at).await?;

        let payload = serde_json::to_value(&record).unwrap_or_default();
        self.subscriptions.broadcast(&miner_topic(device_id), payload.clone()).await;
        self.subscriptions.broadcast(ALL_MINERS_TOPIC, payload).await;
        Ok(())
    }

    /// 通过设备自己的熔断器轮询一次并入库
    pub async fn poll_collector(&self, collector: &dyn MinerCollector) -> Result<(), HashwatchError> {
        let device_id = collector.device_id();
        let policy = self
            .config
            .retry
            .policy(resources::MINER_IO)
            .with_breaker(resources::miner(device_id));

        let result = match self.retry.execute(&policy, || collector.poll()).await {
            Ok(poll) => self.ingest(device_id, poll).await,
            Err(e) => {
                let mut offline = Map::new();
                offline.insert("online".to_string(), Value::Bool(false));
                offline.insert("last_error".to_string(), Value::String(e.to_string()));
                self.state.update(device_id, offline).await;
                Err(e.into())
            }
        };

        if let Err(e) = &result {
            self.record_error(e);
            miner_warn!(device_id, "Poll failed: {}", e);
        }
        result
    }

    /// 按配置执行一次保留策略
    pub async fn run_retention(&self) -> Result<RetentionReport, StorageError> {
        let retention = &self.config.retention;
        let result = self
            .store
            .apply_retention_policy(retention.detailed_days, retention.aggregated_days, retention.status_days)
            .await;

        if let Err(e) = &result {
            self.record_error(e);
        }
        result
    }

    fn record_error<E: crate::error::Classify>(&self, error: &E) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_error(error);
    }

    pub fn error_stats(&self) -> ErrorStats {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// 监控管理器
pub struct MonitorManager {
    context: Arc<MonitorContext>,
    collectors: Arc<RwLock<HashMap<String, Arc<dyn MinerCollector>>>>,
    running: Arc<RwLock<bool>>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    retention_handle: Mutex<Option<JoinHandle<()>>>,
    sweeper_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorManager {
    /// 创建新的监控管理器
    pub fn new(context: Arc<MonitorContext>) -> Self {
        Self {
            context,
            collectors: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(RwLock::new(false)),
            poll_handle: Mutex::new(None),
            retention_handle: Mutex::new(None),
            sweeper_handle: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<MonitorContext> {
        &self.context
    }

    /// 注册采集器，同 id 的旧采集器被替换
    pub async fn register(&self, collector: Arc<dyn MinerCollector>) {
        let device_id = collector.device_id().to_string();
        if self.collectors.write().await.insert(device_id.clone(), collector).is_some() {
            debug!("Replaced collector for {}", device_id);
        }
        miner_info!(device_id, "Collector registered");
    }

    /// 注销设备，删除其当前状态
    pub async fn deregister(&self, device_id: &str) -> bool {
        let had_collector = self.collectors.write().await.remove(device_id).is_some();
        let had_record = self.context.state.remove(device_id).await.is_some();

        if had_collector || had_record {
            self.context
                .subscriptions
                .broadcast(ALL_MINERS_TOPIC, json!({ "device_id": device_id, "removed": true }))
                .await;
            miner_info!(device_id, "Miner deregistered");
        }
        had_collector || had_record
    }

    pub async fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.collectors.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn ingest(&self, device_id: &str, poll: MinerPoll) -> Result<(), HashwatchError> {
        self.context.ingest(device_id, poll).await
    }

    /// 并发轮询所有设备一次，返回成功的数量
    pub async fn poll_once(&self) -> usize {
        poll_all(&self.context, &self.collectors).await
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// 启动轮询、保留策略、缓存清理和连接池健康检查
    pub async fn start(&self) -> Result<(), HashwatchError> {
        if *self.running.read().await {
            warn!("Monitor is already running");
            return Ok(());
        }

        info!("Starting monitor");
        *self.running.write().await = true;

        self.start_polling().await;
        self.start_retention().await;

        let sweep_interval = Duration::from_secs(self.context.config.cache.sweep_interval_secs);
        *self.sweeper_handle.lock().await = Some(self.context.cache.spawn_sweeper(sweep_interval));
        self.context.pool.start_health_checks();

        info!("Monitor started");
        Ok(())
    }

    /// 停止所有后台任务并关闭连接池
    pub async fn stop(&self) -> Result<(), HashwatchError> {
        if !*self.running.read().await {
            warn!("Monitor is not running");
            return Ok(());
        }

        info!("Stopping monitor");
        *self.running.write().await = false;

        for handle in [&self.poll_handle, &self.retention_handle, &self.sweeper_handle] {
            if let Some(handle) = handle.lock().await.take() {
                handle.abort();
            }
        }
        self.context.pool.shutdown();

        info!("Monitor stopped");
        Ok(())
    }

    async fn start_polling(&self) {
        let running = self.running.clone();
        let context = self.context.clone();
        let collectors = self.collectors.clone();
        let poll_interval = Duration::from_secs(self.context.config.monitor.poll_interval_secs);

        let handle = tokio::spawn(async move {
            let mut interval = interval(poll_interval);

            while *running.read().await {
                interval.tick().await;

                let started = tokio::time::Instant::now();
                let polled = poll_all(&context, &collectors).await;
                debug!("Poll cycle: {} miners ok in {:?}", polled, started.elapsed());
            }
        });

        *self.poll_handle.lock().await = Some(handle);
    }

    async fn start_retention(&self) {
        let running = self.running.clone();
        let context = self.context.clone();
        let sweep_interval = Duration::from_secs(self.context.config.retention.sweep_interval_secs);

        let handle = tokio::spawn(async move {
            let mut interval = interval(sweep_interval);

            while *running.read().await {
                interval.tick().await;

                if let Err(e) = context.run_retention().await {
                    error!("Retention sweep failed: {}", e);
                }
            }
        });

        *self.retention_handle.lock().await = Some(handle);
    }
}

async fn poll_all(
    context: &MonitorContext,
    collectors: &RwLock<HashMap<String, Arc<dyn MinerCollector>>>,
) -> usize {
    let snapshot: Vec<Arc<dyn MinerCollector>> = collectors.read().await.values().cloned().collect();

    join_all(snapshot.iter().map(|collector| context.poll_collector(collector.as_ref())))
        .await
        .into_iter()
        .filter(Result::is_ok)
        .count()
}
