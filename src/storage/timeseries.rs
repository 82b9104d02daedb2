//! 时序存储
//!
//! 指标和状态只追加写入；保留策略把过期的明细样本压缩为小时聚合后删除。
//! 时间戳统一以 UTC 毫秒存储。

use crate::error::StorageError;
use crate::metrics::{
    flatten_metrics, from_millis, infer_unit, AggregateBucket, AggregationInterval, MetricMap, MetricSample,
    StatusSnapshot,
};
use crate::resilience::{RetryExecutor, RetryPolicy};
use crate::storage::cache::QueryCache;
use crate::storage::sqlite::{placeholders, Statement};
use crate::storage::transaction::AtomicTransactionExecutor;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DAY_MS: i64 = 86_400_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS miner_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    miner_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    metric_name TEXT NOT NULL,
    value REAL NOT NULL,
    unit TEXT
);
CREATE INDEX IF NOT EXISTS idx_miner_metrics_miner_time ON miner_metrics (miner_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_miner_metrics_time ON miner_metrics (timestamp);

CREATE TABLE IF NOT EXISTS miner_status (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    miner_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    status TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_miner_status_miner_time ON miner_status (miner_id, timestamp);

CREATE TABLE IF NOT EXISTS aggregated_metrics (
    miner_id TEXT NOT NULL,
    bucket_start INTEGER NOT NULL,
    bucket_interval TEXT NOT NULL,
    metric_name TEXT NOT NULL,
    avg_value REAL NOT NULL,
    min_value REAL NOT NULL,
    max_value REAL NOT NULL,
    sample_count INTEGER NOT NULL,
    unit TEXT,
    PRIMARY KEY (miner_id, bucket_start, bucket_interval, metric_name)
);
";

const INSERT_METRIC: &str =
    "INSERT INTO miner_metrics (miner_id, timestamp, metric_name, value, unit) VALUES (?1, ?2, ?3, ?4, ?5)";

// 主键保证同一小时窗口不会被重复聚合
const AGGREGATE_HOURLY: &str = "
INSERT OR IGNORE INTO aggregated_metrics
    (miner_id, bucket_start, bucket_interval, metric_name, avg_value, min_value, max_value, sample_count, unit)
SELECT miner_id, (timestamp / 3600000) * 3600000 AS bucket, 'hour', metric_name,
       AVG(value), MIN(value), MAX(value), COUNT(*), MAX(unit)
FROM miner_metrics
WHERE timestamp < ?1 AND timestamp >= ?2
GROUP BY miner_id, bucket, metric_name
";

/// 缓存的查询结果
#[derive(Debug, Clone)]
pub enum CachedQuery {
    Samples(Vec<MetricSample>),
    Buckets(Vec<AggregateBucket>),
    Status(Option<StatusSnapshot>),
}

/// 一次保留策略执行的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub aggregates_created: usize,
    pub samples_deleted: usize,
    pub statuses_deleted: usize,
    pub aggregates_deleted: usize,
}

#[derive(Debug)]
struct Accumulator {
    sum: f64,
    min: f64,
    max: f64,
    count: u64,
    unit: Option<String>,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            count: 0,
            unit: None,
        }
    }

    fn add(&mut self, sum: f64, min: f64, max: f64, count: u64, unit: Option<String>) {
        self.sum += sum;
        self.min = self.min.min(min);
        self.max = self.max.max(max);
        self.count += count;
        if self.unit.is_none() {
            self.unit = unit;
        }
    }
}

pub struct TimeSeriesStore {
    transactions: Arc<AtomicTransactionExecutor>,
    cache: Arc<QueryCache<CachedQuery>>,
    retry: RetryExecutor,
    policy: RetryPolicy,
}

impl TimeSeriesStore {
    /// 创建新的时序存储，所有数据库访问都经过 `policy`
    pub fn new(
        transactions: Arc<AtomicTransactionExecutor>,
        cache: Arc<QueryCache<CachedQuery>>,
        retry: RetryExecutor,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transactions,
            cache,
            retry,
            policy,
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache<CachedQuery>> {
        &self.cache
    }

    /// 建表（幂等）
    pub async fn init_schema(&self) -> Result<(), StorageError> {
        self.write(|tx| Ok(tx.execute_batch(SCHEMA)?)).await?;
        info!("Time-series schema ready");
        Ok(())
    }

    /// 保存一次采集的指标，返回写入的样本数
    ///
    /// 嵌套指标展平后入库，非数值叶子被丢弃。
    pub async fn save_metrics(
        &self,
        device_id: &str,
        metrics: &MetricMap,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<usize, StorageError> {
        validate_device_id(device_id)?;
        let timestamp = timestamp.unwrap_or_else(Utc::now).timestamp_millis();

        let flat = flatten_metrics(metrics);
        if flat.is_empty() {
            debug!("No numeric metrics to save for {}", device_id);
            return Ok(0);
        }

        let rows: Vec<Vec<Value>> = flat
            .into_iter()
            .map(|(name, value)| {
                let unit = infer_unit(&name).map_or(Value::Null, |unit| Value::Text(unit.to_string()));
                vec![
                    Value::Text(device_id.to_string()),
                    Value::Integer(timestamp),
                    Value::Text(name),
                    Value::Real(value),
                    unit,
                ]
            })
            .collect();

        let transactions = &self.transactions;
        let saved = self
            .retry
            .execute(&self.policy, || transactions.run_batch(INSERT_METRIC, rows.clone()))
            .await?;

        self.invalidate_device(device_id);
        debug!("Saved {} metrics for {}", saved, device_id);
        Ok(saved)
    }

    /// 保存一次状态快照
    pub async fn save_status(
        &self,
        device_id: &str,
        status: &serde_json::Value,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        validate_device_id(device_id)?;
        let timestamp = timestamp.unwrap_or_else(Utc::now).timestamp_millis();
        let blob = serde_json::to_string(status).map_err(|e| StorageError::InvalidArgument {
            reason: format!("status for {} is not serializable: {}", device_id, e),
        })?;

        let statement = Statement::new("INSERT INTO miner_status (miner_id, timestamp, status) VALUES (?1, ?2, ?3)")
            .bind(device_id.to_string())
            .bind(timestamp)
            .bind(blob);

        let transactions = &self.transactions;
        self.retry
            .execute(&self.policy, || transactions.run_transaction(vec![statement.clone()]))
            .await?;

        self.invalidate_device(device_id);
        Ok(())
    }

    /// 查询时间范围内（闭区间）的明细样本
    pub async fn query_range(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        metric_names: Option<&[String]>,
    ) -> Result<Vec<MetricSample>, StorageError> {
        validate_range(start, end)?;
        let (start_ms, end_ms) = (start.timestamp_millis(), end.timestamp_millis());
        let names = metric_names.map(<[String]>::to_vec).unwrap_or_default();

        let key = QueryCache::<CachedQuery>::key(
            &cache_namespace(device_id),
            "range",
            &[start_ms.to_string(), end_ms.to_string(), names.join(",")],
        );
        let device = device_id.to_string();

        let result = self
            .cache
            .get_or_try_insert(&key, None, || async move {
                let samples = self
                    .read(move |conn| {
                        let mut sql = String::from(
                            "SELECT timestamp, metric_name, value, unit FROM miner_metrics \
                             WHERE miner_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3",
                        );
                        let mut params = vec![
                            Value::Text(device.clone()),
                            Value::Integer(start_ms),
                            Value::Integer(end_ms),
                        ];
                        push_name_filter(&mut sql, &mut params, &names);
                        sql.push_str(" ORDER BY timestamp ASC, metric_name ASC");

                        let mut stmt = conn.prepare_cached(&sql)?;
                        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
                            Ok(MetricSample {
                                device_id: device.clone(),
                                timestamp: from_millis(row.get(0)?),
                                metric_name: row.get(1)?,
                                value: row.get(2)?,
                                unit: row.get(3)?,
                            })
                        })?;
                        Ok(rows.collect::<Result<Vec<_>, _>>()?)
                    })
                    .await?;
                Ok::<_, StorageError>(CachedQuery::Samples(samples))
            })
            .await;

        match result {
            Ok(CachedQuery::Samples(samples)) => Ok(samples),
            Ok(_) => Err(self.cache_mismatch(&key)),
            Err(e) if e.is_missing_table() => {
                warn!("Metrics table missing, returning no samples for {}", device_id);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// 按日历对齐的窗口聚合
    ///
    /// 小时和天粒度会合并保留策略生成的小时聚合（按样本数加权）。
    pub async fn query_aggregated(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: AggregationInterval,
        metric_names: Option<&[String]>,
    ) -> Result<Vec<AggregateBucket>, StorageError> {
        validate_range(start, end)?;
        let (start_ms, end_ms) = (start.timestamp_millis(), end.timestamp_millis());
        let names = metric_names.map(<[String]>::to_vec).unwrap_or_default();

        let key = QueryCache::<CachedQuery>::key(
            &cache_namespace(device_id),
            "aggregated",
            &[
                start_ms.to_string(),
                end_ms.to_string(),
                interval.as_str().to_string(),
                names.join(","),
            ],
        );
        let device = device_id.to_string();

        let result = self
            .cache
            .get_or_try_insert(&key, None, || async move {
                let buckets = self
                    .read(move |conn| aggregate(conn, &device, start_ms, end_ms, interval, &names))
                    .await?;
                Ok::<_, StorageError>(CachedQuery::Buckets(buckets))
            })
            .await;

        match result {
            Ok(CachedQuery::Buckets(buckets)) => Ok(buckets),
            Ok(_) => Err(self.cache_mismatch(&key)),
            Err(e) if e.is_missing_table() => {
                warn!("Metrics tables missing, returning no aggregates for {}", device_id);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// 设备最近一次状态
    pub async fn latest_status(&self, device_id: &str) -> Result<Option<StatusSnapshot>, StorageError> {
        let key = QueryCache::<CachedQuery>::key(&cache_namespace(device_id), "latest_status", &[]);
        let device = device_id.to_string();

        let result = self
            .cache
            .get_or_try_insert(&key, None, || async move {
                let snapshot = self
                    .read(move |conn| {
                        let row = conn
                            .query_row(
                                "SELECT timestamp, status FROM miner_status WHERE miner_id = ?1 \
                                 ORDER BY timestamp DESC, id DESC LIMIT 1",
                                [&device],
                                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                            )
                            .optional()?;

                        Ok(row.map(|(timestamp, blob)| StatusSnapshot {
                            device_id: device.clone(),
                            timestamp: from_millis(timestamp),
                            status: serde_json::from_str(&blob).unwrap_or(serde_json::Value::String(blob)),
                        }))
                    })
                    .await?;
                Ok::<_, StorageError>(CachedQuery::Status(snapshot))
            })
            .await;

        match result {
            Ok(CachedQuery::Status(snapshot)) => Ok(snapshot),
            Ok(_) => Err(self.cache_mismatch(&key)),
            Err(e) if e.is_missing_table() => {
                warn!("Status table missing, no status for {}", device_id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// 每个指标的最新值
    pub async fn latest_metrics(&self, device_id: &str) -> Result<Vec<MetricSample>, StorageError> {
        let key = QueryCache::<CachedQuery>::key(&cache_namespace(device_id), "latest_metrics", &[]);
        let device = device_id.to_string();

        let result = self
            .cache
            .get_or_try_insert(&key, None, || async move {
                let samples = self
                    .read(move |conn| {
                        let mut stmt = conn.prepare_cached(
                            "SELECT m.timestamp, m.metric_name, m.value, m.unit FROM miner_metrics m
                             JOIN (SELECT metric_name, MAX(timestamp) AS ts FROM miner_metrics
                                   WHERE miner_id = ?1 GROUP BY metric_name) latest
                               ON m.metric_name = latest.metric_name AND m.timestamp = latest.ts
                             WHERE m.miner_id = ?1
                             ORDER BY m.metric_name ASC, m.id ASC",
                        )?;
                        let rows = stmt.query_map([&device], |row| {
                            Ok(MetricSample {
                                device_id: device.clone(),
                                timestamp: from_millis(row.get(0)?),
                                metric_name: row.get(1)?,
                                value: row.get(2)?,
                                unit: row.get(3)?,
                            })
                        })?;

                        // 同一时间戳重复写入时保留最后一条
                        let mut latest = BTreeMap::new();
                        for sample in rows {
                            let sample = sample?;
                            latest.insert(sample.metric_name.clone(), sample);
                        }
                        Ok(latest.into_values().collect::<Vec<_>>())
                    })
                    .await?;
                Ok::<_, StorageError>(CachedQuery::Samples(samples))
            })
            .await;

        match result {
            Ok(CachedQuery::Samples(samples)) => Ok(samples),
            Ok(_) => Err(self.cache_mismatch(&key)),
            Err(e) if e.is_missing_table() => {
                warn!("Metrics table missing, no latest metrics for {}", device_id);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// 有数据的设备列表
    pub async fn device_ids(&self) -> Result<Vec<String>, StorageError> {
        let result = self
            .read(|conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT miner_id FROM miner_metrics UNION SELECT miner_id FROM miner_status ORDER BY 1",
                )?;
                let ids = stmt.query_map([], |row| row.get::<_, String>(0))?;
                Ok(ids.collect::<Result<Vec<_>, _>>()?)
            })
            .await;

        match result {
            Err(e) if e.is_missing_table() => Ok(Vec::new()),
            other => other,
        }
    }

    /// 执行保留策略
    pub async fn apply_retention_policy(
        &self,
        detailed_days: u32,
        aggregated_days: u32,
        status_days: u32,
    ) -> Result<RetentionReport, StorageError> {
        self.apply_retention_policy_at(Utc::now(), detailed_days, aggregated_days, status_days)
            .await
    }

    /// 以 `now` 为基准执行保留策略
    ///
    /// 1. 把明细截止点之前、聚合截止点之后的样本压缩为小时聚合（已有的窗口跳过）
    /// 2. 删除明细截止点之前的样本
    /// 3. 删除状态截止点之前的状态快照
    /// 4. 删除聚合截止点之前的小时聚合
    ///
    /// 明细截止点向下取整到整点，只聚合完整的小时。整个过程在一个事务内完成，可重复执行。
    pub async fn apply_retention_policy_at(
        &self,
        now: DateTime<Utc>,
        detailed_days: u32,
        aggregated_days: u32,
        status_days: u32,
    ) -> Result<RetentionReport, StorageError> {
        if aggregated_days < detailed_days {
            return Err(StorageError::InvalidArgument {
                reason: format!(
                    "aggregated retention ({} days) shorter than detailed retention ({} days)",
                    aggregated_days, detailed_days
                ),
            });
        }

        let hour = AggregationInterval::Hour;
        let now_ms = now.timestamp_millis();
        let detailed_cutoff = hour.bucket_start_ms(now_ms - i64::from(detailed_days) * DAY_MS);
        let aggregated_cutoff = hour.bucket_start_ms(now_ms - i64::from(aggregated_days) * DAY_MS);
        let status_cutoff = now_ms - i64::from(status_days) * DAY_MS;

        let report = self
            .write(move |tx| {
                let aggregates_created = tx.execute(AGGREGATE_HOURLY, params![detailed_cutoff, aggregated_cutoff])?;
                let samples_deleted = tx.execute("DELETE FROM miner_metrics WHERE timestamp < ?1", [detailed_cutoff])?;
                let statuses_deleted = tx.execute("DELETE FROM miner_status WHERE timestamp < ?1", [status_cutoff])?;
                let aggregates_deleted =
                    tx.execute("DELETE FROM aggregated_metrics WHERE bucket_start < ?1", [aggregated_cutoff])?;

                Ok(RetentionReport {
                    aggregates_created,
                    samples_deleted,
                    statuses_deleted,
                    aggregates_deleted,
                })
            })
            .await?;

        self.cache.invalidate(None);
        info!(
            "Retention sweep: {} aggregates created, {} samples, {} statuses, {} aggregates deleted",
            report.aggregates_created, report.samples_deleted, report.statuses_deleted, report.aggregates_deleted
        );
        Ok(report)
    }

    async fn read<F, R>(&self, f: F) -> Result<R, StorageError>
    where
        F: Fn(&mut Connection) -> Result<R, StorageError> + Clone + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.transactions.pool();
        self.retry
            .execute(&self.policy, || {
                let f = f.clone();
                async move {
                    let mut conn = pool.acquire().await?;
                    conn.run(f).await
                }
            })
            .await
    }

    async fn write<F, R>(&self, f: F) -> Result<R, StorageError>
    where
        F: Fn(&Transaction<'_>) -> Result<R, StorageError> + Clone + Send + 'static,
        R: Send + 'static,
    {
        let transactions = &self.transactions;
        self.retry
            .execute(&self.policy, || transactions.run_with(f.clone()))
            .await
    }

    fn invalidate_device(&self, device_id: &str) {
        let dropped = self.cache.invalidate(Some(&format!("{}:", cache_namespace(device_id))));
        if dropped > 0 {
            debug!("Invalidated {} cached queries for {}", dropped, device_id);
        }
    }

    fn cache_mismatch(&self, key: &str) -> StorageError {
        self.cache.invalidate(Some(key));
        StorageError::InvalidArgument {
            reason: format!("cached entry {} has an unexpected shape", key),
        }
    }
}

fn cache_namespace(device_id: &str) -> String {
    format!("miner:{}", device_id)
}

fn validate_device_id(device_id: &str) -> Result<(), StorageError> {
    if device_id.trim().is_empty() {
        return Err(StorageError::InvalidArgument {
            reason: "device id must not be empty".to_string(),
        });
    }
    Ok(())
}

fn validate_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), StorageError> {
    if end < start {
        return Err(StorageError::InvalidArgument {
            reason: format!("range end {} is before start {}", end, start),
        });
    }
    Ok(())
}

fn push_name_filter(sql: &mut String, params: &mut Vec<Value>, names: &[String]) {
    if names.is_empty() {
        return;
    }
    sql.push_str(&format!(
        " AND metric_name IN ({})",
        placeholders(params.len() + 1, names.len())
    ));
    params.extend(names.iter().cloned().map(Value::Text));
}

fn aggregate(
    conn: &mut Connection,
    device_id: &str,
    start_ms: i64,
    end_ms: i64,
    interval: AggregationInterval,
    names: &[String],
) -> Result<Vec<AggregateBucket>, StorageError> {
    let mut buckets: BTreeMap<(i64, String), Accumulator> = BTreeMap::new();

    let mut sql = String::from(
        "SELECT (timestamp / ?4) * ?4 AS bucket, metric_name, SUM(value), MIN(value), MAX(value), COUNT(*), MAX(unit) \
         FROM miner_metrics WHERE miner_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3",
    );
    let mut params = vec![
        Value::Text(device_id.to_string()),
        Value::Integer(start_ms),
        Value::Integer(end_ms),
        Value::Integer(interval.width_ms()),
    ];
    push_name_filter(&mut sql, &mut params, names);
    sql.push_str(" GROUP BY bucket, metric_name");

    {
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        while let Some(row) = rows.next()? {
            let bucket: i64 = row.get(0)?;
            let count: i64 = row.get(5)?;
            buckets
                .entry((interval.bucket_start_ms(bucket), row.get(1)?))
                .or_insert_with(Accumulator::new)
                .add(row.get(2)?, row.get(3)?, row.get(4)?, count.max(0) as u64, row.get(6)?);
        }
    }

    // 明细被清理后只剩小时聚合
    if matches!(interval, AggregationInterval::Hour | AggregationInterval::Day) {
        let mut sql = String::from(
            "SELECT bucket_start, metric_name, avg_value, min_value, max_value, sample_count, unit \
             FROM aggregated_metrics \
             WHERE miner_id = ?1 AND bucket_interval = 'hour' AND bucket_start >= ?2 AND bucket_start <= ?3",
        );
        let mut params = vec![
            Value::Text(device_id.to_string()),
            Value::Integer(AggregationInterval::Hour.bucket_start_ms(start_ms)),
            Value::Integer(end_ms),
        ];
        push_name_filter(&mut sql, &mut params, names);

        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        while let Some(row) = rows.next()? {
            let bucket: i64 = row.get(0)?;
            let avg: f64 = row.get(2)?;
            let count: i64 = row.get(5)?;
            let count = count.max(0) as u64;
            buckets
                .entry((interval.bucket_start_ms(bucket), row.get(1)?))
                .or_insert_with(Accumulator::new)
                .add(avg * count as f64, row.get(3)?, row.get(4)?, count, row.get(6)?);
        }
    }

    Ok(buckets
        .into_iter()
        .filter(|(_, acc)| acc.count > 0)
        .map(|((bucket, metric_name), acc)| AggregateBucket {
            device_id: device_id.to_string(),
            bucket_start: from_millis(bucket),
            metric_name,
            avg: acc.sum / acc.count as f64,
            min: acc.min,
            max: acc.max,
            sample_count: acc.count,
            unit: acc.unit,
        })
        .collect())
}
