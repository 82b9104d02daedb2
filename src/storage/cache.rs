//! 查询结果缓存
//!
//! 有界、带 TTL。超出容量时淘汰创建时间最早的一条（按年龄 FIFO，不是严格 LRU）。
//!
//! 每次 `invalidate` 都会推进代数；读穿查询在 `fetch` 期间如果遇到失效，结果不写入缓存。

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// 缓存配置
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

/// 缓存统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

pub struct QueryCache<V> {
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    /// 只在持有 `entries` 锁时修改
    generation: AtomicU64,
    counters: CacheCounters,
}

impl<V: Clone> QueryCache<V> {
    /// 创建新的缓存，容量至少为 1
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config: CacheConfig {
                capacity: config.capacity.max(1),
                ..config
            },
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            counters: CacheCounters::default(),
        }
    }

    /// 由命名空间、查询和参数生成稳定的缓存键：`namespace:sha256(query|params)`
    pub fn key(namespace: &str, query: &str, params: &[String]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(query.as_bytes());
        for param in params {
            hasher.update(b"|");
            hasher.update(param.as_bytes());
        }
        format!("{}:{}", namespace, hex::encode(hasher.finalize()))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.lock();

        let expired = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.remove(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// 写入缓存，`ttl` 为空时使用默认值
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let entry = self.entry(value, ttl);
        let mut entries = self.lock();
        self.insert_locked(&mut entries, key.into(), entry);
    }

    /// 仅当期间没有发生过失效时写入，返回是否写入
    fn set_if_current(&self, key: &str, value: V, ttl: Option<Duration>, generation: u64) -> bool {
        let entry = self.entry(value, ttl);
        let mut entries = self.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        self.insert_locked(&mut entries, key.to_string(), entry);
        true
    }

    fn entry(&self, value: V, ttl: Option<Duration>) -> CacheEntry<V> {
        CacheEntry {
            value,
            created_at: Instant::now(),
            ttl: ttl.unwrap_or(self.config.default_ttl),
        }
    }

    fn insert_locked(&self, entries: &mut HashMap<String, CacheEntry<V>>, key: String, entry: CacheEntry<V>) {
        if !entries.contains_key(&key) && entries.len() >= self.config.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Query cache full, evicted {}", oldest);
            }
        }
        entries.insert(key, entry);
    }

    /// 删除键以 `prefix` 开头的条目；为空时清空缓存。返回删除的条数
    pub fn invalidate(&self, prefix: Option<&str>) -> usize {
        let mut entries = self.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let before = entries.len();
        match prefix {
            Some(prefix) => entries.retain(|key, _| !key.starts_with(prefix)),
            None => entries.clear(),
        }
        before - entries.len()
    }

    /// 清理所有过期条目
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));

        let purged = before - entries.len();
        self.counters.expirations.fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    /// 读穿：命中直接返回，未命中执行 `fetch` 并写入缓存
    ///
    /// `fetch` 执行期间不持有缓存锁；失败的结果不缓存，期间发生过失效的结果也不缓存。
    pub async fn get_or_try_insert<F, Fut, E>(&self, key: &str, ttl: Option<Duration>, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(value) = self.get(key) {
            debug!("Query cache hit: {}", key);
            return Ok(value);
        }

        let value = fetch().await?;
        if !self.set_if_current(key, value.clone(), ttl, generation) {
            debug!("Query cache invalidated during fetch, not caching {}", key);
        }
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }
}

impl<V: Clone + Send + 'static> QueryCache<V> {
    /// 启动定期清理任务，与访问模式无关
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!("Query cache sweep removed {} expired entries", purged);
                }
            }
        })
    }
}
