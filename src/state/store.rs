//! 设备当前状态
//!
//! 读操作共享读锁，写操作独占写锁；`update` 的读-改-写全程持有写锁。
//! 返回的记录都是副本。

use crate::error::StateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// 设备的最新记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerRecord {
    pub device_id: String,
    pub attributes: Map<String, Value>,
    pub last_updated: DateTime<Utc>,
}

impl MinerRecord {
    pub fn new(device_id: impl Into<String>, attributes: Map<String, Value>) -> Self {
        Self {
            device_id: device_id.into(),
            attributes,
            last_updated: Utc::now(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

#[derive(Default)]
pub struct SharedStateStore {
    records: RwLock<HashMap<String, MinerRecord>>,
}

impl SharedStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, device_id: &str) -> Option<MinerRecord> {
        self.records.read().await.get(device_id).cloned()
    }

    /// 所有记录，按设备 id 排序
    pub async fn get_all(&self) -> Vec<MinerRecord> {
        let mut records: Vec<MinerRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        records
    }

    /// 整体替换设备记录
    pub async fn set(&self, device_id: &str, attributes: Map<String, Value>) -> MinerRecord {
        let record = MinerRecord::new(device_id, attributes);
        self.records
            .write()
            .await
            .insert(device_id.to_string(), record.clone());
        record
    }

    /// 合并部分字段，返回合并后的记录
    ///
    /// 设备第一次出现时创建记录。
    pub async fn update(&self, device_id: &str, partial: Map<String, Value>) -> MinerRecord {
        let mut records = self.records.write().await;
        let record = records.entry(device_id.to_string()).or_insert_with(|| {
            debug!("First observation of miner {}", device_id);
            MinerRecord::new(device_id, Map::new())
        });

        record.attributes.extend(partial);
        record.last_updated = Utc::now();
        record.clone()
    }

    /// 只更新已存在的设备
    pub async fn update_existing(&self, device_id: &str, partial: Map<String, Value>) -> Result<MinerRecord, StateError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(device_id).ok_or_else(|| StateError::NotFound {
            device_id: device_id.to_string(),
        })?;

        record.attributes.extend(partial);
        record.last_updated = Utc::now();
        Ok(record.clone())
    }

    pub async fn remove(&self, device_id: &str) -> Option<MinerRecord> {
        self.records.write().await.remove(device_id)
    }

    pub async fn exists(&self, device_id: &str) -> bool {
        self.records.read().await.contains_key(device_id)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn test_crud() {
        let store = SharedStateStore::new();
        assert!(!store.exists("m1").await);

        store.set("m1", fields(json!({"hashrate": 1.0, "state": "mining"}))).await;
        assert!(store.exists("m1").await);

        let updated = store.update("m1", fields(json!({"state": "idle"}))).await;
        assert_eq!(updated.attribute("state"), Some(&json!("idle")));
        assert_eq!(updated.attribute("hashrate"), Some(&json!(1.0)));

        let replaced = store.set("m1", fields(json!({"state": "off"}))).await;
        assert!(replaced.attribute("hashrate").is_none());

        assert!(store.remove("m1").await.is_some());
        assert!(store.get("m1").await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_update_creates_on_first_observation() {
        let store = SharedStateStore::new();
        let record = store.update("m2", fields(json!({"temp": 60}))).await;
        assert_eq!(record.device_id, "m2");
        assert_eq!(store.device_ids().await, vec!["m2".to_string()]);

        let missing = store.update_existing("m3", Map::new()).await;
        assert!(matches!(missing, Err(StateError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_returned_records_are_copies() {
        let store = SharedStateStore::new();
        let mut record = store.update("m1", fields(json!({"a": 1}))).await;
        record.attributes.insert("b".to_string(), json!(2));

        let stored = store.get("m1").await.unwrap();
        assert!(stored.attribute("b").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_merge_fields() {
        let store = Arc::new(SharedStateStore::new());

        let mut tasks = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut partial = Map::new();
                partial.insert(format!("field{}", i), json!(i));
                store.update("m1", partial).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let record = store.get("m1").await.unwrap();
        assert_eq!(record.attributes.len(), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_different_devices_do_not_block() {
        let store = Arc::new(SharedStateStore::new());

        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.update(&format!("m{}", i), fields(json!({"n": i}))).await;
            }));
        }

        let all = tokio::time::timeout(Duration::from_secs(5), futures::future::join_all(tasks)).await;
        assert!(all.is_ok());
        assert_eq!(store.len().await, 20);
        assert_eq!(store.get_all().await[0].device_id, "m0");
    }
}
