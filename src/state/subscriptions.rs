//! 主题订阅
//!
//! 一把互斥锁同时保护 主题->订阅者 和 订阅者->主题 两个索引。
//! 广播在锁内取快照，在锁外投递，慢订阅者不会阻塞注册表的修改。
//! 每次投递都有超时，卡住的订阅者会被移除，不会拖住调用方的数据流。

use crate::error::StateError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

pub type SubscriberId = Uuid;

/// 单次投递的默认超时
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// 广播给订阅者的消息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TopicMessage {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// 订阅者
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// 投递一条消息，失败的订阅者在广播结束后被移除
    async fn deliver(&self, message: &TopicMessage) -> Result<(), StateError>;
}

/// 把消息转发到 tokio mpsc 通道
///
/// 通道满时丢弃这条消息而不是等待接收端，接收端关闭时投递失败。
pub struct ChannelSubscriber {
    name: String,
    sender: mpsc::Sender<TopicMessage>,
    dropped: AtomicU64,
}

impl ChannelSubscriber {
    /// 创建订阅者和对应的接收端
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<TopicMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.into(),
                sender,
                dropped: AtomicU64::new(0),
            },
            receiver,
        )
    }

    /// 因通道已满而丢弃的消息数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    async fn deliver(&self, message: &TopicMessage) -> Result<(), StateError> {
        match self.sender.try_send(message.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Subscriber {} is not keeping up, dropped message on {} ({} dropped so far)",
                    self.name, message.topic, dropped
                );
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(StateError::Delivery {
                subscriber: self.name.clone(),
                reason: "receiver dropped".to_string(),
            }),
        }
    }
}

/// 一次广播的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<SubscriberId>,
}

struct Registration {
    handle: Arc<dyn Subscriber>,
    topics: HashSet<String>,
}

#[derive(Default)]
struct Indexes {
    by_topic: HashMap<String, HashSet<SubscriberId>>,
    by_subscriber: HashMap<SubscriberId, Registration>,
}

impl Indexes {
    fn link(&mut self, id: SubscriberId, topic: &str) {
        if let Some(registration) = self.by_subscriber.get_mut(&id) {
            registration.topics.insert(topic.to_string());
            self.by_topic.entry(topic.to_string()).or_default().insert(id);
        }
    }

    fn unlink(&mut self, id: SubscriberId, topic: &str) {
        if let Some(registration) = self.by_subscriber.get_mut(&id) {
            registration.topics.remove(topic);
        }
        if let Some(subscribers) = self.by_topic.get_mut(topic) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                self.by_topic.remove(topic);
            }
        }
    }

    fn remove(&mut self, id: SubscriberId) -> bool {
        let Some(registration) = self.by_subscriber.remove(&id) else {
            return false;
        };
        for topic in &registration.topics {
            if let Some(subscribers) = self.by_topic.get_mut(topic) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    self.by_topic.remove(topic);
                }
            }
        }
        true
    }
}

pub struct SubscriptionRegistry {
    indexes: Mutex<Indexes>,
    delivery_timeout: Duration,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self {
            indexes: Mutex::new(Indexes::default()),
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置单次投递超时，超时的订阅者视为投递失败
    pub fn with_delivery_timeout(self, delivery_timeout: Duration) -> Self {
        Self {
            delivery_timeout,
            ..self
        }
    }

    /// 注册订阅者并订阅初始主题，返回句柄
    pub async fn add_subscriber(&self, handle: Arc<dyn Subscriber>, topics: &[&str]) -> SubscriberId {
        let id = Uuid::new_v4();
        let mut indexes = self.indexes.lock().await;
        indexes.by_subscriber.insert(
            id,
            Registration {
                handle,
                topics: HashSet::new(),
            },
        );
        for topic in topics {
            indexes.link(id, topic);
        }
        debug!("Subscriber {} registered for {:?}", id, topics);
        id
    }

    pub async fn remove_subscriber(&self, id: SubscriberId) -> bool {
        let removed = self.indexes.lock().await.remove(id);
        if removed {
            debug!("Subscriber {} removed", id);
        }
        removed
    }

    pub async fn subscribe(&self, id: SubscriberId, topics: &[&str]) -> Result<(), StateError> {
        let mut indexes = self.indexes.lock().await;
        if !indexes.by_subscriber.contains_key(&id) {
            return Err(StateError::UnknownSubscriber { subscriber: id.to_string() });
        }
        for topic in topics {
            indexes.link(id, topic);
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, id: SubscriberId, topics: &[&str]) -> Result<(), StateError> {
        let mut indexes = self.indexes.lock().await;
        if !indexes.by_subscriber.contains_key(&id) {
            return Err(StateError::UnknownSubscriber { subscriber: id.to_string() });
        }
        for topic in topics {
            indexes.unlink(id, topic);
        }
        Ok(())
    }

    pub async fn subscribers_of(&self, topic: &str) -> Vec<SubscriberId> {
        let indexes = self.indexes.lock().await;
        let mut ids: Vec<SubscriberId> = indexes
            .by_topic
            .get(topic)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub async fn topics_of(&self, id: SubscriberId) -> Vec<String> {
        let indexes = self.indexes.lock().await;
        let mut topics: Vec<String> = indexes
            .by_subscriber
            .get(&id)
            .map(|registration| registration.topics.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    pub async fn subscriber_count(&self) -> usize {
        self.indexes.lock().await.by_subscriber.len()
    }

    pub async fn topic_count(&self) -> usize {
        self.indexes.lock().await.by_topic.len()
    }

    /// 向调用时刻订阅了 `topic` 的所有订阅者投递消息
    pub async fn broadcast(&self, topic: &str, payload: serde_json::Value) -> BroadcastReport {
        let snapshot: Vec<(SubscriberId, Arc<dyn Subscriber>)> = {
            let indexes = self.indexes.lock().await;
            match indexes.by_topic.get(topic) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| {
                        indexes
                            .by_subscriber
                            .get(id)
                            .map(|registration| (*id, registration.handle.clone()))
                    })
                    .collect(),
                None => Vec::new(),
            }
        };

        if snapshot.is_empty() {
            return BroadcastReport::default();
        }

        let message = TopicMessage::new(topic, payload);
        let delivery_timeout = self.delivery_timeout;
        let results = join_all(snapshot.iter().map(|(id, handle)| {
            let message = &message;
            async move {
                let result = tokio::time::timeout(delivery_timeout, handle.deliver(message))
                    .await
                    .unwrap_or_else(|_| {
                        Err(StateError::Delivery {
                            subscriber: id.to_string(),
                            reason: format!("delivery timed out after {:?}", delivery_timeout),
                        })
                    });
                (*id, result)
            }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Dropping subscriber {} on topic {}: {}", id, topic, e);
                    report.failed.push(id);
                }
            }
        }

        if !report.failed.is_empty() {
            let mut indexes = self.indexes.lock().await;
            for id in &report.failed {
                indexes.remove(*id);
            }
        }

        report
    }
}
