//! 共享状态：设备当前记录和实时订阅

pub mod store;
pub mod subscriptions;

pub use store::{MinerRecord, SharedStateStore};
pub use subscriptions::{
    BroadcastReport, ChannelSubscriber, Subscriber, SubscriberId, SubscriptionRegistry, TopicMessage,
};

/// 全部设备的广播主题
pub const ALL_MINERS_TOPIC: &str = "miners";

/// 单个设备的广播主题
pub fn miner_topic(device_id: &str) -> String {
    format!("miner:{}", device_id)
}
