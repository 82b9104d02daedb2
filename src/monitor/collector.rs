//! 矿机采集接口
//!
//! 协议解析不在本 crate 内，采集器只需要返回指标表和状态。

use crate::error::CollectorError;
use crate::metrics::MetricMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 一次轮询的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinerPoll {
    pub metrics: MetricMap,
    pub status: serde_json::Value,
}

/// 矿机采集器
#[async_trait]
pub trait MinerCollector: Send + Sync {
    /// 设备 id
    fn device_id(&self) -> &str;

    /// 轮询一次设备
    async fn poll(&self) -> Result<MinerPoll, CollectorError>;
}
