//! 指标数据模型
//!
//! 采集器返回的指标是可嵌套的键值表，入库前展平成 `父键.子键 -> f64`。

use crate::utils::format_hashrate;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// 展平嵌套指标时使用的键分隔符
pub const KEY_SEPARATOR: &str = ".";

/// 单个指标值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// 数值
    Number(f64),
    /// 嵌套指标组（例如每条哈希板的温度）
    Nested(BTreeMap<String, MetricValue>),
    /// 其他类型（字符串、布尔等），入库时丢弃
    Other(serde_json::Value),
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Number(value)
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Number(value as f64)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Other(serde_json::Value::String(value.to_string()))
    }
}

impl From<BTreeMap<String, MetricValue>> for MetricValue {
    fn from(value: BTreeMap<String, MetricValue>) -> Self {
        MetricValue::Nested(value)
    }
}

/// 一次采集得到的指标表
pub type MetricMap = BTreeMap<String, MetricValue>;

/// 展平指标表，丢弃非数值叶子
pub fn flatten_metrics(metrics: &MetricMap) -> Vec<(String, f64)> {
    let mut flat = Vec::new();
    flatten_into(None, metrics, &mut flat);
    flat
}

fn flatten_into(prefix: Option<&str>, metrics: &MetricMap, out: &mut Vec<(String, f64)>) {
    for (key, value) in metrics {
        let name = match prefix {
            Some(prefix) => format!("{}{}{}", prefix, KEY_SEPARATOR, key),
            None => key.clone(),
        };

        match value {
            MetricValue::Number(v) if v.is_finite() => out.push((name, *v)),
            MetricValue::Number(v) => debug!("Dropping non-finite metric {} = {}", name, v),
            MetricValue::Nested(children) => flatten_into(Some(&name), children, out),
            MetricValue::Other(v) => debug!("Dropping non-numeric metric {} = {}", name, v),
        }
    }
}

/// 根据指标名推断单位
pub fn infer_unit(metric_name: &str) -> Option<&'static str> {
    let name = metric_name.to_ascii_lowercase();

    let unit = if name.contains("hashrate") || name.contains("hash_rate") {
        "H/s"
    } else if name.contains("efficiency") {
        "J/TH"
    } else if name.contains("temp") {
        "°C"
    } else if name.contains("power") || name.contains("watt") {
        "W"
    } else if name.contains("voltage") || name.contains("volt") {
        "V"
    } else if name.contains("current") {
        "A"
    } else if name.contains("fan") || name.contains("rpm") {
        "RPM"
    } else if name.contains("freq") {
        "MHz"
    } else if name.contains("share") || name.contains("accepted") || name.contains("rejected") {
        "shares"
    } else if name.contains("uptime") {
        "s"
    } else {
        return None;
    };

    Some(unit)
}

/// 毫秒时间戳转 UTC 时间
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// 单个指标采样（写入后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub value: f64,
    pub unit: Option<String>,
}

impl MetricSample {
    /// 适合展示的数值（算力自动换算单位）
    pub fn display_value(&self) -> String {
        match self.unit.as_deref() {
            Some("H/s") => format_hashrate(self.value),
            Some(unit) => format!("{:.2} {}", self.value, unit),
            None => format!("{:.2}", self.value),
        }
    }
}

/// 设备状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: serde_json::Value,
}

/// 聚合窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationInterval {
    Minute,
    FiveMinutes,
    Hour,
    Day,
}

impl AggregationInterval {
    /// 窗口长度（毫秒）
    pub fn width_ms(&self) -> i64 {
        match self {
            AggregationInterval::Minute => 60_000,
            AggregationInterval::FiveMinutes => 5 * 60_000,
            AggregationInterval::Hour => 3_600_000,
            AggregationInterval::Day => 86_400_000,
        }
    }

    /// 时间戳所在窗口的起点（UTC 对齐）
    pub fn bucket_start_ms(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms.div_euclid(self.width_ms()) * self.width_ms()
    }

    pub fn bucket_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        from_millis(self.bucket_start_ms(timestamp.timestamp_millis()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationInterval::Minute => "minute",
            AggregationInterval::FiveMinutes => "5min",
            AggregationInterval::Hour => "hour",
            AggregationInterval::Day => "day",
        }
    }
}

impl std::str::FromStr for AggregationInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" | "1min" => Ok(AggregationInterval::Minute),
            "5min" | "five_minutes" => Ok(AggregationInterval::FiveMinutes),
            "hour" => Ok(AggregationInterval::Hour),
            "day" => Ok(AggregationInterval::Day),
            other => Err(format!("unknown aggregation interval: {}", other)),
        }
    }
}

/// 聚合结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBucket {
    pub device_id: String,
    pub bucket_start: DateTime<Utc>,
    pub metric_name: String,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub sample_count: u64,
    pub unit: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_flatten_nested_and_drop_non_numeric() {
        let mut boards = MetricMap::new();
        boards.insert("board0".to_string(), MetricValue::from(61.5));
        boards.insert("board1".to_string(), MetricValue::from(63.0));

        let mut metrics = MetricMap::new();
        metrics.insert("hashrate".to_string(), MetricValue::from(500e9));
        metrics.insert("temperature".to_string(), MetricValue::Nested(boards));
        metrics.insert("firmware".to_string(), MetricValue::from("v2.1"));
        metrics.insert("overheated".to_string(), MetricValue::Other(serde_json::Value::Bool(false)));
        metrics.insert("broken".to_string(), MetricValue::from(f64::NAN));

        let flat = flatten_metrics(&metrics);
        assert_eq!(
            flat,
            vec![
                ("hashrate".to_string(), 500e9),
                ("temperature.board0".to_string(), 61.5),
                ("temperature.board1".to_string(), 63.0),
            ]
        );
    }

    #[test]
    fn test_metric_map_from_collector_json() {
        let json = serde_json::json!({
            "hashrate": 1.2e12,
            "fans": { "fan0": 3600, "fan1": 3550 },
            "pool": "stratum+tcp://solo.example.com:3333"
        });
        let metrics: MetricMap = serde_json::from_value(json).unwrap();

        let flat = flatten_metrics(&metrics);
        assert_eq!(flat.len(), 3);
        assert!(flat.contains(&("fans.fan0".to_string(), 3600.0)));
    }

    #[test]
    fn test_infer_unit() {
        assert_eq!(infer_unit("hashrate"), Some("H/s"));
        assert_eq!(infer_unit("hashrate_5m"), Some("H/s"));
        assert_eq!(infer_unit("temperature"), Some("°C"));
        assert_eq!(infer_unit("temperature.board0"), Some("°C"));
        assert_eq!(infer_unit("power"), Some("W"));
        assert_eq!(infer_unit("fans.fan0"), Some("RPM"));
        assert_eq!(infer_unit("frequency"), Some("MHz"));
        assert_eq!(infer_unit("shares_accepted"), Some("shares"));
        assert_eq!(infer_unit("efficiency"), Some("J/TH"));
        assert_eq!(infer_unit("best_difficulty"), None);
    }

    #[test]
    fn test_five_minute_buckets_use_integer_division() {
        let interval = AggregationInterval::FiveMinutes;
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 34, 56).unwrap();

        let bucket = interval.bucket_start(t);
        assert_eq!(bucket, Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap());
        assert_eq!(bucket.minute() % 5, 0);

        let edge = Utc.with_ymd_and_hms(2024, 5, 1, 12, 35, 0).unwrap();
        assert_eq!(interval.bucket_start(edge), edge);
    }

    #[test]
    fn test_calendar_aligned_buckets() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 59).unwrap();
        assert_eq!(
            AggregationInterval::Minute.bucket_start(t),
            Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 0).unwrap()
        );
        assert_eq!(
            AggregationInterval::Hour.bucket_start(t),
            Utc.with_ymd_and_hms(2024, 5, 1, 23, 0, 0).unwrap()
        );
        assert_eq!(
            AggregationInterval::Day.bucket_start(t),
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!("5min".parse::<AggregationInterval>(), Ok(AggregationInterval::FiveMinutes));
        assert!("week".parse::<AggregationInterval>().is_err());
    }

    #[test]
    fn test_display_value() {
        let sample = MetricSample {
            device_id: "m1".to_string(),
            timestamp: Utc::now(),
            metric_name: "hashrate".to_string(),
            value: 500e9,
            unit: Some("H/s".to_string()),
        };
        assert_eq!(sample.display_value(), "500.0 GH/s");
    }
}
