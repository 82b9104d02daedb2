//! 算力格式化工具
//!
//! 数据库里的算力统一以 H/s 存储，展示时自动换算到最合适的单位。

/// 单位表（从大到小）
const UNITS: [(f64, &str); 6] = [
    (1e15, "PH/s"),
    (1e12, "TH/s"),
    (1e9, "GH/s"),
    (1e6, "MH/s"),
    (1e3, "KH/s"),
    (1.0, "H/s"),
];

/// 格式化算力显示（智能单位自适应）
///
/// 数值部分保持在 1-999 之间，精度随数量级变化。
///
/// # 示例
/// ```
/// use hashwatch::utils::format_hashrate;
///
/// assert_eq!(format_hashrate(1234.0), "1.234 KH/s");
/// assert_eq!(format_hashrate(500e9), "500.0 GH/s");
/// ```
pub fn format_hashrate(hashrate: f64) -> String {
    if !hashrate.is_finite() {
        return "∞ H/s".to_string();
    }
    if hashrate <= 0.0 {
        return "0.00 H/s".to_string();
    }

    let (scale, unit) = UNITS
        .iter()
        .copied()
        .find(|(scale, _)| hashrate >= *scale)
        .unwrap_or((1.0, "H/s"));

    let value = hashrate / scale;
    if value >= 100.0 {
        format!("{:.1} {}", value, unit)
    } else if value >= 10.0 {
        format!("{:.2} {}", value, unit)
    } else {
        format!("{:.3} {}", value, unit)
    }
}

/// 解析算力字符串（例如 `1.5 TH/s`、`2.3G`），返回 H/s
pub fn parse_hashrate(s: &str) -> Option<f64> {
    let s = s.trim();
    let split_pos = s.find(|c: char| c.is_alphabetic()).unwrap_or(s.len());
    let (number_part, unit_part) = s.split_at(split_pos);
    let number = number_part.trim().parse::<f64>().ok()?;

    let unit = unit_part.trim().trim_end_matches("/s");
    let multiplier = match unit {
        "" | "H" => 1.0,
        "KH" | "K" => 1e3,
        "MH" | "M" => 1e6,
        "GH" | "G" => 1e9,
        "TH" | "T" => 1e12,
        "PH" | "P" => 1e15,
        _ => return None,
    };

    Some(number * multiplier)
}
