//! 实用工具模块

pub mod hashrate_formatter;

pub use hashrate_formatter::{format_hashrate, parse_hashrate};

/// 算力显示宏
///
/// ```
/// use hashwatch::hashrate;
///
/// assert_eq!(hashrate!(1234567890.0), "1.235 GH/s");
/// ```
#[macro_export]
macro_rules! hashrate {
    ($hashrate:expr) => {
        $crate::utils::format_hashrate($hashrate)
    };
}
