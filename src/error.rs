use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HashwatchError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Circuit open: {0}")]
    CircuitOpen(#[from] CircuitOpenError),
}

/// 熔断器拒绝调用（快速失败，不算一次真正的尝试）
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Circuit breaker '{resource}' is open after {failures} failures, retry after {retry_after:?}")]
pub struct CircuitOpenError {
    pub resource: String,
    pub failures: u32,
    pub retry_after: Duration,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database connection failed: {reason}")]
    DatabaseConnection { reason: String },

    #[error("Timed out after {waited:?} waiting for a database connection")]
    DatabaseTimeout { waited: Duration },

    #[error("Connection pool is shut down")]
    PoolClosed,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Table not found: {table}")]
    TableNotFound { table: String },

    #[error("Transaction rolled back: {source}")]
    Transaction {
        #[source]
        source: Box<StorageError>,
    },

    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Blocking task failed: {reason}")]
    TaskJoin { reason: String },
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Miner not found: {device_id}")]
    NotFound { device_id: String },

    #[error("Unknown subscriber: {subscriber}")]
    UnknownSubscriber { subscriber: String },

    #[error("Delivery to subscriber {subscriber} failed: {reason}")]
    Delivery { subscriber: String, reason: String },
}

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Miner {device_id} unreachable: {reason}")]
    Unreachable { device_id: String, reason: String },

    #[error("Miner {device_id} timed out")]
    Timeout { device_id: String },

    #[error("Miner {device_id} returned malformed data: {reason}")]
    Malformed { device_id: String, reason: String },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Parse error: {error}")]
    ParseError { error: String },

    #[error("Validation error: {field}, reason: {reason}")]
    ValidationError { field: String, reason: String },
}

/// 错误分类
///
/// 重试引擎只重试 `Retryable`；其余类别原样向上传播。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// 瞬时故障（连接被拒、超时、I/O 错误、数据库忙）
    Retryable,
    /// 调用方错误（参数错误、类型不匹配）
    NonRetryable,
    /// 熔断器快速失败
    BreakerOpen,
    /// 事务已回滚
    Transaction,
}

impl ErrorClass {
    /// 传输层对外展示的错误文本
    pub fn public_message(&self) -> &'static str {
        match self {
            ErrorClass::NonRetryable => "bad request",
            ErrorClass::Retryable | ErrorClass::BreakerOpen | ErrorClass::Transaction => {
                "service temporarily unavailable"
            }
        }
    }
}

/// 能被重试引擎和熔断器识别的错误
pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

impl Classify for CircuitOpenError {
    fn class(&self) -> ErrorClass {
        ErrorClass::BreakerOpen
    }
}

impl Classify for StorageError {
    fn class(&self) -> ErrorClass {
        match self {
            StorageError::DatabaseConnection { .. }
            | StorageError::DatabaseTimeout { .. }
            | StorageError::TaskJoin { .. } => ErrorClass::Retryable,
            StorageError::Sqlite(e) => classify_sqlite(e),
            // 回滚后没有任何改动落库，瞬时原因（数据库忙）可以整体重试
            StorageError::Transaction { source } => match source.class() {
                ErrorClass::Retryable => ErrorClass::Retryable,
                _ => ErrorClass::Transaction,
            },
            StorageError::CircuitOpen(_) => ErrorClass::BreakerOpen,
            StorageError::PoolClosed
            | StorageError::TableNotFound { .. }
            | StorageError::InvalidArgument { .. } => ErrorClass::NonRetryable,
        }
    }
}

impl Classify for CollectorError {
    fn class(&self) -> ErrorClass {
        match self {
            CollectorError::Unreachable { .. } | CollectorError::Timeout { .. } => {
                ErrorClass::Retryable
            }
            CollectorError::Malformed { .. } => ErrorClass::NonRetryable,
            CollectorError::CircuitOpen(_) => ErrorClass::BreakerOpen,
        }
    }
}

impl Classify for HashwatchError {
    fn class(&self) -> ErrorClass {
        match self {
            HashwatchError::Storage(e) => e.class(),
            HashwatchError::Collector(e) => e.class(),
            HashwatchError::CircuitOpen(_) => ErrorClass::BreakerOpen,
            HashwatchError::State(_) | HashwatchError::Config(_) => ErrorClass::NonRetryable,
        }
    }
}

fn classify_sqlite(error: &rusqlite::Error) -> ErrorClass {
    use rusqlite::ErrorCode;

    match error {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::OutOfMemory => ErrorClass::Retryable,
            _ => ErrorClass::NonRetryable,
        },
        _ => ErrorClass::NonRetryable,
    }
}

impl StorageError {
    /// 包装为事务失败（已回滚）
    pub fn rolled_back(source: StorageError) -> Self {
        match source {
            already @ StorageError::Transaction { .. } => already,
            other => StorageError::Transaction { source: Box::new(other) },
        }
    }

    /// 是否为“表不存在”错误，时序查询把它当作空结果处理
    pub fn is_missing_table(&self) -> bool {
        match self {
            StorageError::TableNotFound { .. } => true,
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(_, Some(msg))) => {
                msg.contains("no such table")
            }
            StorageError::Transaction { source } => source.is_missing_table(),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::TaskJoin { reason: e.to_string() }
    }
}

// 错误统计
#[derive(Debug, Default, Clone)]
pub struct ErrorStats {
    pub retryable_errors: u64,
    pub non_retryable_errors: u64,
    pub breaker_rejections: u64,
    pub transaction_errors: u64,
    pub total_errors: u64,
}

impl ErrorStats {
    pub fn record_error<E: Classify>(&mut self, error: &E) {
        self.total_errors += 1;

        match error.class() {
            ErrorClass::Retryable => self.retryable_errors += 1,
            ErrorClass::NonRetryable => self.non_retryable_errors += 1,
            ErrorClass::BreakerOpen => self.breaker_rejections += 1,
            ErrorClass::Transaction => self.transaction_errors += 1,
        }
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_classes() {
        assert_eq!(
            StorageError::DatabaseTimeout { waited: Duration::from_secs(30) }.class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            StorageError::InvalidArgument { reason: "bad".to_string() }.class(),
            ErrorClass::NonRetryable
        );
        assert_eq!(
            StorageError::rolled_back(StorageError::PoolClosed).class(),
            ErrorClass::Transaction
        );

        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert_eq!(
            StorageError::rolled_back(StorageError::Sqlite(busy)).class(),
            ErrorClass::Retryable
        );

        let open = CircuitOpenError {
            resource: "database".to_string(),
            failures: 3,
            retry_after: Duration::from_secs(1),
        };
        assert_eq!(StorageError::from(open).class(), ErrorClass::BreakerOpen);
    }

    #[test]
    fn test_sqlite_busy_is_retryable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        assert_eq!(StorageError::Sqlite(busy).class(), ErrorClass::Retryable);
    }

    #[test]
    fn test_missing_table_detection() {
        let missing = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some("no such table: miner_metrics".to_string()),
        );
        let err = StorageError::rolled_back(StorageError::Sqlite(missing));
        assert!(err.is_missing_table());
        assert!(!StorageError::PoolClosed.is_missing_table());
    }

    #[test]
    fn test_public_messages() {
        assert_eq!(ErrorClass::NonRetryable.public_message(), "bad request");
        assert_eq!(
            ErrorClass::BreakerOpen.public_message(),
            "service temporarily unavailable"
        );
    }

    #[test]
    fn test_error_stats() {
        let mut stats = ErrorStats::default();
        stats.record_error(&StorageError::PoolClosed);
        stats.record_error(&StorageError::DatabaseConnection { reason: "refused".to_string() });
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.retryable_errors, 1);
        assert_eq!(stats.non_retryable_errors, 1);

        stats.reset();
        assert_eq!(stats.total_errors, 0);
    }
}
