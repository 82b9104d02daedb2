//! 存储层：连接池、查询缓存、事务执行器和时序存储

pub mod cache;
pub mod pool;
pub mod sqlite;
pub mod timeseries;
pub mod transaction;

pub use cache::{CacheConfig, CacheStats, QueryCache};
pub use pool::{ConnectionManager, ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use sqlite::{SqliteManager, Statement};
pub use timeseries::{CachedQuery, RetentionReport, TimeSeriesStore};
pub use transaction::AtomicTransactionExecutor;
