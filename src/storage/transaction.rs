//! 原子事务执行器
//!
//! 所有写事务经过同一把串行锁，并使用 `BEGIN EXCLUSIVE`。
//! 任何一步失败都会回滚，其他读者看不到部分写入。

use crate::error::StorageError;
use crate::storage::pool::ConnectionPool;
use crate::storage::sqlite::{SqliteManager, Statement};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Transaction, TransactionBehavior};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct AtomicTransactionExecutor {
    pool: Arc<ConnectionPool<SqliteManager>>,
    serial: Mutex<()>,
}

impl AtomicTransactionExecutor {
    pub fn new(pool: Arc<ConnectionPool<SqliteManager>>) -> Self {
        Self {
            pool,
            serial: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<SqliteManager>> {
        &self.pool
    }

    /// 在一个排他事务里执行闭包，返回闭包的结果
    ///
    /// 获取连接失败时原样返回；事务内的错误包装为 [`StorageError::Transaction`]。
    pub async fn run_with<F, R>(&self, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R, StorageError> + Send + 'static,
        R: Send + 'static,
    {
        let _serial = self.serial.lock().await;
        let mut conn = self.pool.acquire().await?;

        conn.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
            // 出错时 tx 被 drop，自动回滚
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
        .map_err(StorageError::rolled_back)
    }

    /// 按顺序执行所有语句，返回受影响的总行数
    pub async fn run_transaction(&self, statements: Vec<Statement>) -> Result<usize, StorageError> {
        let count = statements.len();
        let affected = self
            .run_with(move |tx| {
                let mut affected = 0;
                for stmt in &statements {
                    affected += tx.execute(&stmt.sql, params_from_iter(stmt.params.iter()))?;
                }
                Ok(affected)
            })
            .await?;

        debug!("Committed transaction of {} statements ({} rows)", count, affected);
        Ok(affected)
    }

    /// 同一条语句配多组参数，作为一个整体提交
    pub async fn run_batch(&self, sql: impl Into<String>, rows: Vec<Vec<Value>>) -> Result<usize, StorageError> {
        let sql = sql.into();
        let count = rows.len();
        if count == 0 {
            return Ok(0);
        }

        let affected = self
            .run_with(move |tx| {
                let mut stmt = tx.prepare_cached(&sql)?;
                let mut affected = 0;
                for row in &rows {
                    affected += stmt.execute(params_from_iter(row.iter()))?;
                }
                Ok(affected)
            })
            .await?;

        debug!("Committed batch of {} rows", count);
        Ok(affected)
    }
}
