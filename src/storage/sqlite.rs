//! SQLite 连接管理

use crate::error::StorageError;
use crate::storage::pool::ConnectionManager;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// 带参数的 SQL 语句
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// 追加一个参数
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// SQLite 连接管理器
#[derive(Debug, Clone)]
pub struct SqliteManager {
    path: PathBuf,
    busy_timeout: Duration,
    wal: bool,
}

impl SqliteManager {
    /// 创建新的管理器，默认开启 WAL
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout: Duration::from_secs(5),
            wal: true,
        }
    }

    pub fn with_busy_timeout(self, busy_timeout: Duration) -> Self {
        Self { busy_timeout, ..self }
    }

    pub fn with_wal(self, wal: bool) -> Self {
        Self { wal, ..self }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConnectionManager for SqliteManager {
    type Connection = Connection;

    fn connect(&self) -> Result<Connection, StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::DatabaseConnection {
                    reason: format!("cannot create {}: {}", parent.display(), e),
                })?;
            }
        }

        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StorageError::DatabaseConnection {
            reason: format!("{}: {}", self.path.display(), e),
        })?;

        conn.busy_timeout(self.busy_timeout)?;
        if self.wal {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            if !mode.eq_ignore_ascii_case("wal") {
                warn!("SQLite refused WAL mode for {}, using {}", self.path.display(), mode);
            }
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        debug!("Opened SQLite connection to {}", self.path.display());
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), StorageError> {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Connection) -> bool {
        // 借出期间遗留的事务说明调用方没有正常收尾
        !conn.is_autocommit()
    }

    fn close(&self, conn: Connection) {
        if let Err((_, e)) = conn.close() {
            warn!("Failed to close SQLite connection: {}", e);
        }
    }
}

/// 生成 `?start, ?start+1, ...` 形式的占位符
pub(crate) fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}
