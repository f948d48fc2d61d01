//! SQLite 键值存储：统一创建连接池并执行 sqlx 迁移
//!
//! 约定：crate 根目录下存在 `migrations/` 目录，存放所有迁移 SQL 文件，
//! 通过 `sqlx::migrate!()` 自动管理 schema 升级。

use crate::im::error::StoreError;
use crate::im::store::KvStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use tracing::{debug, info, warn};

/// SQLite 磁盘已满
const SQLITE_FULL: &str = "13";

/// 创建 SQLite 连接池并执行所有未执行的迁移
pub async fn create_sqlite_pool_with_migration(db_url: &str) -> Result<Pool<Sqlite>> {
    // 内存库每个连接都是独立的数据库，只能保留一个常驻连接
    let in_memory = db_url.contains(":memory:");
    let mut options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
    if in_memory {
        options = options.idle_timeout(None).max_lifetime(None);
    }

    let pool = options
        .connect(db_url)
        .await
        .with_context(|| format!("连接SQLite数据库失败: {}", db_url))?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .context("执行数据库迁移失败")?;

    info!("[Store] SQLite 已就绪: {}", db_url);
    Ok(pool)
}

/// 基于 sqlx 的键值存储
pub struct SqliteStore {
    db: Pool<Sqlite>,
    quota_bytes: Option<u64>,
}

impl SqliteStore {
    pub fn new(db: Pool<Sqlite>, quota_bytes: Option<u64>) -> Self {
        Self { db, quota_bytes }
    }

    /// 打开数据库（含迁移）
    pub async fn open(db_url: &str, quota_bytes: Option<u64>) -> Result<Self> {
        let db = create_sqlite_pool_with_migration(db_url).await?;
        Ok(Self::new(db, quota_bytes))
    }

    async fn try_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut tx = self.db.begin().await.map_err(|e| map_write_error(e, key))?;

        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_write_error(e, key))?;

        if let Some(quota) = self.quota_bytes {
            let used: i64 = sqlx::query_scalar(
                "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0) FROM kv_store",
            )
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_write_error(e, key))?;
            let needed = used.max(0) as u64 + (key.len() + value.len()) as u64;
            if needed > quota {
                // 旧值的删除照常提交
                tx.commit().await.map_err(|e| map_write_error(e, key))?;
                warn!(
                    "[Store] 写入 {} 超出配额: 需要 {} 字节, 上限 {} 字节",
                    key, needed, quota
                );
                return Err(StoreError::QuotaExceeded {
                    key: key.to_string(),
                });
            }
        }

        sqlx::query("INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(value)
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_write_error(e, key))?;

        tx.commit().await.map_err(|e| map_write_error(e, key))?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        sqlx::query_scalar::<_, String>("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.db)
            .await
            .map_err(map_sqlx_error)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        match self.try_set(key, value).await {
            Ok(()) => {
                debug!("[Store] 写入 {} ({} 字节)", key, value.len());
                Ok(())
            }
            Err(e) => {
                // 写入失败后不保留旧值
                if let Err(unset_err) = self.unset(key).await {
                    warn!("[Store] 清理写入失败的键 {} 出错: {}", key, unset_err);
                }
                Err(e)
            }
        }
    }

    async fn unset(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.db)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_store")
            .execute(&self.db)
            .await
            .map_err(map_sqlx_error)?;
        info!("[Store] 已清空本地存储");
        Ok(())
    }
}

fn map_sqlx_error(e: sqlx::Error) -> StoreError {
    StoreError::Inaccessible(e.to_string())
}

/// 写入路径上的错误：磁盘已满视为配额不足
fn map_write_error(e: sqlx::Error, key: &str) -> StoreError {
    let full = e
        .as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == SQLITE_FULL)
        .unwrap_or(false);
    if full {
        StoreError::QuotaExceeded {
            key: key.to_string(),
        }
    } else {
        map_sqlx_error(e)
    }
}
