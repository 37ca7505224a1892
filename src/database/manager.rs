//! DatabaseManager - 连接池管理器
//!
//! 负责：
//! - r2d2 连接池管理
//! - Schema 初始化与迁移

use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::time::Duration;

use super::{SqlitePool, SqlitePooledConnection, CURRENT_DB_VERSION};

pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 创建新的数据库管理器，使用 r2d2 连接池
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("创建数据库目录失败: {:?}", parent))?;
        }

        let pool = Self::build_pool(db_path)?;

        {
            let conn = pool.get().with_context(|| "初始化时获取连接失败")?;
            Self::init_schema(&conn)?;
        }

        Ok(DatabaseManager { pool })
    }

    /// 获取数据库连接
    pub fn get_conn(&self) -> Result<SqlitePooledConnection> {
        self.pool.get().with_context(|| "从连接池获取连接失败")
    }

    fn build_pool(db_path: &Path) -> Result<SqlitePool> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|c| {
            // 基础 PRAGMA 设置
            c.pragma_update(None, "foreign_keys", &"ON")?;
            c.pragma_update(None, "journal_mode", &"WAL")?;
            c.pragma_update(None, "synchronous", &"NORMAL")?;
            // 防止写入互斥等待无界：设置 busy_timeout 以快速失败并交给上层重试/提示
            // 单位毫秒，3 秒足以让短事务释放写锁
            c.pragma_update(None, "busy_timeout", &3000i64)?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(15)
            .min_idle(Some(2))
            .connection_timeout(Duration::from_secs(10))
            .build(manager)
            .with_context(|| format!("创建数据库连接池失败: {:?}", db_path))?;

        Ok(pool)
    }

    /// 初始化/迁移 schema（按 PRAGMA user_version 演进）
    fn init_schema(conn: &Connection) -> Result<()> {
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .with_context(|| "读取 user_version 失败")?;

        if version >= CURRENT_DB_VERSION {
            return Ok(());
        }

        if version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS entities (
                    entity_type TEXT NOT NULL,
                    entity_id   TEXT NOT NULL,
                    payload     TEXT NOT NULL,
                    updated_at  TEXT NOT NULL,
                    synced      INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (entity_type, entity_id)
                );
                CREATE INDEX IF NOT EXISTS idx_entities_updated
                    ON entities (entity_type, updated_at);
                CREATE INDEX IF NOT EXISTS idx_entities_unsynced
                    ON entities (entity_type, synced);

                CREATE TABLE IF NOT EXISTS mutation_log (
                    id              TEXT PRIMARY KEY,
                    entity_type     TEXT NOT NULL,
                    entity_id       TEXT NOT NULL,
                    created_at      TEXT NOT NULL,
                    synced          INTEGER NOT NULL DEFAULT 0,
                    attempts        INTEGER NOT NULL DEFAULT 0,
                    last_attempt_at TEXT,
                    last_error      TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_mutation_queue
                    ON mutation_log (synced, attempts, created_at);

                CREATE TABLE IF NOT EXISTS sync_watermarks (
                    entity_type    TEXT PRIMARY KEY,
                    last_synced_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS import_registry (
                    transfer_id TEXT PRIMARY KEY,
                    imported_at TEXT NOT NULL
                );
                "#,
            )
            .with_context(|| "初始化 schema 失败")?;
        }

        conn.pragma_update(None, "user_version", &CURRENT_DB_VERSION)
            .with_context(|| "写入 user_version 失败")?;
        Ok(())
    }
}
