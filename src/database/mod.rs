//! sqlite 持久层
//!
//! - [`DatabaseManager`]：r2d2 连接池与 schema 管理
//! - [`SqliteStore`]：`EntityStore`/`ChangeLog`/`ImportLedger` 的生产实现

mod manager;
mod store;

pub use manager::DatabaseManager;
pub use store::SqliteStore;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

pub type SqlitePool = Pool<SqliteConnectionManager>;
pub type SqlitePooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// 当前 schema 版本（PRAGMA user_version）
pub const CURRENT_DB_VERSION: i32 = 1;
