//! Skipper Log 核心库
//!
//! 个人航海日志应用的数据核心，两大支柱：
//! - 离线优先同步引擎（`sync`）：本机写入即时生效，后台与远端双向同步，
//!   冲突交给用户三选一裁决；
//! - 二维码离线传输协议（`qr`）：没有任何网络时，通过连续扫码把船只档案
//!   或一批航程从一台设备搬到另一台，配合 `import` 做查重与落库。
//!
//! 持久层通过 `store` 里的窄契约注入，生产用 sqlite（`database`），
//! 测试用内存实现。

pub mod config;
pub mod database;
pub mod import;
pub mod models;
pub mod qr;
pub mod store;
pub mod sync;

pub use config::SyncConfig;
pub use database::{DatabaseManager, SqliteStore};
pub use models::{
    AppError, AppErrorType, Boat, EntityPayload, EntityRecord, EntityType, MaintenanceEvent,
    Note, Result, TodoItem, TodoList, Trip,
};
pub use store::{ChangeLog, EntityStore, ImportLedger, MemoryStore, Store, StoreOp};
