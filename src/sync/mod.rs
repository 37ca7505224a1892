//! 离线优先同步引擎
//!
//! 本机写入永远即时生效，同步在后台把变更推给远端、把远端改动拉回来：
//! - [`change_log`]：本地写入追加的待推送变更记录
//! - [`remote`]：远端推拉契约
//! - [`retry`]：失败记账与手动重试
//! - [`conflict`]：整条记录粒度的冲突检测
//! - [`resolver`]：KeepLocal / KeepServer / KeepBoth 三种解决策略
//! - [`orchestrator`]：上传 → 拉取 → 对账 的单飞编排

pub mod change_log;
pub mod conflict;
pub mod orchestrator;
pub mod remote;
pub mod resolver;
pub mod retry;

pub use change_log::{MutationRecord, MAX_PUSH_ATTEMPTS};
pub use conflict::{ConflictDetector, ConflictPair, SyncConflict};
pub use orchestrator::{
    SyncOrchestrator, SyncOutcome, SyncProgress, SyncReport, SyncStage,
};
pub use remote::RemoteApi;
pub use resolver::{ConflictResolver, ResolutionOutcome, ResolutionStrategy};
pub use retry::{transient_backoff, RetryScheduler};
