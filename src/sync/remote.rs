//! 远端同步接口
//!
//! 远端存储的线格式不在本核心范围内，这里只约定推/拉两个动作。
//! 具体实现（HTTP、WebDAV 还是别的什么）由组合根注入。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{EntityRecord, EntityType, Result};

/// 远端推拉契约
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// 推送单个实体的完整快照
    async fn push(&self, record: &EntityRecord) -> Result<()>;

    /// 拉取某类型自水位线以来的远端改动
    ///
    /// `since` 为 None 表示首次同步，拉取全量。
    /// 返回记录的 `updated_at` 即服务端时间戳。
    async fn pull(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EntityRecord>>;
}
