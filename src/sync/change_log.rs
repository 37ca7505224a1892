//! 变更日志数据模型
//!
//! 每次本地写入都会追加一条 [`MutationRecord`]，等待推送到远端。
//! 追加路径只落本地 sqlite，绝不等待网络 I/O。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::EntityType;

/// 单条变更的自动推送尝试上限（硬契约）
///
/// 达到上限后记录离开 pending 队列，进入"失败"桶，
/// 只有用户手动重试才会清零计数，绝不允许第 6 次自动尝试。
pub const MAX_PUSH_ATTEMPTS: u32 = 5;

/// 待推送的本地变更记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub created_at: DateTime<Utc>,
    /// 推送成功后置位；已同步记录超过保留期会被清理
    pub synced: bool,
    /// 已消耗的推送尝试次数（0..=MAX_PUSH_ATTEMPTS）
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// 最近一次失败原因（人类可读）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl MutationRecord {
    /// 构造一条全新的待推送记录
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type,
            entity_id: entity_id.into(),
            created_at: Utc::now(),
            synced: false,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
        }
    }

    /// 是否仍在 pending 队列（未同步且未达尝试上限）
    pub fn is_pending(&self) -> bool {
        !self.synced && self.attempts < MAX_PUSH_ATTEMPTS
    }

    /// 是否已进入失败桶（未同步且达到尝试上限）
    pub fn is_failed(&self) -> bool {
        !self.synced && self.attempts >= MAX_PUSH_ATTEMPTS
    }
}
