//! 冲突检测
//!
//! 判定粒度是整条记录：同一实体本机有未推送改动、远端又带来了
//! 不同内容的快照，即构成冲突。字段级合并不做，留给用户三选一。
//!
//! 时间戳只用于在界面上并排展示两边版本，绝不用于自动裁决，
//! 离线设备的时钟不可信。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::models::{
    Boat, EntityPayload, EntityRecord, EntityType, MaintenanceEvent, Note, Result, TodoItem,
    TodoList, Trip,
};
use crate::store::Store;

/// 同一实体的本机/远端两个版本
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictPair<T> {
    pub entity_id: String,
    /// 本机版本（含未推送改动）
    pub local: T,
    /// 远端版本
    pub server: T,
    /// 仅供展示，不参与裁决
    pub local_timestamp: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
}

/// 按实体类型区分的冲突（消费端穷尽匹配）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "conflict", rename_all = "snake_case")]
pub enum SyncConflict {
    Boat(ConflictPair<Boat>),
    Trip(ConflictPair<Trip>),
    Note(ConflictPair<Note>),
    TodoList(ConflictPair<TodoList>),
    TodoItem(ConflictPair<TodoItem>),
    MaintenanceEvent(ConflictPair<MaintenanceEvent>),
}

impl SyncConflict {
    /// 从本机/远端两条记录构造冲突，类型不一致时返回 None
    pub fn from_records(local: &EntityRecord, server: &EntityRecord) -> Option<SyncConflict> {
        fn pair<T: Clone>(
            entity_id: &str,
            local: &T,
            server: &T,
            local_at: DateTime<Utc>,
            server_at: DateTime<Utc>,
        ) -> ConflictPair<T> {
            ConflictPair {
                entity_id: entity_id.to_string(),
                local: local.clone(),
                server: server.clone(),
                local_timestamp: local_at,
                server_timestamp: server_at,
            }
        }

        let (id, l_at, s_at) = (&local.entity_id, local.updated_at, server.updated_at);
        match (&local.payload, &server.payload) {
            (EntityPayload::Boat(l), EntityPayload::Boat(s)) => {
                Some(SyncConflict::Boat(pair(id, l, s, l_at, s_at)))
            }
            (EntityPayload::Trip(l), EntityPayload::Trip(s)) => {
                Some(SyncConflict::Trip(pair(id, l, s, l_at, s_at)))
            }
            (EntityPayload::Note(l), EntityPayload::Note(s)) => {
                Some(SyncConflict::Note(pair(id, l, s, l_at, s_at)))
            }
            (EntityPayload::TodoList(l), EntityPayload::TodoList(s)) => {
                Some(SyncConflict::TodoList(pair(id, l, s, l_at, s_at)))
            }
            (EntityPayload::TodoItem(l), EntityPayload::TodoItem(s)) => {
                Some(SyncConflict::TodoItem(pair(id, l, s, l_at, s_at)))
            }
            (EntityPayload::MaintenanceEvent(l), EntityPayload::MaintenanceEvent(s)) => {
                Some(SyncConflict::MaintenanceEvent(pair(id, l, s, l_at, s_at)))
            }
            _ => None,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            SyncConflict::Boat(_) => EntityType::Boat,
            SyncConflict::Trip(_) => EntityType::Trip,
            SyncConflict::Note(_) => EntityType::Note,
            SyncConflict::TodoList(_) => EntityType::TodoList,
            SyncConflict::TodoItem(_) => EntityType::TodoItem,
            SyncConflict::MaintenanceEvent(_) => EntityType::MaintenanceEvent,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            SyncConflict::Boat(p) => &p.entity_id,
            SyncConflict::Trip(p) => &p.entity_id,
            SyncConflict::Note(p) => &p.entity_id,
            SyncConflict::TodoList(p) => &p.entity_id,
            SyncConflict::TodoItem(p) => &p.entity_id,
            SyncConflict::MaintenanceEvent(p) => &p.entity_id,
        }
    }

    /// 本机版本重建为实体记录（解决冲突时使用）
    pub fn local_record(&self) -> EntityRecord {
        let payload = match self {
            SyncConflict::Boat(p) => EntityPayload::Boat(p.local.clone()),
            SyncConflict::Trip(p) => EntityPayload::Trip(p.local.clone()),
            SyncConflict::Note(p) => EntityPayload::Note(p.local.clone()),
            SyncConflict::TodoList(p) => EntityPayload::TodoList(p.local.clone()),
            SyncConflict::TodoItem(p) => EntityPayload::TodoItem(p.local.clone()),
            SyncConflict::MaintenanceEvent(p) => EntityPayload::MaintenanceEvent(p.local.clone()),
        };
        EntityRecord::from_payload(payload, false)
    }

    /// 远端版本重建为实体记录
    pub fn server_record(&self) -> EntityRecord {
        let payload = match self {
            SyncConflict::Boat(p) => EntityPayload::Boat(p.server.clone()),
            SyncConflict::Trip(p) => EntityPayload::Trip(p.server.clone()),
            SyncConflict::Note(p) => EntityPayload::Note(p.server.clone()),
            SyncConflict::TodoList(p) => EntityPayload::TodoList(p.server.clone()),
            SyncConflict::TodoItem(p) => EntityPayload::TodoItem(p.server.clone()),
            SyncConflict::MaintenanceEvent(p) => EntityPayload::MaintenanceEvent(p.server.clone()),
        };
        EntityRecord::from_payload(payload, true)
    }
}

/// 拉取路径上的冲突检测器
pub struct ConflictDetector {
    store: Arc<dyn Store>,
}

impl ConflictDetector {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// 检查一条远端记录是否与本机未推送改动冲突
    ///
    /// 返回 None 表示可以直接落库：本机没有该实体、本机版本已同步、
    /// 或两边内容完全一致（各自做了相同改动）。
    pub fn check(&self, server: &EntityRecord) -> Result<Option<SyncConflict>> {
        let local = match self.store.get(server.entity_type, &server.entity_id)? {
            Some(local) => local,
            None => return Ok(None),
        };
        if local.synced || local.payload == server.payload {
            return Ok(None);
        }
        debug!(
            "[ConflictDetector] 检出冲突: {} {}",
            server.entity_type, server.entity_id
        );
        Ok(SyncConflict::from_records(&local, server))
    }
}
