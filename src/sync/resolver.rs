//! 冲突解决
//!
//! 三种策略都由用户显式选择，解决动作整体原子落库，
//! 任何一步失败都不得留下半解决状态（冲突保持原样，可重来）。

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::Result;
use crate::store::{Store, StoreOp};
use crate::sync::change_log::MutationRecord;
use crate::sync::conflict::SyncConflict;
use crate::sync::remote::RemoteApi;

/// 冲突解决策略（用户三选一）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    /// 保留本机版本，覆盖远端
    KeepLocal,
    /// 接受远端版本，放弃本机改动
    KeepServer,
    /// 两个都留：远端版本占原 ID，本机版本换新 ID 作为副本
    KeepBoth,
}

/// 解决结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    LocalKept,
    ServerKept,
    /// 本机副本的新实体 ID
    BothKept { new_entity_id: String },
}

/// 冲突解决执行器
pub struct ConflictResolver {
    store: Arc<dyn Store>,
    remote: Arc<dyn RemoteApi>,
}

impl ConflictResolver {
    pub fn new(store: Arc<dyn Store>, remote: Arc<dyn RemoteApi>) -> Self {
        Self { store, remote }
    }

    pub async fn resolve(
        &self,
        conflict: &SyncConflict,
        strategy: ResolutionStrategy,
    ) -> Result<ResolutionOutcome> {
        match strategy {
            ResolutionStrategy::KeepLocal => self.keep_local(conflict).await,
            ResolutionStrategy::KeepServer => self.keep_server(conflict),
            ResolutionStrategy::KeepBoth => self.keep_both(conflict),
        }
    }

    /// 本机版本立即推送远端，成功后才清理本地待推送状态
    async fn keep_local(&self, conflict: &SyncConflict) -> Result<ResolutionOutcome> {
        let mut local = conflict.local_record();
        if let Err(err) = self.remote.push(&local).await {
            warn!(
                "[ConflictResolver] KeepLocal 推送失败，冲突保持原样: {} {}: {}",
                conflict.entity_type(),
                conflict.entity_id(),
                err
            );
            return Err(err);
        }
        local.synced = true;
        self.store.apply(&[
            StoreOp::UpsertEntity(local),
            StoreOp::MarkEntityMutationsSynced {
                entity_type: conflict.entity_type(),
                entity_id: conflict.entity_id().to_string(),
            },
        ])?;
        info!(
            "[ConflictResolver] 冲突已按 KeepLocal 解决: {} {}",
            conflict.entity_type(),
            conflict.entity_id()
        );
        Ok(ResolutionOutcome::LocalKept)
    }

    /// 远端版本整体覆盖，本机待推送的变更日志一并丢弃
    fn keep_server(&self, conflict: &SyncConflict) -> Result<ResolutionOutcome> {
        self.store.apply(&[
            StoreOp::UpsertEntity(conflict.server_record()),
            StoreOp::DeleteEntityMutations {
                entity_type: conflict.entity_type(),
                entity_id: conflict.entity_id().to_string(),
            },
        ])?;
        info!(
            "[ConflictResolver] 冲突已按 KeepServer 解决: {} {}",
            conflict.entity_type(),
            conflict.entity_id()
        );
        Ok(ResolutionOutcome::ServerKept)
    }

    /// 原 ID 让给远端版本，本机版本克隆为新实体并排队推送
    fn keep_both(&self, conflict: &SyncConflict) -> Result<ResolutionOutcome> {
        let new_id = Uuid::new_v4().to_string();
        let local = conflict.local_record();
        let copy_payload = local.payload.clone_with_new_id(&new_id);
        let copy = crate::models::EntityRecord::from_payload(copy_payload, false);
        let mutation = MutationRecord::new(conflict.entity_type(), new_id.clone());

        self.store.apply(&[
            StoreOp::UpsertEntity(conflict.server_record()),
            StoreOp::DeleteEntityMutations {
                entity_type: conflict.entity_type(),
                entity_id: conflict.entity_id().to_string(),
            },
            StoreOp::UpsertEntity(copy),
            StoreOp::EnqueueMutation(mutation),
        ])?;
        info!(
            "[ConflictResolver] 冲突已按 KeepBoth 解决: {} {}，本机副本 {}",
            conflict.entity_type(),
            conflict.entity_id(),
            new_id
        );
        Ok(ResolutionOutcome::BothKept {
            new_entity_id: new_id,
        })
    }
}
