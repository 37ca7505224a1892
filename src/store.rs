//! 持久层窄契约
//!
//! 同步核心只依赖这里定义的三个 trait，不关心背后是 sqlite 还是内存：
//! - [`EntityStore`]：按实体类型的点查/列表/写入 + 水位线
//! - [`ChangeLog`]：待推送变更的追加与计数
//! - [`ImportLedger`]：二维码传输的永久台账（去重）
//!
//! 冲突解决与导入要求"要么全部落库、要么全部不落"，
//! 通过 [`StoreOp`] 批量原子应用表达（sqlite 实现映射为单事务）。

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::import::registry::ImportRecord;
use crate::models::{AppError, EntityRecord, EntityType, Result};
use crate::sync::change_log::MutationRecord;

// ============================================================================
// 原子操作批
// ============================================================================

/// 可原子应用的单个存储操作
///
/// 一批 [`StoreOp`] 由 [`EntityStore::apply`] 整体生效，
/// 中途崩溃不得留下半迁移状态。
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// 插入或整体替换实体
    UpsertEntity(EntityRecord),
    /// 删除实体（不存在时为空操作）
    DeleteEntity {
        entity_type: EntityType,
        entity_id: String,
    },
    /// 调整实体的已同步标记
    SetSynced {
        entity_type: EntityType,
        entity_id: String,
        synced: bool,
    },
    /// 追加一条变更日志
    EnqueueMutation(MutationRecord),
    /// 将某实体的全部变更日志标记为已同步
    MarkEntityMutationsSynced {
        entity_type: EntityType,
        entity_id: String,
    },
    /// 丢弃某实体的全部变更日志（KeepServer：用户显式放弃本地改动）
    DeleteEntityMutations {
        entity_type: EntityType,
        entity_id: String,
    },
    /// 登记二维码传输台账（已存在时保持原记录，绝不覆盖）
    RegisterImport { transfer_id: String },
}

// ============================================================================
// 契约 trait
// ============================================================================

/// 实体存储契约（按实体类型的 CRUD + 变更查询）
pub trait EntityStore: Send + Sync {
    /// 点查
    fn get(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<EntityRecord>>;

    /// 某类型的全部记录
    fn list(&self, entity_type: EntityType) -> Result<Vec<EntityRecord>>;

    /// 插入或整体替换
    fn upsert(&self, record: &EntityRecord) -> Result<()>;

    fn delete(&self, entity_type: EntityType, entity_id: &str) -> Result<()>;

    fn set_synced(&self, entity_type: EntityType, entity_id: &str, synced: bool) -> Result<()>;

    /// 本机有未推送改动的记录
    fn unsynced(&self, entity_type: EntityType) -> Result<Vec<EntityRecord>>;

    /// 自水位线以来发生过改动的记录（`updated_at > since`）
    fn changed_since(
        &self,
        entity_type: EntityType,
        since: DateTime<Utc>,
    ) -> Result<Vec<EntityRecord>>;

    /// 每实体类型的"上次同步达成一致"水位线
    fn watermark(&self, entity_type: EntityType) -> Result<Option<DateTime<Utc>>>;

    /// 推进水位线（仅在该类型拉取完整成功后调用）
    fn set_watermark(&self, entity_type: EntityType, at: DateTime<Utc>) -> Result<()>;

    /// 原子应用一批操作
    fn apply(&self, ops: &[StoreOp]) -> Result<()>;
}

/// 变更日志契约
///
/// `record` 只做本地追加，调用方不得在其中等待网络。
pub trait ChangeLog: Send + Sync {
    /// 本地写入时追加一条待推送记录
    fn record(&self, entity_type: EntityType, entity_id: &str) -> Result<MutationRecord>;

    /// 未同步且尝试次数未达上限的记录，按创建时间 FIFO
    fn pending(&self) -> Result<Vec<MutationRecord>>;

    /// 失败桶：未同步且已达尝试上限的记录
    fn failed(&self) -> Result<Vec<MutationRecord>>;

    /// 失败桶大小（界面上与 pending 分开展示，绝不合并）
    fn failed_count(&self) -> Result<u64>;

    fn get_mutation(&self, mutation_id: &str) -> Result<Option<MutationRecord>>;

    /// 推送成功后标记
    fn mark_synced(&self, mutation_id: &str) -> Result<()>;

    /// 推送失败登记：attempts+1、记录时间与原因，返回新的尝试次数
    fn record_failure(
        &self,
        mutation_id: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<u32>;

    /// 手动重试失败记录：attempts 清零
    ///
    /// `ids` 为 None 时重置全部失败记录，返回重置条数。
    fn reset_failed(&self, ids: Option<&[String]>) -> Result<u64>;

    /// 清理早于 `before` 的已同步记录，返回清理条数
    fn prune_synced(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// 二维码传输台账契约
pub trait ImportLedger: Send + Sync {
    /// 查询该传输是否已导入过
    fn get_by_transfer_id(&self, transfer_id: &str) -> Result<Option<ImportRecord>>;

    /// 登记传输；已存在时返回原记录（永不覆盖）
    fn register(&self, transfer_id: &str) -> Result<ImportRecord>;
}

/// 完整存储：三个契约的汇总，生产实现为 `SqliteStore`
pub trait Store: EntityStore + ChangeLog + ImportLedger {}

impl<T: EntityStore + ChangeLog + ImportLedger> Store for T {}

// ============================================================================
// 内存实现（测试与嵌入式场景）
// ============================================================================

#[derive(Default, Clone)]
struct MemoryInner {
    entities: HashMap<(EntityType, String), EntityRecord>,
    mutations: Vec<MutationRecord>,
    watermarks: HashMap<EntityType, DateTime<Utc>>,
    imports: HashMap<String, ImportRecord>,
}

/// 基于内存的完整存储实现
///
/// 行为与 `SqliteStore` 等价，供单元测试与无持久化的嵌入场景使用。
/// `apply` 在单把锁内完成，满足原子性要求。
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            log::error!("[MemoryStore] 锁中毒，尝试恢复");
            poisoned.into_inner()
        })
    }

    fn apply_staged(inner: &mut MemoryInner, op: &StoreOp) -> Result<()> {
        match op {
            StoreOp::UpsertEntity(record) => {
                inner.entities.insert(
                    (record.entity_type, record.entity_id.clone()),
                    record.clone(),
                );
            }
            StoreOp::DeleteEntity {
                entity_type,
                entity_id,
            } => {
                inner.entities.remove(&(*entity_type, entity_id.clone()));
            }
            StoreOp::SetSynced {
                entity_type,
                entity_id,
                synced,
            } => {
                let rec = inner
                    .entities
                    .get_mut(&(*entity_type, entity_id.clone()))
                    .ok_or_else(|| {
                        AppError::not_found(format!("实体不存在: {} {}", entity_type, entity_id))
                    })?;
                rec.synced = *synced;
            }
            StoreOp::EnqueueMutation(m) => inner.mutations.push(m.clone()),
            StoreOp::MarkEntityMutationsSynced {
                entity_type,
                entity_id,
            } => {
                for m in inner
                    .mutations
                    .iter_mut()
                    .filter(|m| m.entity_type == *entity_type && &m.entity_id == entity_id)
                {
                    m.synced = true;
                }
            }
            StoreOp::DeleteEntityMutations {
                entity_type,
                entity_id,
            } => {
                inner
                    .mutations
                    .retain(|m| !(m.entity_type == *entity_type && &m.entity_id == entity_id));
            }
            StoreOp::RegisterImport { transfer_id } => {
                inner
                    .imports
                    .entry(transfer_id.clone())
                    .or_insert_with(|| ImportRecord {
                        transfer_id: transfer_id.clone(),
                        imported_at: Utc::now(),
                    });
            }
        }
        Ok(())
    }
}

impl EntityStore for MemoryStore {
    fn get(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<EntityRecord>> {
        Ok(self
            .lock()
            .entities
            .get(&(entity_type, entity_id.to_string()))
            .cloned())
    }

    fn list(&self, entity_type: EntityType) -> Result<Vec<EntityRecord>> {
        let mut records: Vec<EntityRecord> = self
            .lock()
            .entities
            .values()
            .filter(|r| r.entity_type == entity_type)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(records)
    }

    fn upsert(&self, record: &EntityRecord) -> Result<()> {
        self.lock().entities.insert(
            (record.entity_type, record.entity_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    fn delete(&self, entity_type: EntityType, entity_id: &str) -> Result<()> {
        self.lock()
            .entities
            .remove(&(entity_type, entity_id.to_string()));
        Ok(())
    }

    fn set_synced(&self, entity_type: EntityType, entity_id: &str, synced: bool) -> Result<()> {
        let mut inner = self.lock();
        match inner.entities.get_mut(&(entity_type, entity_id.to_string())) {
            Some(rec) => {
                rec.synced = synced;
                Ok(())
            }
            None => Err(AppError::not_found(format!(
                "实体不存在: {} {}",
                entity_type, entity_id
            ))),
        }
    }

    fn unsynced(&self, entity_type: EntityType) -> Result<Vec<EntityRecord>> {
        Ok(self
            .lock()
            .entities
            .values()
            .filter(|r| r.entity_type == entity_type && !r.synced)
            .cloned()
            .collect())
    }

    fn changed_since(
        &self,
        entity_type: EntityType,
        since: DateTime<Utc>,
    ) -> Result<Vec<EntityRecord>> {
        Ok(self
            .lock()
            .entities
            .values()
            .filter(|r| r.entity_type == entity_type && r.updated_at > since)
            .cloned()
            .collect())
    }

    fn watermark(&self, entity_type: EntityType) -> Result<Option<DateTime<Utc>>> {
        Ok(self.lock().watermarks.get(&entity_type).copied())
    }

    fn set_watermark(&self, entity_type: EntityType, at: DateTime<Utc>) -> Result<()> {
        self.lock().watermarks.insert(entity_type, at);
        Ok(())
    }

    fn apply(&self, ops: &[StoreOp]) -> Result<()> {
        // 先在副本上执行全部操作，成功后整体替换，任一失败不留半迁移状态
        let mut inner = self.lock();
        let mut staged = inner.clone();
        for op in ops {
            Self::apply_staged(&mut staged, op)?;
        }
        *inner = staged;
        Ok(())
    }
}

impl ChangeLog for MemoryStore {
    fn record(&self, entity_type: EntityType, entity_id: &str) -> Result<MutationRecord> {
        let rec = MutationRecord::new(entity_type, entity_id);
        self.lock().mutations.push(rec.clone());
        Ok(rec)
    }

    fn pending(&self) -> Result<Vec<MutationRecord>> {
        let mut pending: Vec<MutationRecord> = self
            .lock()
            .mutations
            .iter()
            .filter(|m| m.is_pending())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(pending)
    }

    fn failed(&self) -> Result<Vec<MutationRecord>> {
        Ok(self
            .lock()
            .mutations
            .iter()
            .filter(|m| m.is_failed())
            .cloned()
            .collect())
    }

    fn failed_count(&self) -> Result<u64> {
        Ok(self.lock().mutations.iter().filter(|m| m.is_failed()).count() as u64)
    }

    fn get_mutation(&self, mutation_id: &str) -> Result<Option<MutationRecord>> {
        Ok(self
            .lock()
            .mutations
            .iter()
            .find(|m| m.id == mutation_id)
            .cloned())
    }

    fn mark_synced(&self, mutation_id: &str) -> Result<()> {
        let mut inner = self.lock();
        match inner.mutations.iter_mut().find(|m| m.id == mutation_id) {
            Some(m) => {
                m.synced = true;
                Ok(())
            }
            None => Err(AppError::not_found(format!(
                "变更记录不存在: {}",
                mutation_id
            ))),
        }
    }

    fn record_failure(&self, mutation_id: &str, error: &str, at: DateTime<Utc>) -> Result<u32> {
        use crate::sync::change_log::MAX_PUSH_ATTEMPTS;
        let mut inner = self.lock();
        match inner.mutations.iter_mut().find(|m| m.id == mutation_id) {
            Some(m) => {
                // attempts 永不越过上限
                m.attempts = (m.attempts + 1).min(MAX_PUSH_ATTEMPTS);
                m.last_attempt_at = Some(at);
                m.last_error = Some(error.to_string());
                Ok(m.attempts)
            }
            None => Err(AppError::not_found(format!(
                "变更记录不存在: {}",
                mutation_id
            ))),
        }
    }

    fn reset_failed(&self, ids: Option<&[String]>) -> Result<u64> {
        let mut inner = self.lock();
        let mut reset = 0u64;
        for m in inner.mutations.iter_mut().filter(|m| m.is_failed()) {
            if let Some(ids) = ids {
                if !ids.contains(&m.id) {
                    continue;
                }
            }
            m.attempts = 0;
            reset += 1;
        }
        Ok(reset)
    }

    fn prune_synced(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let before_len = inner.mutations.len();
        inner
            .mutations
            .retain(|m| !(m.synced && m.created_at < before));
        Ok((before_len - inner.mutations.len()) as u64)
    }
}

impl ImportLedger for MemoryStore {
    fn get_by_transfer_id(&self, transfer_id: &str) -> Result<Option<ImportRecord>> {
        Ok(self.lock().imports.get(transfer_id).cloned())
    }

    fn register(&self, transfer_id: &str) -> Result<ImportRecord> {
        let mut inner = self.lock();
        let rec = inner
            .imports
            .entry(transfer_id.to_string())
            .or_insert_with(|| ImportRecord {
                transfer_id: transfer_id.to_string(),
                imported_at: Utc::now(),
            });
        Ok(rec.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Boat, EntityPayload};
    use chrono::Duration;

    fn boat_record(id: &str, synced: bool) -> EntityRecord {
        let now = Utc::now();
        EntityRecord::from_payload(
            EntityPayload::Boat(Boat {
                id: id.to_string(),
                name: format!("测试船-{}", id),
                official_number: None,
                boat_type: None,
                home_port: None,
                created_at: now,
                updated_at: now,
            }),
            synced,
        )
    }

    #[test]
    fn upsert_get_round_trip() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let rec = boat_record("b1", false);
        store.upsert(&rec)?;
        let got = store.get(EntityType::Boat, "b1")?.expect("应能查到实体");
        assert_eq!(got, rec);
        assert_eq!(store.unsynced(EntityType::Boat)?.len(), 1);
        Ok(())
    }

    #[test]
    fn pending_is_fifo_and_excludes_failed() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let m1 = store.record(EntityType::Boat, "b1")?;
        let m2 = store.record(EntityType::Trip, "t1")?;
        // m1 打满尝试次数后进入失败桶
        for _ in 0..5 {
            store.record_failure(&m1.id, "网络超时", Utc::now())?;
        }
        let pending = store.pending()?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, m2.id);
        assert_eq!(store.failed_count()?, 1);
        Ok(())
    }

    #[test]
    fn record_failure_never_exceeds_ceiling() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let m = store.record(EntityType::Note, "n1")?;
        for _ in 0..8 {
            store.record_failure(&m.id, "服务器 500", Utc::now())?;
        }
        let got = store.get_mutation(&m.id)?.expect("变更记录应存在");
        assert_eq!(got.attempts, 5);
        Ok(())
    }

    #[test]
    fn reset_failed_returns_records_to_pending() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let m = store.record(EntityType::Boat, "b1")?;
        for _ in 0..5 {
            store.record_failure(&m.id, "网络超时", Utc::now())?;
        }
        assert!(store.pending()?.is_empty());
        let failed = store.failed()?;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, m.id);
        assert_eq!(store.reset_failed(None)?, 1);
        assert_eq!(store.pending()?.len(), 1);
        assert!(store.failed()?.is_empty());
        assert_eq!(store.failed_count()?, 0);
        Ok(())
    }

    #[test]
    fn prune_only_removes_old_synced() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let m1 = store.record(EntityType::Boat, "b1")?;
        let _m2 = store.record(EntityType::Trip, "t1")?;
        store.mark_synced(&m1.id)?;
        let pruned = store.prune_synced(Utc::now() + Duration::seconds(1))?;
        assert_eq!(pruned, 1);
        // 未同步记录不受清理影响
        assert_eq!(store.pending()?.len(), 1);
        Ok(())
    }

    #[test]
    fn apply_is_all_or_nothing() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let ops = vec![
            StoreOp::UpsertEntity(boat_record("b1", false)),
            // 第二个操作指向不存在的实体，整批都不应生效
            StoreOp::SetSynced {
                entity_type: EntityType::Trip,
                entity_id: "missing".into(),
                synced: true,
            },
        ];
        assert!(store.apply(&ops).is_err());
        assert!(store.get(EntityType::Boat, "b1")?.is_none());
        Ok(())
    }

    #[test]
    fn import_register_never_overwrites() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let first = store.register("transfer-1")?;
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.register("transfer-1")?;
        assert_eq!(first.imported_at, second.imported_at);
        Ok(())
    }
}
