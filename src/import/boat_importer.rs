//! 船只档案导入器
//!
//! 导入前按船名/注册编号查重，把"更新现有"还是"新建"的选择交给用户，
//! 绝不盲目插入。落库、变更日志与台账登记在同一事务内完成。

use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::models::{Boat, EntityPayload, EntityRecord, EntityType, Result};
use crate::qr::payload::BoatTransfer;
use crate::store::{Store, StoreOp};
use crate::sync::change_log::MutationRecord;

/// 查重后的导入方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoatImportMode {
    /// 新建船只
    CreateNew,
    /// 更新已有船只（携带本机实体 ID）
    UpdateExisting(String),
}

pub struct BoatImporter {
    store: Arc<dyn Store>,
}

impl BoatImporter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// 按船名（去空白、不区分大小写）或注册编号（精确）查找重复船只
    pub fn find_duplicate(
        &self,
        name: &str,
        official_number: Option<&str>,
    ) -> Result<Option<Boat>> {
        let wanted_name = name.trim().to_lowercase();
        for record in self.store.list(EntityType::Boat)? {
            let EntityPayload::Boat(boat) = record.payload else {
                continue;
            };
            if boat.name.trim().to_lowercase() == wanted_name {
                return Ok(Some(boat));
            }
            if let (Some(wanted), Some(existing)) = (official_number, boat.official_number.as_deref())
            {
                if wanted == existing {
                    return Ok(Some(boat));
                }
            }
        }
        Ok(None)
    }

    /// 导入船只档案
    ///
    /// 实体写入、变更日志追加与台账登记作为一批原子操作落库。
    pub fn import_boat(
        &self,
        transfer: &BoatTransfer,
        mode: BoatImportMode,
        transfer_id: &str,
    ) -> Result<Boat> {
        let now = Utc::now();
        let boat = match &mode {
            BoatImportMode::CreateNew => Boat {
                id: uuid::Uuid::new_v4().to_string(),
                name: transfer.name.clone(),
                official_number: transfer.official_number.clone(),
                boat_type: transfer.boat_type.clone(),
                home_port: transfer.home_port.clone(),
                created_at: now,
                updated_at: now,
            },
            BoatImportMode::UpdateExisting(id) => {
                let existing = self
                    .store
                    .get(EntityType::Boat, id)?
                    .ok_or_else(|| format!("待更新的船只不存在: {}", id))?;
                let EntityPayload::Boat(existing) = existing.payload else {
                    return Err(format!("实体类型不是船只: {}", id).into());
                };
                Boat {
                    id: existing.id,
                    name: transfer.name.clone(),
                    official_number: transfer
                        .official_number
                        .clone()
                        .or(existing.official_number),
                    boat_type: transfer.boat_type.clone().or(existing.boat_type),
                    home_port: transfer.home_port.clone().or(existing.home_port),
                    created_at: existing.created_at,
                    updated_at: now,
                }
            }
        };

        let record = EntityRecord::from_payload(EntityPayload::Boat(boat.clone()), false);
        let mutation = MutationRecord::new(EntityType::Boat, &boat.id);
        self.store.apply(&[
            StoreOp::UpsertEntity(record),
            StoreOp::EnqueueMutation(mutation),
            StoreOp::RegisterImport {
                transfer_id: transfer_id.to_string(),
            },
        ])?;

        info!(
            "[BoatImporter] 已导入船只 {}（{:?}，传输 {}）",
            boat.name, mode, transfer_id
        );
        Ok(boat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChangeLog, EntityStore, ImportLedger, MemoryStore};

    fn transfer(name: &str, number: Option<&str>) -> BoatTransfer {
        BoatTransfer {
            name: name.into(),
            official_number: number.map(String::from),
            boat_type: None,
            home_port: None,
        }
    }

    #[test]
    fn create_new_enqueues_mutation_and_registers_transfer() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let importer = BoatImporter::new(store.clone());

        let boat = importer.import_boat(
            &transfer("海燕号", Some("CN-12345")),
            BoatImportMode::CreateNew,
            "transfer-1",
        )?;

        let record = store
            .get(EntityType::Boat, &boat.id)?
            .expect("船只应已落库");
        assert!(!record.synced);
        assert_eq!(store.pending()?.len(), 1);
        assert!(store.get_by_transfer_id("transfer-1")?.is_some());
        Ok(())
    }

    #[test]
    fn duplicate_detection_matches_name_case_insensitively() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let importer = BoatImporter::new(store.clone());
        let boat = importer.import_boat(
            &transfer("Sea Swallow", Some("CN-1")),
            BoatImportMode::CreateNew,
            "t1",
        )?;

        assert!(importer.find_duplicate("  sea swallow ", None)?.is_some());
        assert!(importer.find_duplicate("别的船", Some("CN-1"))?.is_some());
        assert!(importer.find_duplicate("别的船", Some("CN-2"))?.is_none());

        // 更新现有：ID 不变，字段被覆盖
        let updated = importer.import_boat(
            &transfer("Sea Swallow II", None),
            BoatImportMode::UpdateExisting(boat.id.clone()),
            "t2",
        )?;
        assert_eq!(updated.id, boat.id);
        assert_eq!(updated.name, "Sea Swallow II");
        assert_eq!(updated.official_number.as_deref(), Some("CN-1"));
        Ok(())
    }
}
