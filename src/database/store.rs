//! SqliteStore - 持久层契约的生产实现
//!
//! 实体以 JSON 载荷落在 `entities` 表，变更日志、同步水位线与
//! 导入台账各占一张表。`apply` 映射为单个 sqlite 事务。

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use std::sync::Arc;

use super::DatabaseManager;
use crate::import::registry::ImportRecord;
use crate::models::{AppError, EntityRecord, EntityType, Result};
use crate::store::{ChangeLog, EntityStore, ImportLedger, StoreOp};
use crate::sync::change_log::{MutationRecord, MAX_PUSH_ATTEMPTS};

/// sqlite 存储
pub struct SqliteStore {
    manager: Arc<DatabaseManager>,
}

/// 解析落库的时间戳（RFC3339，兼容旧的无时区格式）
fn parse_datetime(datetime_str: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(datetime_str) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive_dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive_dt, Utc));
    }
    Err(AppError::database(format!(
        "无法解析时间戳: {}",
        datetime_str
    )))
}

fn parse_entity_type(code: &str) -> Result<EntityType> {
    EntityType::from_str_code(code)
        .ok_or_else(|| AppError::database(format!("未知实体类型码: {}", code)))
}

/// entities 行的原始列（payload 延迟解析，避免在 rusqlite 闭包里携带 serde 错误）
type RawEntityRow = (String, String, String, String, bool);

fn build_entity_record(row: RawEntityRow) -> Result<EntityRecord> {
    let (type_code, entity_id, payload_json, updated_at, synced) = row;
    Ok(EntityRecord {
        entity_type: parse_entity_type(&type_code)?,
        entity_id,
        updated_at: parse_datetime(&updated_at)?,
        synced,
        payload: serde_json::from_str(&payload_json)?,
    })
}

type RawMutationRow = (
    String,
    String,
    String,
    String,
    bool,
    u32,
    Option<String>,
    Option<String>,
);

fn build_mutation_record(row: RawMutationRow) -> Result<MutationRecord> {
    let (id, type_code, entity_id, created_at, synced, attempts, last_attempt_at, last_error) = row;
    Ok(MutationRecord {
        id,
        entity_type: parse_entity_type(&type_code)?,
        entity_id,
        created_at: parse_datetime(&created_at)?,
        synced,
        attempts,
        last_attempt_at: match last_attempt_at {
            Some(s) => Some(parse_datetime(&s)?),
            None => None,
        },
        last_error,
    })
}

impl SqliteStore {
    pub fn new(manager: Arc<DatabaseManager>) -> Self {
        Self { manager }
    }

    fn conn(&self) -> Result<super::SqlitePooledConnection> {
        self.manager.get_conn().map_err(AppError::from)
    }

    fn query_entities(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<EntityRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(build_entity_record(row?)?);
        }
        Ok(records)
    }

    fn query_mutations(&self, sql: &str) -> Result<Vec<MutationRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(build_mutation_record(row?)?);
        }
        Ok(records)
    }

    fn exec_op(tx: &Transaction<'_>, op: &StoreOp) -> Result<()> {
        match op {
            StoreOp::UpsertEntity(record) => {
                tx.execute(
                    "INSERT OR REPLACE INTO entities (entity_type, entity_id, payload, updated_at, synced)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        record.entity_type.as_str(),
                        record.entity_id,
                        serde_json::to_string(&record.payload)?,
                        record.updated_at.to_rfc3339(),
                        record.synced,
                    ],
                )?;
            }
            StoreOp::DeleteEntity {
                entity_type,
                entity_id,
            } => {
                tx.execute(
                    "DELETE FROM entities WHERE entity_type = ?1 AND entity_id = ?2",
                    params![entity_type.as_str(), entity_id],
                )?;
            }
            StoreOp::SetSynced {
                entity_type,
                entity_id,
                synced,
            } => {
                let changed = tx.execute(
                    "UPDATE entities SET synced = ?3 WHERE entity_type = ?1 AND entity_id = ?2",
                    params![entity_type.as_str(), entity_id, synced],
                )?;
                if changed == 0 {
                    return Err(AppError::not_found(format!(
                        "实体不存在: {} {}",
                        entity_type, entity_id
                    )));
                }
            }
            StoreOp::EnqueueMutation(m) => {
                tx.execute(
                    "INSERT INTO mutation_log
                         (id, entity_type, entity_id, created_at, synced, attempts, last_attempt_at, last_error)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        m.id,
                        m.entity_type.as_str(),
                        m.entity_id,
                        m.created_at.to_rfc3339(),
                        m.synced,
                        m.attempts,
                        m.last_attempt_at.map(|t| t.to_rfc3339()),
                        m.last_error,
                    ],
                )?;
            }
            StoreOp::MarkEntityMutationsSynced {
                entity_type,
                entity_id,
            } => {
                tx.execute(
                    "UPDATE mutation_log SET synced = 1
                     WHERE entity_type = ?1 AND entity_id = ?2",
                    params![entity_type.as_str(), entity_id],
                )?;
            }
            StoreOp::DeleteEntityMutations {
                entity_type,
                entity_id,
            } => {
                tx.execute(
                    "DELETE FROM mutation_log WHERE entity_type = ?1 AND entity_id = ?2",
                    params![entity_type.as_str(), entity_id],
                )?;
            }
            StoreOp::RegisterImport { transfer_id } => {
                // 台账永不覆盖：冲突时保持原 imported_at
                tx.execute(
                    "INSERT INTO import_registry (transfer_id, imported_at) VALUES (?1, ?2)
                     ON CONFLICT(transfer_id) DO NOTHING",
                    params![transfer_id, Utc::now().to_rfc3339()],
                )?;
            }
        }
        Ok(())
    }
}

impl EntityStore for SqliteStore {
    fn get(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<EntityRecord>> {
        let conn = self.conn()?;
        let row: Option<RawEntityRow> = conn
            .query_row(
                "SELECT entity_type, entity_id, payload, updated_at, synced
                 FROM entities WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity_type.as_str(), entity_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        row.map(build_entity_record).transpose()
    }

    fn list(&self, entity_type: EntityType) -> Result<Vec<EntityRecord>> {
        self.query_entities(
            "SELECT entity_type, entity_id, payload, updated_at, synced
             FROM entities WHERE entity_type = ?1 ORDER BY entity_id",
            &[&entity_type.as_str()],
        )
    }

    fn upsert(&self, record: &EntityRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO entities (entity_type, entity_id, payload, updated_at, synced)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.entity_type.as_str(),
                record.entity_id,
                serde_json::to_string(&record.payload)?,
                record.updated_at.to_rfc3339(),
                record.synced,
            ],
        )?;
        Ok(())
    }

    fn delete(&self, entity_type: EntityType, entity_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM entities WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type.as_str(), entity_id],
        )?;
        Ok(())
    }

    fn set_synced(&self, entity_type: EntityType, entity_id: &str, synced: bool) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE entities SET synced = ?3 WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type.as_str(), entity_id, synced],
        )?;
        if changed == 0 {
            return Err(AppError::not_found(format!(
                "实体不存在: {} {}",
                entity_type, entity_id
            )));
        }
        Ok(())
    }

    fn unsynced(&self, entity_type: EntityType) -> Result<Vec<EntityRecord>> {
        self.query_entities(
            "SELECT entity_type, entity_id, payload, updated_at, synced
             FROM entities WHERE entity_type = ?1 AND synced = 0 ORDER BY entity_id",
            &[&entity_type.as_str()],
        )
    }

    fn changed_since(
        &self,
        entity_type: EntityType,
        since: DateTime<Utc>,
    ) -> Result<Vec<EntityRecord>> {
        self.query_entities(
            "SELECT entity_type, entity_id, payload, updated_at, synced
             FROM entities WHERE entity_type = ?1 AND updated_at > ?2 ORDER BY entity_id",
            &[&entity_type.as_str(), &since.to_rfc3339()],
        )
    }

    fn watermark(&self, entity_type: EntityType) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT last_synced_at FROM sync_watermarks WHERE entity_type = ?1",
                params![entity_type.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| parse_datetime(&s)).transpose()
    }

    fn set_watermark(&self, entity_type: EntityType, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO sync_watermarks (entity_type, last_synced_at) VALUES (?1, ?2)",
            params![entity_type.as_str(), at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn apply(&self, ops: &[StoreOp]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for op in ops {
            Self::exec_op(&tx, op)?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl ChangeLog for SqliteStore {
    fn record(&self, entity_type: EntityType, entity_id: &str) -> Result<MutationRecord> {
        let rec = MutationRecord::new(entity_type, entity_id);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO mutation_log
                 (id, entity_type, entity_id, created_at, synced, attempts, last_attempt_at, last_error)
             VALUES (?1, ?2, ?3, ?4, 0, 0, NULL, NULL)",
            params![
                rec.id,
                rec.entity_type.as_str(),
                rec.entity_id,
                rec.created_at.to_rfc3339(),
            ],
        )?;
        Ok(rec)
    }

    fn pending(&self) -> Result<Vec<MutationRecord>> {
        self.query_mutations(&format!(
            "SELECT id, entity_type, entity_id, created_at, synced, attempts, last_attempt_at, last_error
             FROM mutation_log WHERE synced = 0 AND attempts < {}
             ORDER BY created_at, id",
            MAX_PUSH_ATTEMPTS
        ))
    }

    fn failed(&self) -> Result<Vec<MutationRecord>> {
        self.query_mutations(&format!(
            "SELECT id, entity_type, entity_id, created_at, synced, attempts, last_attempt_at, last_error
             FROM mutation_log WHERE synced = 0 AND attempts >= {}
             ORDER BY created_at, id",
            MAX_PUSH_ATTEMPTS
        ))
    }

    fn failed_count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mutation_log WHERE synced = 0 AND attempts >= ?1",
            params![MAX_PUSH_ATTEMPTS],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn get_mutation(&self, mutation_id: &str) -> Result<Option<MutationRecord>> {
        let conn = self.conn()?;
        let row: Option<RawMutationRow> = conn
            .query_row(
                "SELECT id, entity_type, entity_id, created_at, synced, attempts, last_attempt_at, last_error
                 FROM mutation_log WHERE id = ?1",
                params![mutation_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .optional()?;
        row.map(build_mutation_record).transpose()
    }

    fn mark_synced(&self, mutation_id: &str) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE mutation_log SET synced = 1 WHERE id = ?1",
            params![mutation_id],
        )?;
        if changed == 0 {
            return Err(AppError::not_found(format!(
                "变更记录不存在: {}",
                mutation_id
            )));
        }
        Ok(())
    }

    fn record_failure(&self, mutation_id: &str, error: &str, at: DateTime<Utc>) -> Result<u32> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        // attempts 永不越过上限
        let changed = tx.execute(
            "UPDATE mutation_log
             SET attempts = MIN(attempts + 1, ?2), last_attempt_at = ?3, last_error = ?4
             WHERE id = ?1",
            params![mutation_id, MAX_PUSH_ATTEMPTS, at.to_rfc3339(), error],
        )?;
        if changed == 0 {
            return Err(AppError::not_found(format!(
                "变更记录不存在: {}",
                mutation_id
            )));
        }
        let attempts: u32 = tx.query_row(
            "SELECT attempts FROM mutation_log WHERE id = ?1",
            params![mutation_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(attempts)
    }

    fn reset_failed(&self, ids: Option<&[String]>) -> Result<u64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut reset = 0usize;
        match ids {
            Some(ids) => {
                for id in ids {
                    reset += tx.execute(
                        "UPDATE mutation_log SET attempts = 0
                         WHERE id = ?1 AND synced = 0 AND attempts >= ?2",
                        params![id, MAX_PUSH_ATTEMPTS],
                    )?;
                }
            }
            None => {
                reset = tx.execute(
                    "UPDATE mutation_log SET attempts = 0
                     WHERE synced = 0 AND attempts >= ?1",
                    params![MAX_PUSH_ATTEMPTS],
                )?;
            }
        }
        tx.commit()?;
        Ok(reset as u64)
    }

    fn prune_synced(&self, before: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn()?;
        let pruned = conn.execute(
            "DELETE FROM mutation_log WHERE synced = 1 AND created_at < ?1",
            params![before.to_rfc3339()],
        )?;
        Ok(pruned as u64)
    }
}

impl ImportLedger for SqliteStore {
    fn get_by_transfer_id(&self, transfer_id: &str) -> Result<Option<ImportRecord>> {
        let conn = self.conn()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT transfer_id, imported_at FROM import_registry WHERE transfer_id = ?1",
                params![transfer_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(transfer_id, imported_at)| {
            Ok(ImportRecord {
                transfer_id,
                imported_at: parse_datetime(&imported_at)?,
            })
        })
        .transpose()
    }

    fn register(&self, transfer_id: &str) -> Result<ImportRecord> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO import_registry (transfer_id, imported_at) VALUES (?1, ?2)
             ON CONFLICT(transfer_id) DO NOTHING",
            params![transfer_id, Utc::now().to_rfc3339()],
        )?;
        // 回读保证拿到的是台账里实际存在的记录（含首次导入时间）
        self.get_by_transfer_id(transfer_id)?
            .ok_or_else(|| AppError::database(format!("导入台账登记失败: {}", transfer_id)))
    }
}
