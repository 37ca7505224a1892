//! 航程批量导入器
//!
//! 导入前对同船已有航程做时间区间重叠检测（端点相接也算重叠），
//! 由用户决定跳过哪些候选；未跳过的逐条原子落库，
//! 部分成功是正常结果而非错误。

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::{EntityPayload, EntityRecord, EntityType, Result, Trip};
use crate::qr::payload::TripTransfer;
use crate::store::{Store, StoreOp};
use crate::sync::change_log::MutationRecord;

/// 二维码导入航程的来源标识
pub const ORIGIN_QR_TRANSFER: &str = "qr_transfer";

pub struct TripImporter {
    store: Arc<dyn Store>,
}

impl TripImporter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// 对每个候选航程找出同船已有航程中与之时间重叠的记录
    ///
    /// 区间判定为闭区间相交：`a <= d && b >= c`，端点相接计为重叠。
    /// 返回 候选下标 → 重叠的已有航程 列表，无重叠的候选不出现在结果里。
    pub fn find_overlaps(
        &self,
        boat_id: &str,
        candidates: &[TripTransfer],
    ) -> Result<HashMap<usize, Vec<Trip>>> {
        let existing: Vec<Trip> = self
            .store
            .list(EntityType::Trip)?
            .into_iter()
            .filter_map(|record| match record.payload {
                EntityPayload::Trip(trip) if trip.boat_id == boat_id => Some(trip),
                _ => None,
            })
            .collect();

        let mut overlaps: HashMap<usize, Vec<Trip>> = HashMap::new();
        for (index, candidate) in candidates.iter().enumerate() {
            let hits: Vec<Trip> = existing
                .iter()
                .filter(|trip| {
                    candidate.start_time <= trip.end_time && candidate.end_time >= trip.start_time
                })
                .cloned()
                .collect();
            if !hits.is_empty() {
                overlaps.insert(index, hits);
            }
        }
        Ok(overlaps)
    }

    /// 导入一批航程，跳过 `skip_indices` 指定的候选，返回实际插入条数
    ///
    /// 每条航程（实体 + 变更日志）单独成批原子落库；
    /// 首条插入成功后立即登记传输台账，此后即使中途失败，
    /// 已插入的航程与台账记录都保持有效。
    pub fn import_trips(
        &self,
        boat_id: &str,
        trips: &[TripTransfer],
        skip_indices: &HashSet<usize>,
        transfer_id: &str,
    ) -> Result<u32> {
        let mut inserted = 0u32;
        for (index, transfer) in trips.iter().enumerate() {
            if skip_indices.contains(&index) {
                debug!("[TripImporter] 跳过候选航程 #{}", index);
                continue;
            }

            let now = Utc::now();
            let trip = Trip {
                id: uuid::Uuid::new_v4().to_string(),
                boat_id: boat_id.to_string(),
                title: transfer.title.clone(),
                start_time: transfer.start_time,
                end_time: transfer.end_time,
                distance_nm: transfer.distance_nm,
                notes: transfer.notes.clone(),
                origin_source: Some(ORIGIN_QR_TRANSFER.to_string()),
                origin_id: Some(transfer.origin_id.clone()),
                created_at: now,
                updated_at: now,
            };

            let record = EntityRecord::from_payload(EntityPayload::Trip(trip.clone()), false);
            let mutation = MutationRecord::new(EntityType::Trip, &trip.id);
            let mut ops = vec![
                StoreOp::UpsertEntity(record),
                StoreOp::EnqueueMutation(mutation),
            ];
            // 任一条插入成功即视为该传输已导入
            if inserted == 0 {
                ops.push(StoreOp::RegisterImport {
                    transfer_id: transfer_id.to_string(),
                });
            }
            self.store.apply(&ops)?;
            inserted += 1;
        }

        info!(
            "[TripImporter] 传输 {} 导入完成: 插入 {} 条，跳过 {} 条",
            transfer_id,
            inserted,
            skip_indices.len()
        );
        Ok(inserted)
    }
}
