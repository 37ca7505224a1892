//! 同步编排器
//!
//! 单次同步按固定顺序走三个阶段：
//! 1. 上传：把 pending 队列里的本地变更逐条推送远端；
//! 2. 拉取：按实体类型拉取远端自水位线以来的改动并落库；
//! 3. 对账：汇总冲突、清理过期变更日志。
//!
//! 全程单飞：同一时刻最多一次同步在跑，重入直接返回
//! [`SyncOutcome::AlreadyRunning`]。进度通过 broadcast 通道对外广播，
//! 取消点设在每个实体边界上，进行中的单实体写入要么完成要么整体回滚。

use backon::Retryable;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::models::{AppError, AppErrorType, EntityType, Result};
use crate::store::{Store, StoreOp};
use crate::sync::conflict::{ConflictDetector, SyncConflict};
use crate::sync::retry::{transient_backoff, RetryScheduler};
use crate::sync::remote::RemoteApi;

// ============================================================================
// 进度与结果
// ============================================================================

/// 同步阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    UploadPending,
    Pull,
    Reconcile,
}

/// 对外广播的进度事件
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub stage: SyncStage,
    pub current: u32,
    pub total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub failed: bool,
}

/// 一次同步的结果汇总
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// 成功推送的实体数
    pub uploaded: u32,
    /// 本次消耗了一次尝试的推送失败数
    pub push_failures: u32,
    /// 落库的远端记录数
    pub pulled: u32,
    /// 待用户裁决的冲突（对应记录未落库）
    pub conflicts: Vec<SyncConflict>,
    /// 同步结束时失败桶的大小
    pub failed_mutations: u64,
    /// 是否被取消（已完成的部分保持生效）
    pub cancelled: bool,
}

/// 同步调用的出口
#[derive(Debug)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// 已有同步在跑，本次调用未做任何事
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy)]
enum SyncMode {
    /// 首次同步：忽略水位线，全量拉取
    Initial,
    /// 常规同步：按水位线增量拉取
    Incremental,
}

// ============================================================================
// 编排器
// ============================================================================

pub struct SyncOrchestrator {
    store: Arc<dyn Store>,
    remote: Arc<dyn RemoteApi>,
    retry: RetryScheduler,
    detector: ConflictDetector,
    config: SyncConfig,
    /// 单飞锁：try_lock 失败即有同步在跑
    flight: tokio::sync::Mutex<()>,
    progress_tx: broadcast::Sender<SyncProgress>,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<dyn Store>, remote: Arc<dyn RemoteApi>, config: SyncConfig) -> Self {
        let (progress_tx, _) = broadcast::channel(64);
        Self {
            retry: RetryScheduler::new(store.clone()),
            detector: ConflictDetector::new(store.clone()),
            store,
            remote,
            config,
            flight: tokio::sync::Mutex::new(()),
            progress_tx,
        }
    }

    /// 订阅进度事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncProgress> {
        self.progress_tx.subscribe()
    }

    /// 首次同步：忽略水位线，拉取远端全量数据
    pub async fn perform_initial_sync(&self, cancel: &CancellationToken) -> Result<SyncOutcome> {
        self.run(SyncMode::Initial, cancel).await
    }

    /// 常规增量同步
    pub async fn perform_full_sync(&self, cancel: &CancellationToken) -> Result<SyncOutcome> {
        self.run(SyncMode::Incremental, cancel).await
    }

    /// 用户手动重试失败桶中的变更
    pub fn retry_failed(&self, ids: Option<&[String]>) -> Result<u64> {
        self.retry.retry_failed(ids)
    }

    fn emit(&self, stage: SyncStage, current: u32, total: u32, message: Option<String>, failed: bool) {
        // 没有订阅者时发送失败是正常情况
        let _ = self.progress_tx.send(SyncProgress {
            stage,
            current,
            total,
            message,
            failed,
        });
    }

    async fn run(&self, mode: SyncMode, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let _guard = match self.flight.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("[SyncOrchestrator] 已有同步在跑，忽略本次调用");
                return Ok(SyncOutcome::AlreadyRunning);
            }
        };

        let started_at = Utc::now();
        info!("[SyncOrchestrator] 同步开始（{:?}）", mode);
        let mut report = SyncReport::default();

        // ---- 阶段 1：上传本地待推送变更 ----
        if !self.upload_pending(cancel, &mut report).await? {
            return self.finish_cancelled(report);
        }

        // ---- 阶段 2：按实体类型拉取远端改动 ----
        for (index, entity_type) in EntityType::ALL.iter().enumerate() {
            if cancel.is_cancelled() {
                return self.finish_cancelled(report);
            }
            self.emit(
                SyncStage::Pull,
                index as u32,
                EntityType::ALL.len() as u32,
                Some(format!("正在拉取 {}", entity_type)),
                false,
            );
            if !self
                .pull_entity_type(*entity_type, mode, cancel, &mut report)
                .await?
            {
                return self.finish_cancelled(report);
            }
            // 该类型拉取完整成功，水位线才允许前进
            self.store.set_watermark(*entity_type, started_at)?;
        }

        // ---- 阶段 3：对账与清理 ----
        self.emit(
            SyncStage::Reconcile,
            0,
            1,
            Some(match report.conflicts.len() {
                0 => "同步完成".to_string(),
                n => format!("同步完成，{} 个冲突待处理", n),
            }),
            false,
        );
        let cutoff = started_at - Duration::days(self.config.mutation_retention_days as i64);
        let pruned = self.store.prune_synced(cutoff)?;
        if pruned > 0 {
            debug!("[SyncOrchestrator] 清理 {} 条过期变更日志", pruned);
        }
        report.failed_mutations = self.store.failed_count()?;
        self.emit(SyncStage::Reconcile, 1, 1, None, false);

        info!(
            "[SyncOrchestrator] 同步完成: 上传 {}，拉取 {}，冲突 {}，失败桶 {}",
            report.uploaded,
            report.pulled,
            report.conflicts.len(),
            report.failed_mutations
        );
        Ok(SyncOutcome::Completed(report))
    }

    /// 上传阶段；返回 false 表示被取消
    async fn upload_pending(
        &self,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<bool> {
        let pending = self.store.pending()?;
        let total = pending.len() as u32;
        // 推的是实体当前快照，同一实体的多条变更只推一次
        let mut handled: HashSet<(EntityType, String)> = HashSet::new();

        for (index, mutation) in pending.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            self.emit(SyncStage::UploadPending, index as u32, total, None, false);

            let key = (mutation.entity_type, mutation.entity_id.clone());
            if handled.contains(&key) {
                self.store.mark_synced(&mutation.id)?;
                continue;
            }

            let record = match self.store.get(mutation.entity_type, &mutation.entity_id)? {
                Some(record) => record,
                None => {
                    // 实体已在本机删除，这条变更没有可推的内容
                    debug!(
                        "[SyncOrchestrator] 变更 {} 对应实体已不存在，直接标记完成",
                        mutation.id
                    );
                    self.store.mark_synced(&mutation.id)?;
                    continue;
                }
            };

            // 瞬时网络抖动由指数退避吸收，整组退避只算一次尝试
            let push_result = (|| async { self.remote.push(&record).await })
                .retry(&transient_backoff())
                .when(|err: &AppError| err.error_type == AppErrorType::Network)
                .await;

            match push_result {
                Ok(()) => {
                    self.store.apply(&[
                        StoreOp::SetSynced {
                            entity_type: mutation.entity_type,
                            entity_id: mutation.entity_id.clone(),
                            synced: true,
                        },
                        StoreOp::MarkEntityMutationsSynced {
                            entity_type: mutation.entity_type,
                            entity_id: mutation.entity_id.clone(),
                        },
                    ])?;
                    handled.insert(key);
                    report.uploaded += 1;
                }
                Err(err) => {
                    // 推送失败不阻塞整轮同步，只记一次尝试
                    self.retry.record_push_failure(&mutation.id, &err.message)?;
                    report.push_failures += 1;
                }
            }
        }
        self.emit(SyncStage::UploadPending, total, total, None, false);
        Ok(true)
    }

    /// 拉取并落库单个实体类型；返回 false 表示被取消
    async fn pull_entity_type(
        &self,
        entity_type: EntityType,
        mode: SyncMode,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<bool> {
        let since = match mode {
            SyncMode::Initial => None,
            SyncMode::Incremental => self.store.watermark(entity_type)?,
        };
        let records = match self.remote.pull(entity_type, since).await {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    "[SyncOrchestrator] 拉取 {} 失败，同步中止: {}",
                    entity_type, err
                );
                self.emit(
                    SyncStage::Pull,
                    0,
                    EntityType::ALL.len() as u32,
                    Some(format!("拉取 {} 失败: {}", entity_type, err)),
                    true,
                );
                return Err(err);
            }
        };

        for server_record in &records {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            if let Some(conflict) = self.detector.check(server_record)? {
                // 冲突的记录不落库，留给用户裁决
                report.conflicts.push(conflict);
                continue;
            }

            // 本机未推送但内容与远端一致：落库的同时清掉待推送状态
            let had_equal_unsynced = matches!(
                self.store.get(entity_type, &server_record.entity_id)?,
                Some(local) if !local.synced
            );
            let entity_id = server_record.entity_id.clone();
            let mut incoming = server_record.clone();
            incoming.synced = true;
            let mut ops = vec![StoreOp::UpsertEntity(incoming)];
            if had_equal_unsynced {
                ops.push(StoreOp::MarkEntityMutationsSynced {
                    entity_type,
                    entity_id,
                });
            }
            self.store.apply(&ops)?;
            report.pulled += 1;
        }
        Ok(true)
    }

    fn finish_cancelled(&self, mut report: SyncReport) -> Result<SyncOutcome> {
        report.cancelled = true;
        report.failed_mutations = self.store.failed_count()?;
        info!("[SyncOrchestrator] 同步已取消，已完成部分保持生效");
        self.emit(
            SyncStage::Reconcile,
            0,
            1,
            Some("同步已取消".to_string()),
            false,
        );
        Ok(SyncOutcome::Completed(report))
    }
}
