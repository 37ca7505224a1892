//! 同步引擎端到端测试（sqlite 持久层）

mod common;

use common::{boat_record, sqlite_store, trip_record, MockRemote};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use skipperlog::config::SyncConfig;
use skipperlog::models::{EntityPayload, EntityType};
use skipperlog::store::{ChangeLog, EntityStore};
use skipperlog::sync::{
    ConflictResolver, ResolutionOutcome, ResolutionStrategy, SyncOrchestrator, SyncOutcome,
    SyncReport, SyncStage,
};

fn expect_completed(outcome: SyncOutcome) -> SyncReport {
    match outcome {
        SyncOutcome::Completed(report) => report,
        SyncOutcome::AlreadyRunning => panic!("期望 Completed，得到 AlreadyRunning"),
    }
}

#[tokio::test]
async fn full_sync_round_trip_on_sqlite() -> anyhow::Result<()> {
    let (store, _dir) = sqlite_store()?;
    store.upsert(&boat_record("b1", "海燕号", false))?;
    store.record(EntityType::Boat, "b1")?;
    let remote = Arc::new(MockRemote::with_pull(
        EntityType::Trip,
        vec![trip_record("t1", "b1", true)],
    ));
    let orchestrator = SyncOrchestrator::new(store.clone(), remote.clone(), SyncConfig::default());
    let mut progress = orchestrator.subscribe();

    let report = expect_completed(orchestrator.perform_full_sync(&CancellationToken::new()).await?);
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.pulled, 1);
    assert!(report.conflicts.is_empty());
    assert_eq!(report.failed_mutations, 0);

    // 本地实体与变更日志都进入已同步状态，远端数据落库
    assert!(store.get(EntityType::Boat, "b1")?.unwrap().synced);
    assert!(store.pending()?.is_empty());
    assert!(store.get(EntityType::Trip, "t1")?.unwrap().synced);
    assert_eq!(remote.pushed.lock().unwrap().len(), 1);

    // 水位线按实体类型分别持久化
    for entity_type in EntityType::ALL {
        assert!(store.watermark(entity_type)?.is_some());
    }

    // 进度事件覆盖了三个阶段
    let mut seen_stages = Vec::new();
    while let Ok(event) = progress.try_recv() {
        seen_stages.push(event.stage);
    }
    assert!(seen_stages.contains(&SyncStage::UploadPending));
    assert!(seen_stages.contains(&SyncStage::Pull));
    assert!(seen_stages.contains(&SyncStage::Reconcile));
    Ok(())
}

#[tokio::test]
async fn five_failures_move_mutation_to_failed_bucket_for_good() -> anyhow::Result<()> {
    let (store, _dir) = sqlite_store()?;
    store.upsert(&boat_record("b1", "海燕号", false))?;
    let mutation = store.record(EntityType::Boat, "b1")?;
    let remote = Arc::new(MockRemote::default());
    remote.fail_push.store(true, Ordering::SeqCst);
    let orchestrator = SyncOrchestrator::new(store.clone(), remote.clone(), SyncConfig::default());

    // 连续 5 轮同步，每轮消耗一次尝试
    for expected in 1..=5u32 {
        let report =
            expect_completed(orchestrator.perform_full_sync(&CancellationToken::new()).await?);
        assert_eq!(report.push_failures, 1, "第 {} 轮应有一次失败", expected);
        assert_eq!(store.get_mutation(&mutation.id)?.unwrap().attempts, expected);
    }
    assert_eq!(store.failed_count()?, 1);
    let failed = store.failed()?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, mutation.id);

    // 第 6 轮：失败桶里的记录完全不再被碰
    let calls_before = remote.push_calls.load(Ordering::SeqCst);
    let report = expect_completed(orchestrator.perform_full_sync(&CancellationToken::new()).await?);
    assert_eq!(report.push_failures, 0);
    assert_eq!(remote.push_calls.load(Ordering::SeqCst), calls_before);
    assert_eq!(report.failed_mutations, 1);

    // 手动重试 + 网络恢复后才推送成功
    assert_eq!(orchestrator.retry_failed(None)?, 1);
    remote.fail_push.store(false, Ordering::SeqCst);
    let report = expect_completed(orchestrator.perform_full_sync(&CancellationToken::new()).await?);
    assert_eq!(report.uploaded, 1);
    assert_eq!(store.failed_count()?, 0);
    assert!(store.get(EntityType::Boat, "b1")?.unwrap().synced);
    Ok(())
}

#[tokio::test]
async fn conflict_survives_sync_and_keep_both_forks_the_entity() -> anyhow::Result<()> {
    let (store, _dir) = sqlite_store()?;
    store.upsert(&boat_record("b1", "海燕号", false))?;
    // 把变更打进失败桶，让上传阶段不碰它，冲突在拉取阶段显形
    let mutation = store.record(EntityType::Boat, "b1")?;
    for _ in 0..5 {
        store.record_failure(&mutation.id, "网络超时", chrono::Utc::now())?;
    }
    let remote = Arc::new(MockRemote::with_pull(
        EntityType::Boat,
        vec![boat_record("b1", "信天翁号", true)],
    ));
    let orchestrator = SyncOrchestrator::new(store.clone(), remote.clone(), SyncConfig::default());

    let report = expect_completed(orchestrator.perform_full_sync(&CancellationToken::new()).await?);
    assert_eq!(report.conflicts.len(), 1);
    // 冲突记录未落库
    let local = store.get(EntityType::Boat, "b1")?.unwrap();
    assert!(matches!(&local.payload, EntityPayload::Boat(b) if b.name == "海燕号"));

    // KeepBoth：远端占原 ID，本机版本成为带标记的新实体
    let resolver = ConflictResolver::new(store.clone(), remote);
    let outcome = resolver
        .resolve(&report.conflicts[0], ResolutionStrategy::KeepBoth)
        .await?;
    let new_id = match outcome {
        ResolutionOutcome::BothKept { new_entity_id } => new_entity_id,
        other => panic!("期望 BothKept，得到 {:?}", other),
    };

    let original = store.get(EntityType::Boat, "b1")?.unwrap();
    assert!(original.synced);
    assert!(matches!(&original.payload, EntityPayload::Boat(b) if b.name == "信天翁号"));
    let copy = store.get(EntityType::Boat, &new_id)?.unwrap();
    assert!(!copy.synced);
    assert!(matches!(&copy.payload, EntityPayload::Boat(b) if b.name == "海燕号（本机副本）"));

    // 副本排队等待下一轮推送，原实体的旧变更已被丢弃
    let pending = store.pending()?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entity_id, new_id);
    assert_eq!(store.failed_count()?, 0);
    Ok(())
}

#[tokio::test]
async fn pull_failure_leaves_watermarks_untouched() -> anyhow::Result<()> {
    let (store, _dir) = sqlite_store()?;
    let remote = Arc::new(MockRemote::default());
    remote.fail_pull.store(true, Ordering::SeqCst);
    let orchestrator = SyncOrchestrator::new(store.clone(), remote, SyncConfig::default());

    assert!(orchestrator
        .perform_full_sync(&CancellationToken::new())
        .await
        .is_err());
    for entity_type in EntityType::ALL {
        assert!(store.watermark(entity_type)?.is_none());
    }
    Ok(())
}
