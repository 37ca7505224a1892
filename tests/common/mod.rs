//! 集成测试公共设施
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use tempfile::TempDir;

use skipperlog::database::{DatabaseManager, SqliteStore};
use skipperlog::models::{AppError, Boat, EntityPayload, EntityRecord, EntityType, Result, Trip};
use skipperlog::sync::RemoteApi;

static TRACING: Once = Once::new();

/// 初始化测试日志，RUST_LOG 控制过滤（默认静默）
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// 建一个落在临时目录里的 sqlite 存储；TempDir 必须活到测试结束
pub fn sqlite_store() -> anyhow::Result<(Arc<SqliteStore>, TempDir)> {
    init_tracing();
    let dir = TempDir::new()?;
    let manager = Arc::new(DatabaseManager::new(&dir.path().join("skipperlog.db"))?);
    Ok((Arc::new(SqliteStore::new(manager)), dir))
}

pub fn boat_record(id: &str, name: &str, synced: bool) -> EntityRecord {
    let now = Utc::now();
    EntityRecord::from_payload(
        EntityPayload::Boat(Boat {
            id: id.into(),
            name: name.into(),
            official_number: None,
            boat_type: None,
            home_port: None,
            created_at: now,
            updated_at: now,
        }),
        synced,
    )
}

pub fn trip_record(id: &str, boat_id: &str, synced: bool) -> EntityRecord {
    let now = Utc::now();
    EntityRecord::from_payload(
        EntityPayload::Trip(Trip {
            id: id.into(),
            boat_id: boat_id.into(),
            title: Some("外港试航".into()),
            start_time: now,
            end_time: now,
            distance_nm: Some(8.0),
            notes: None,
            origin_source: None,
            origin_id: None,
            created_at: now,
            updated_at: now,
        }),
        synced,
    )
}

/// 可编排行为的远端桩
#[derive(Default)]
pub struct MockRemote {
    pub fail_push: AtomicBool,
    pub fail_pull: AtomicBool,
    pub push_calls: AtomicU32,
    pub pushed: Mutex<Vec<EntityRecord>>,
    pub pull_data: Mutex<HashMap<EntityType, Vec<EntityRecord>>>,
}

impl MockRemote {
    pub fn with_pull(entity_type: EntityType, records: Vec<EntityRecord>) -> Self {
        let remote = Self::default();
        remote.pull_data.lock().unwrap().insert(entity_type, records);
        remote
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn push(&self, record: &EntityRecord) -> Result<()> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(AppError::network("网络超时"));
        }
        self.pushed.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn pull(
        &self,
        entity_type: EntityType,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EntityRecord>> {
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(AppError::network("服务器不可达"));
        }
        Ok(self
            .pull_data
            .lock()
            .unwrap()
            .get(&entity_type)
            .cloned()
            .unwrap_or_default())
    }
}
