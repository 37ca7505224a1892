//! 推送重试调度
//!
//! 两层重试：
//! 1. 单次同步内的瞬时抖动用 backon 指数退避吸收，整组退避只算一次尝试；
//! 2. 整组退避仍失败才消耗一次 attempts，由 [`RetryScheduler`] 记账。
//!
//! attempts 达到上限的记录进入失败桶，之后绝不自动重试，
//! 只有用户在界面上手动触发 [`RetryScheduler::retry_failed`] 才会清零。

use backon::ExponentialBuilder;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::models::Result;
use crate::store::Store;
use crate::sync::change_log::MAX_PUSH_ATTEMPTS;

/// 单次推送内吸收瞬时网络抖动的退避策略
///
/// 最多额外重试 2 次，整组算作一次尝试。
pub fn transient_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(2)
}

/// 失败记账与手动重试入口
pub struct RetryScheduler {
    store: Arc<dyn Store>,
}

impl RetryScheduler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// 登记一次推送失败，返回累计尝试次数
    pub fn record_push_failure(&self, mutation_id: &str, error: &str) -> Result<u32> {
        let attempts = self.store.record_failure(mutation_id, error, Utc::now())?;
        if attempts >= MAX_PUSH_ATTEMPTS {
            warn!(
                "[RetryScheduler] 变更 {} 连续失败 {} 次，移入失败桶等待手动重试: {}",
                mutation_id, attempts, error
            );
        } else {
            info!(
                "[RetryScheduler] 变更 {} 推送失败（第 {}/{} 次）: {}",
                mutation_id, attempts, MAX_PUSH_ATTEMPTS, error
            );
        }
        Ok(attempts)
    }

    /// 用户手动重试：把失败桶中的记录放回 pending 队列
    ///
    /// `ids` 为 None 时重试全部失败记录，返回实际重置条数。
    pub fn retry_failed(&self, ids: Option<&[String]>) -> Result<u64> {
        let reset = self.store.reset_failed(ids)?;
        if reset > 0 {
            info!("[RetryScheduler] 手动重试 {} 条失败变更", reset);
        }
        Ok(reset)
    }

    /// 当前失败桶大小
    pub fn failed_count(&self) -> Result<u64> {
        self.store.failed_count()
    }
}
