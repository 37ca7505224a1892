//! 同步与传输配置
//!
//! 可由产品层调整的软参数。协议版本窗口与推送重试上限属于硬契约，
//! 定义为常量（见 `qr::envelope` 与 `sync::change_log`），不进入配置。

use serde::{Deserialize, Serialize};

use crate::qr::envelope::{ENVELOPE_MAX_AGE_HOURS, MAX_CHUNK_LEN};

/// 同步核心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// 已同步变更记录的保留天数，超期在同步成功后清理
    #[serde(default = "default_mutation_retention_days")]
    pub mutation_retention_days: u32,
    /// 二维码新鲜度阈值（小时），超期仅软提醒，不拒收
    #[serde(default = "default_envelope_max_age_hours")]
    pub envelope_max_age_hours: u32,
    /// 单个二维码载荷分片的最大 base64 长度（受单码容量限制）
    #[serde(default = "default_max_chunk_len")]
    pub max_chunk_len: usize,
}

fn default_mutation_retention_days() -> u32 {
    7
}

fn default_envelope_max_age_hours() -> u32 {
    ENVELOPE_MAX_AGE_HOURS as u32
}

fn default_max_chunk_len() -> usize {
    MAX_CHUNK_LEN
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mutation_retention_days: default_mutation_retention_days(),
            envelope_max_age_hours: default_envelope_max_age_hours(),
            max_chunk_len: default_max_chunk_len(),
        }
    }
}

impl SyncConfig {
    /// 校验配置合法性
    pub fn validate(&self) -> Result<(), String> {
        if self.mutation_retention_days == 0 {
            return Err("变更记录保留天数必须大于 0".to_string());
        }
        if self.envelope_max_age_hours == 0 {
            return Err("二维码新鲜度阈值必须大于 0".to_string());
        }
        if self.max_chunk_len < 64 {
            return Err("二维码分片长度过小，无法携带有效载荷".to_string());
        }
        Ok(())
    }
}
