//! 导入台账
//!
//! 记录每个已完成导入的传输 ID。台账是永久性的：
//! 一旦写入绝不静默覆盖，重复导入必须经用户显式确认。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 一次已完成的二维码传输导入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRecord {
    pub transfer_id: String,
    /// 首次导入时间（重复登记时保持不变）
    pub imported_at: DateTime<Utc>,
}
