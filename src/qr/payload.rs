//! 二维码传输载荷
//!
//! 载荷按 `payloadType` 判别符选择结构：船只档案（`boat_profile`）
//! 或航程批次（`trip_batch`）。传输 DTO 携带来源设备上的原始 ID，
//! 落库时一律生成本机新 ID 并记录来源。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AppError, Result};

/// 船只档案载荷的判别符
pub const PAYLOAD_TYPE_BOAT_PROFILE: &str = "boat_profile";
/// 航程批次载荷的判别符
pub const PAYLOAD_TYPE_TRIP_BATCH: &str = "trip_batch";

/// 船只档案（发送方视角的快照）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoatTransfer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub official_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boat_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_port: Option<String>,
}

/// 单条航程（发送方视角的快照）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripTransfer {
    /// 发送设备上的实体 ID，导入后作为 origin_id 保存
    pub origin_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_nm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// 船只档案载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoatProfilePayload {
    pub boat: BoatTransfer,
}

/// 航程批次载荷
///
/// 附带船名/注册编号，便于接收方把批次对应到本机船只。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripBatchPayload {
    pub boat_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub official_number: Option<String>,
    pub trips: Vec<TripTransfer>,
}

/// 解码后的传输载荷（带标签联合，消费端穷尽匹配）
#[derive(Debug, Clone, PartialEq)]
pub enum QrPayload {
    BoatProfile(BoatProfilePayload),
    TripBatch(TripBatchPayload),
}

impl QrPayload {
    /// 该载荷的判别符字符串
    pub fn payload_type(&self) -> &'static str {
        match self {
            QrPayload::BoatProfile(_) => PAYLOAD_TYPE_BOAT_PROFILE,
            QrPayload::TripBatch(_) => PAYLOAD_TYPE_TRIP_BATCH,
        }
    }

    /// 序列化为 JSON（编码侧）
    pub fn to_json(&self) -> Result<String> {
        match self {
            QrPayload::BoatProfile(p) => Ok(serde_json::to_string(p)?),
            QrPayload::TripBatch(p) => Ok(serde_json::to_string(p)?),
        }
    }

    /// 按判别符解析 JSON（解码侧），未知判别符视为协议错误
    pub fn from_json(payload_type: &str, json: &str) -> Result<QrPayload> {
        match payload_type {
            PAYLOAD_TYPE_BOAT_PROFILE => Ok(QrPayload::BoatProfile(serde_json::from_str(json)?)),
            PAYLOAD_TYPE_TRIP_BATCH => Ok(QrPayload::TripBatch(serde_json::from_str(json)?)),
            other => Err(AppError::protocol(format!(
                "未知的载荷类型: {}",
                other
            ))),
        }
    }
}
