//! 二维码信封编解码
//!
//! 单个二维码的解码文本就是一个完整的 JSON 信封（camelCase 键），
//! 携带协议元数据与一段 base64 载荷分片。传输无应答通道，
//! 可靠性完全来自用户补扫与装配器按下标幂等覆盖。

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::payload::QrPayload;
use crate::models::{AppError, Result};

/// 当前协议版本
pub const PROTOCOL_VERSION: i64 = 2;
/// 仍受支持的最低协议版本（v1 已退役）
pub const MIN_SUPPORTED_PROTOCOL_VERSION: i64 = 2;
/// 信封新鲜度阈值的默认值（小时）。超期仅软提醒，用户确认后仍可继续。
/// 产品层可经 `SyncConfig::envelope_max_age_hours` 调整
pub const ENVELOPE_MAX_AGE_HOURS: i64 = 24;
/// 单个信封载荷分片最大 base64 长度的默认值（单码容量限制）。
/// 产品层可经 `SyncConfig::max_chunk_len` 调整
pub const MAX_CHUNK_LEN: usize = 800;

/// 协议硬错误（必须失败关闭，绝不部分生效）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("二维码协议版本过旧，请在发送设备上重新生成二维码")]
    VersionTooOld,
    #[error("当前应用版本过低，无法读取该二维码，请先更新应用")]
    VersionTooNew,
    #[error("分片总数不一致: 进行中为 {expected}，收到 {got}")]
    PartCountMismatch { expected: u32, got: u32 },
}

/// 单个二维码携带的信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrEnvelope {
    pub protocol_version: i64,
    /// 同一逻辑传输的全部信封共享此 ID
    pub transfer_id: String,
    /// 载荷类型判别符（见 `payload` 模块）
    pub payload_type: String,
    /// 分片下标（1 起）
    pub part_index: u32,
    pub part_count: u32,
    pub generated_at: DateTime<Utc>,
    /// base64 载荷分片
    pub payload_chunk: String,
}

/// 版本校验结果（对全体整数完备划分，三者互斥）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    Ok,
    TooOld,
    TooNew,
}

impl VersionCheck {
    /// 失败时对应的协议错误（携带给用户的指引文案）
    pub fn as_error(&self) -> Option<ProtocolError> {
        match self {
            VersionCheck::Ok => None,
            VersionCheck::TooOld => Some(ProtocolError::VersionTooOld),
            VersionCheck::TooNew => Some(ProtocolError::VersionTooNew),
        }
    }
}

/// 完整载荷的解码结果
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    Success {
        payload: QrPayload,
        transfer_id: String,
        generated_at: DateTime<Utc>,
    },
    /// 结构性失败（坏 base64 / schema 不匹配），携带人类可读原因
    InvalidFormat { message: String },
}

/// 解析单个扫描文本
///
/// 镜头里出现的可能是任何二维码，与本协议无关的文本一律返回 `None`
/// 而不是错误。结构合法但字段越界（下标为 0、超过总数）同样视为无关。
pub fn parse_envelope(raw: &str) -> Option<QrEnvelope> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let envelope: QrEnvelope = serde_json::from_str(trimmed).ok()?;
    if envelope.transfer_id.is_empty() || envelope.payload_type.is_empty() {
        return None;
    }
    if envelope.part_index == 0
        || envelope.part_count == 0
        || envelope.part_index > envelope.part_count
    {
        return None;
    }
    Some(envelope)
}

/// 校验协议版本
///
/// 对任意整数完备：小于最低支持版本为 TooOld，
/// 大于当前版本为 TooNew，其余为 Ok。版本不匹配时绝不尝试跨版本解析。
pub fn validate_version(version: i64) -> VersionCheck {
    if version < MIN_SUPPORTED_PROTOCOL_VERSION {
        VersionCheck::TooOld
    } else if version > PROTOCOL_VERSION {
        VersionCheck::TooNew
    } else {
        VersionCheck::Ok
    }
}

/// 信封是否超过新鲜度阈值（相对于 `now`）
pub fn is_expired_at(generated_at: DateTime<Utc>, now: DateTime<Utc>, max_age_hours: i64) -> bool {
    now - generated_at > Duration::hours(max_age_hours)
}

/// 信封是否超过新鲜度阈值（相对于当前时间）
pub fn is_expired(generated_at: DateTime<Utc>, max_age_hours: i64) -> bool {
    is_expired_at(generated_at, Utc::now(), max_age_hours)
}

/// 解码重组完成的完整载荷
///
/// 任何失败（坏 base64、非 UTF-8、schema 不匹配、未知判别符）
/// 都以 `InvalidFormat` 返回人类可读原因，绝不 panic。
pub fn decode_complete(
    full_base64: &str,
    payload_type: &str,
    transfer_id: &str,
    generated_at: DateTime<Utc>,
) -> DecodeOutcome {
    let bytes = match BASE64.decode(full_base64) {
        Ok(bytes) => bytes,
        Err(e) => {
            return DecodeOutcome::InvalidFormat {
                message: format!("base64 解码失败: {}", e),
            }
        }
    };
    let json = match String::from_utf8(bytes) {
        Ok(json) => json,
        Err(e) => {
            return DecodeOutcome::InvalidFormat {
                message: format!("载荷不是合法 UTF-8: {}", e),
            }
        }
    };
    match QrPayload::from_json(payload_type, &json) {
        Ok(payload) => DecodeOutcome::Success {
            payload,
            transfer_id: transfer_id.to_string(),
            generated_at,
        },
        Err(e) => DecodeOutcome::InvalidFormat {
            message: format!("载荷结构不合法: {}", e),
        },
    }
}

/// 编码侧：把载荷拆成一组信封文本（发送设备逐个渲染成二维码）
///
/// `max_chunk_len` 来自 `SyncConfig`（默认 [`MAX_CHUNK_LEN`]），
/// 须先经 `SyncConfig::validate` 校验下限。
pub fn encode_payload(
    payload: &QrPayload,
    transfer_id: &str,
    generated_at: DateTime<Utc>,
    max_chunk_len: usize,
) -> Result<Vec<String>> {
    if max_chunk_len == 0 {
        return Err(AppError::validation("二维码分片长度必须大于 0"));
    }
    let json = payload.to_json()?;
    let full_base64 = BASE64.encode(json.as_bytes());

    // base64 是纯 ASCII，可以按字节数安全切分
    let chunks: Vec<&str> = full_base64
        .as_bytes()
        .chunks(max_chunk_len)
        .map(|chunk| std::str::from_utf8(chunk).expect("base64 输出必为 ASCII"))
        .collect();
    let part_count = chunks.len() as u32;

    let mut envelopes = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        let envelope = QrEnvelope {
            protocol_version: PROTOCOL_VERSION,
            transfer_id: transfer_id.to_string(),
            payload_type: payload.payload_type().to_string(),
            part_index: (i + 1) as u32,
            part_count,
            generated_at,
            payload_chunk: (*chunk).to_string(),
        };
        envelopes.push(serde_json::to_string(&envelope)?);
    }
    Ok(envelopes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qr::payload::{BoatProfilePayload, BoatTransfer};

    fn sample_payload() -> QrPayload {
        QrPayload::BoatProfile(BoatProfilePayload {
            boat: BoatTransfer {
                name: "海燕号".into(),
                official_number: Some("CN-12345".into()),
                boat_type: Some("帆船".into()),
                home_port: None,
            },
        })
    }

    #[test]
    fn unrelated_text_parses_to_none() {
        assert!(parse_envelope("https://example.com/menu").is_none());
        assert!(parse_envelope("WIFI:T:WPA;S:marina;;").is_none());
        assert!(parse_envelope("{\"foo\": 1}").is_none());
        assert!(parse_envelope("").is_none());
    }

    #[test]
    fn out_of_range_indices_parse_to_none() -> anyhow::Result<()> {
        let envelopes = encode_payload(&sample_payload(), "t-1", Utc::now(), MAX_CHUNK_LEN)?;
        let mut env: QrEnvelope = serde_json::from_str(&envelopes[0])?;
        env.part_index = 0;
        assert!(parse_envelope(&serde_json::to_string(&env)?).is_none());
        env.part_index = env.part_count + 1;
        assert!(parse_envelope(&serde_json::to_string(&env)?).is_none());
        Ok(())
    }

    #[test]
    fn version_check_partitions_all_integers() {
        // 三个分段互斥且完备
        for v in (MIN_SUPPORTED_PROTOCOL_VERSION - 3)..=(PROTOCOL_VERSION + 3) {
            let check = validate_version(v);
            let expected = if v < MIN_SUPPORTED_PROTOCOL_VERSION {
                VersionCheck::TooOld
            } else if v > PROTOCOL_VERSION {
                VersionCheck::TooNew
            } else {
                VersionCheck::Ok
            };
            assert_eq!(check, expected, "version {}", v);
        }
        assert_eq!(validate_version(i64::MIN), VersionCheck::TooOld);
        assert_eq!(validate_version(i64::MAX), VersionCheck::TooNew);
        assert!(validate_version(PROTOCOL_VERSION).as_error().is_none());
    }

    #[test]
    fn staleness_is_strictly_beyond_threshold() {
        let now = Utc::now();
        let at_threshold = now - Duration::hours(ENVELOPE_MAX_AGE_HOURS);
        assert!(!is_expired_at(at_threshold, now, ENVELOPE_MAX_AGE_HOURS));
        assert!(is_expired_at(
            at_threshold - Duration::seconds(1),
            now,
            ENVELOPE_MAX_AGE_HOURS
        ));
        // 阈值可调：1 小时阈值下，2 小时前的信封已过期
        assert!(is_expired_at(now - Duration::hours(2), now, 1));
        assert!(!is_expired_at(now - Duration::hours(2), now, 3));
    }

    #[test]
    fn encode_then_decode_round_trips() -> anyhow::Result<()> {
        let payload = sample_payload();
        let generated_at = Utc::now();
        let envelopes = encode_payload(&payload, "t-42", generated_at, MAX_CHUNK_LEN)?;
        assert!(!envelopes.is_empty());

        let parsed: Vec<QrEnvelope> = envelopes
            .iter()
            .map(|raw| parse_envelope(raw).expect("自家信封必须能解析"))
            .collect();
        let full: String = parsed.iter().map(|e| e.payload_chunk.as_str()).collect();

        match decode_complete(&full, &parsed[0].payload_type, "t-42", generated_at) {
            DecodeOutcome::Success {
                payload: decoded, ..
            } => assert_eq!(decoded, payload),
            DecodeOutcome::InvalidFormat { message } => panic!("解码失败: {}", message),
        }
        Ok(())
    }

    #[test]
    fn bad_base64_yields_invalid_format() {
        let outcome = decode_complete("!!!not-base64!!!", "boat_profile", "t-1", Utc::now());
        match outcome {
            DecodeOutcome::InvalidFormat { message } => {
                assert!(message.contains("base64"));
            }
            DecodeOutcome::Success { .. } => panic!("坏 base64 不应解码成功"),
        }
    }

    #[test]
    fn schema_mismatch_yields_invalid_format() {
        let garbage = BASE64.encode(b"{\"unexpected\": true}");
        match decode_complete(&garbage, "trip_batch", "t-1", Utc::now()) {
            DecodeOutcome::InvalidFormat { message } => {
                assert!(!message.is_empty());
            }
            DecodeOutcome::Success { .. } => panic!("schema 不匹配不应解码成功"),
        }
    }

    #[test]
    fn large_payload_splits_into_multiple_parts() -> anyhow::Result<()> {
        use crate::qr::payload::{TripBatchPayload, TripTransfer};
        let trips: Vec<TripTransfer> = (0..40)
            .map(|i| TripTransfer {
                origin_id: format!("origin-{}", i),
                title: Some(format!("第 {} 段航程，沿海岸线巡航", i)),
                start_time: Utc::now(),
                end_time: Utc::now(),
                distance_nm: Some(i as f64),
                notes: Some("风力 4 级，浪高 0.5 米".into()),
            })
            .collect();
        let payload = QrPayload::TripBatch(TripBatchPayload {
            boat_name: "海燕号".into(),
            official_number: None,
            trips,
        });
        let envelopes = encode_payload(&payload, "t-big", Utc::now(), MAX_CHUNK_LEN)?;
        assert!(envelopes.len() > 1);
        for raw in &envelopes {
            let env = parse_envelope(raw).expect("分片信封应可解析");
            assert!(env.payload_chunk.len() <= MAX_CHUNK_LEN);
            assert_eq!(env.part_count, envelopes.len() as u32);
        }
        Ok(())
    }

    #[test]
    fn chunk_len_controls_part_count() -> anyhow::Result<()> {
        let payload = sample_payload();
        let generated_at = Utc::now();
        let single = encode_payload(&payload, "t-cfg", generated_at, MAX_CHUNK_LEN)?;
        assert_eq!(single.len(), 1);

        // 同一载荷在更小的分片长度下拆成更多片，重组结果不变
        let small = encode_payload(&payload, "t-cfg", generated_at, 64)?;
        assert!(small.len() > single.len());
        let parsed: Vec<QrEnvelope> = small
            .iter()
            .map(|raw| parse_envelope(raw).expect("自家信封必须能解析"))
            .collect();
        for env in &parsed {
            assert!(env.payload_chunk.len() <= 64);
        }
        let full: String = parsed.iter().map(|e| e.payload_chunk.as_str()).collect();
        match decode_complete(&full, &parsed[0].payload_type, "t-cfg", generated_at) {
            DecodeOutcome::Success {
                payload: decoded, ..
            } => assert_eq!(decoded, payload),
            DecodeOutcome::InvalidFormat { message } => panic!("解码失败: {}", message),
        }

        assert!(encode_payload(&payload, "t-cfg", generated_at, 0).is_err());
        Ok(())
    }
}
