//! 多分片装配器
//!
//! 状态机：Idle → Collecting → {Complete, Error} → Idle。
//! 同一时刻最多持有一个传输；最新扫到的传输无条件胜出，
//! 不同传输之间绝不合并。按合同非线程安全，由单个扫描会话驱动。

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::envelope::{ProtocolError, QrEnvelope};

/// 装配中的传输状态（仅内存，不落库）
#[derive(Debug, Clone)]
struct AssemblyState {
    transfer_id: String,
    payload_type: String,
    part_count: u32,
    generated_at: DateTime<Utc>,
    protocol_version: i64,
    /// 分片下标 → 分片内容；BTreeMap 保证按下标升序拼接
    received_parts: BTreeMap<u32, String>,
}

/// `add_part` 的结果（消费端穷尽匹配）
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblyResult {
    /// 还缺分片：已收 / 总数
    NeedMore { collected: u32, total: u32 },
    /// 全部分片就位，携带按下标升序拼接的完整 base64
    Complete {
        data: String,
        payload_type: String,
        transfer_id: String,
        generated_at: DateTime<Utc>,
        protocol_version: i64,
    },
    /// 协议不一致，状态已重置
    Error { message: String },
}

/// 多分片装配器
#[derive(Debug, Default)]
pub struct QrAssembler {
    state: Option<AssemblyState>,
}

impl QrAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前是否有装配中的传输
    pub fn is_collecting(&self) -> bool {
        self.state.is_some()
    }

    /// 进行中传输的 (已收, 总数)，Idle 时为 None
    pub fn progress(&self) -> Option<(u32, u32)> {
        self.state
            .as_ref()
            .map(|s| (s.received_parts.len() as u32, s.part_count))
    }

    /// 喂入一个解析好的信封
    pub fn add_part(&mut self, envelope: &QrEnvelope) -> AssemblyResult {
        // Idle，或扫到了别的传输：丢弃旧状态，以这一片为种子重新开始
        let needs_new_state = self
            .state
            .as_ref()
            .map_or(true, |s| s.transfer_id != envelope.transfer_id);
        if needs_new_state {
            if let Some(old) = self.state.take() {
                info!(
                    "[QrAssembler] 放弃未完成的传输 {}（已收 {}/{}），切换到 {}",
                    old.transfer_id,
                    old.received_parts.len(),
                    old.part_count,
                    envelope.transfer_id
                );
            }
            self.state = Some(AssemblyState {
                transfer_id: envelope.transfer_id.clone(),
                payload_type: envelope.payload_type.clone(),
                part_count: envelope.part_count,
                generated_at: envelope.generated_at,
                protocol_version: envelope.protocol_version,
                received_parts: BTreeMap::new(),
            });
        }
        let state = self.state.as_mut().expect("装配状态在上方已初始化");

        // 同一传输内分片总数必须一致
        if envelope.part_count != state.part_count {
            let err = ProtocolError::PartCountMismatch {
                expected: state.part_count,
                got: envelope.part_count,
            };
            warn!("[QrAssembler] {}", err);
            self.state = None;
            return AssemblyResult::Error {
                message: err.to_string(),
            };
        }

        // 重扫同一片是幂等覆盖
        state
            .received_parts
            .insert(envelope.part_index, envelope.payload_chunk.clone());
        debug!(
            "[QrAssembler] 传输 {} 收到分片 {}/{}",
            state.transfer_id,
            state.received_parts.len(),
            state.part_count
        );

        if (state.received_parts.len() as u32) < state.part_count {
            return AssemblyResult::NeedMore {
                collected: state.received_parts.len() as u32,
                total: state.part_count,
            };
        }

        // 第 N 个不同下标到齐：按下标升序拼接并回到 Idle
        let state = self
            .state
            .take()
            .expect("完成分支必然持有装配状态");
        let data: String = state.received_parts.values().map(String::as_str).collect();
        info!(
            "[QrAssembler] 传输 {} 装配完成（{} 片）",
            state.transfer_id, state.part_count
        );
        AssemblyResult::Complete {
            data,
            payload_type: state.payload_type,
            transfer_id: state.transfer_id,
            generated_at: state.generated_at,
            protocol_version: state.protocol_version,
        }
    }

    /// 强制回到 Idle，丢弃部分状态（出错、用户取消或成功消费后调用）
    pub fn reset(&mut self) {
        if let Some(state) = self.state.take() {
            debug!(
                "[QrAssembler] 重置，丢弃传输 {}（已收 {}/{}）",
                state.transfer_id,
                state.received_parts.len(),
                state.part_count
            );
        }
    }
}
