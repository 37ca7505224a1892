//! 扫码导入会话
//!
//! 串起 解析 → 装配 → 版本门禁 → 新鲜度确认 → 台账去重确认 的完整管线。
//! "暂停等用户确认"不用回调悬挂，而是显式的等待确认状态，
//! 使整条管线保持同步、可独立于任何 UI 测试。
//!
//! 摄像头帧在背压下允许丢弃（只保留最新）：逐帧解码是幂等的，
//! 丢一帧只意味着"再扫一次"。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use super::assembler::{AssemblyResult, QrAssembler};
use super::envelope::{
    decode_complete, is_expired, parse_envelope, validate_version, DecodeOutcome,
};
use super::payload::QrPayload;
use crate::config::SyncConfig;
use crate::models::{AppError, Result};
use crate::store::ImportLedger;

/// 装配完成、尚未解码的传输
#[derive(Debug, Clone)]
struct PendingTransfer {
    data: String,
    payload_type: String,
    transfer_id: String,
    generated_at: DateTime<Utc>,
}

/// 解码完成、可供导入的传输
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTransfer {
    pub payload: QrPayload,
    pub transfer_id: String,
    pub generated_at: DateTime<Utc>,
}

enum SessionState {
    /// 正常扫描中
    Scanning,
    /// 信封超过新鲜度阈值，等用户确认是否继续
    AwaitingStaleConfirm { pending: PendingTransfer },
    /// 该传输已导入过，等用户确认是否重复导入
    AwaitingDuplicateConfirm { decoded: DecodedTransfer },
    /// 载荷就绪，等调用方取走交给导入器
    Ready { decoded: DecodedTransfer },
}

/// 单次 `offer_scan`/`confirm` 之后会话对外呈现的状态
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// 与本协议无关的二维码，忽略
    Ignored,
    /// 收下一片，还缺分片
    Progress { collected: u32, total: u32 },
    /// 软警告：信封过旧，需要用户确认
    AwaitingStaleConfirm { generated_at: DateTime<Utc> },
    /// 软警告：传输已导入过，需要用户确认
    AwaitingDuplicateConfirm { first_imported_at: DateTime<Utc> },
    /// 载荷就绪，可通过 [`ImportSession::take_ready`] 取走
    Ready,
    /// 用户拒绝确认，会话回到扫描状态
    Cancelled,
    /// 协议失败（版本/分片数/解码），状态已重置，提示重扫或重新生成
    Rejected { message: String },
}

/// 扫码导入会话（单个扫描会话驱动，非线程安全）
pub struct ImportSession {
    ledger: Arc<dyn ImportLedger>,
    assembler: QrAssembler,
    state: SessionState,
    /// 新鲜度阈值（小时），来自 `SyncConfig`
    max_age_hours: i64,
}

impl ImportSession {
    pub fn new(ledger: Arc<dyn ImportLedger>, config: &SyncConfig) -> Self {
        Self {
            ledger,
            assembler: QrAssembler::new(),
            state: SessionState::Scanning,
            max_age_hours: i64::from(config.envelope_max_age_hours),
        }
    }

    /// 喂入一帧摄像头解码文本
    ///
    /// 等待确认期间管线暂停：新帧直接忽略并重报当前等待状态。
    pub fn offer_scan(&mut self, raw: &str) -> Result<ScanOutcome> {
        match &self.state {
            SessionState::AwaitingStaleConfirm { pending } => {
                return Ok(ScanOutcome::AwaitingStaleConfirm {
                    generated_at: pending.generated_at,
                });
            }
            SessionState::AwaitingDuplicateConfirm { decoded } => {
                let first = self
                    .ledger
                    .get_by_transfer_id(&decoded.transfer_id)?
                    .map(|r| r.imported_at)
                    .unwrap_or(decoded.generated_at);
                return Ok(ScanOutcome::AwaitingDuplicateConfirm {
                    first_imported_at: first,
                });
            }
            SessionState::Ready { .. } => return Ok(ScanOutcome::Ready),
            SessionState::Scanning => {}
        }

        let Some(envelope) = parse_envelope(raw) else {
            return Ok(ScanOutcome::Ignored);
        };

        // 版本门禁：失败关闭，绝不跨版本解析
        if let Some(err) = validate_version(envelope.protocol_version).as_error() {
            warn!(
                "[ImportSession] 拒绝协议版本 {} 的信封: {}",
                envelope.protocol_version, err
            );
            self.assembler.reset();
            return Ok(ScanOutcome::Rejected {
                message: err.to_string(),
            });
        }

        match self.assembler.add_part(&envelope) {
            AssemblyResult::NeedMore { collected, total } => {
                Ok(ScanOutcome::Progress { collected, total })
            }
            AssemblyResult::Error { message } => Ok(ScanOutcome::Rejected { message }),
            AssemblyResult::Complete {
                data,
                payload_type,
                transfer_id,
                generated_at,
                protocol_version: _,
            } => {
                let pending = PendingTransfer {
                    data,
                    payload_type,
                    transfer_id,
                    generated_at,
                };
                if is_expired(pending.generated_at, self.max_age_hours) {
                    info!(
                        "[ImportSession] 传输 {} 超过新鲜度阈值，等待用户确认",
                        pending.transfer_id
                    );
                    let generated_at = pending.generated_at;
                    self.state = SessionState::AwaitingStaleConfirm { pending };
                    return Ok(ScanOutcome::AwaitingStaleConfirm { generated_at });
                }
                self.decode_and_check(pending)
            }
        }
    }

    /// 响应等待中的确认
    ///
    /// `accept = false` 时放弃当前传输，回到扫描状态。
    /// 没有待确认操作时报参数错误。
    pub fn confirm(&mut self, accept: bool) -> Result<ScanOutcome> {
        match std::mem::replace(&mut self.state, SessionState::Scanning) {
            SessionState::AwaitingStaleConfirm { pending } => {
                if accept {
                    self.decode_and_check(pending)
                } else {
                    info!("[ImportSession] 用户放弃过期传输 {}", pending.transfer_id);
                    Ok(ScanOutcome::Cancelled)
                }
            }
            SessionState::AwaitingDuplicateConfirm { decoded } => {
                if accept {
                    self.state = SessionState::Ready { decoded };
                    Ok(ScanOutcome::Ready)
                } else {
                    info!(
                        "[ImportSession] 用户放弃重复导入传输 {}",
                        decoded.transfer_id
                    );
                    Ok(ScanOutcome::Cancelled)
                }
            }
            other => {
                self.state = other;
                Err(AppError::validation("当前没有待确认的操作"))
            }
        }
    }

    /// 取走就绪载荷并回到扫描状态；未就绪时返回 None
    pub fn take_ready(&mut self) -> Option<DecodedTransfer> {
        match std::mem::replace(&mut self.state, SessionState::Scanning) {
            SessionState::Ready { decoded } => Some(decoded),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// 放弃一切进行中的状态，回到空闲扫描
    pub fn reset(&mut self) {
        self.assembler.reset();
        self.state = SessionState::Scanning;
    }

    fn decode_and_check(&mut self, pending: PendingTransfer) -> Result<ScanOutcome> {
        match decode_complete(
            &pending.data,
            &pending.payload_type,
            &pending.transfer_id,
            pending.generated_at,
        ) {
            DecodeOutcome::InvalidFormat { message } => {
                warn!(
                    "[ImportSession] 传输 {} 解码失败: {}",
                    pending.transfer_id, message
                );
                // 装配器已回到 Idle，提示用户重新扫描
                self.state = SessionState::Scanning;
                Ok(ScanOutcome::Rejected { message })
            }
            DecodeOutcome::Success {
                payload,
                transfer_id,
                generated_at,
            } => {
                let decoded = DecodedTransfer {
                    payload,
                    transfer_id,
                    generated_at,
                };
                if let Some(prior) = self.ledger.get_by_transfer_id(&decoded.transfer_id)? {
                    info!(
                        "[ImportSession] 传输 {} 已于 {} 导入过，等待用户确认",
                        decoded.transfer_id, prior.imported_at
                    );
                    self.state = SessionState::AwaitingDuplicateConfirm { decoded };
                    return Ok(ScanOutcome::AwaitingDuplicateConfirm {
                        first_imported_at: prior.imported_at,
                    });
                }
                self.state = SessionState::Ready { decoded };
                Ok(ScanOutcome::Ready)
            }
        }
    }
}
