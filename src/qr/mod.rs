//! 二维码离线传输协议
//!
//! 让一台设备仅凭连续扫码就把结构化数据（船只档案、一批航程）
//! 交给另一台设备，没有应答通道：
//! - [`envelope`]：单码信封的编解码与版本/新鲜度校验
//! - [`assembler`]：多分片重组状态机
//! - [`payload`]：传输载荷类型
//! - [`session`]：扫描 → 确认 → 导入 的会话管线

pub mod assembler;
pub mod envelope;
pub mod payload;
pub mod session;

pub use assembler::{AssemblyResult, QrAssembler};
pub use envelope::{
    decode_complete, encode_payload, is_expired, parse_envelope, validate_version, DecodeOutcome,
    ProtocolError, QrEnvelope, VersionCheck, ENVELOPE_MAX_AGE_HOURS, MAX_CHUNK_LEN,
    MIN_SUPPORTED_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
pub use payload::{
    BoatProfilePayload, BoatTransfer, QrPayload, TripBatchPayload, TripTransfer,
    PAYLOAD_TYPE_BOAT_PROFILE, PAYLOAD_TYPE_TRIP_BATCH,
};
pub use session::{DecodedTransfer, ImportSession, ScanOutcome};
