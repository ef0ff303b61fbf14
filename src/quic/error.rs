//! QUIC Initial 检查错误类型
use thiserror::Error;

/// 解码 QUIC Initial 包时的错误
///
/// 这些错误不会返回给过滤器调用方: 检查流程会把它们
/// 映射为 `ExtractionOutcome::NotInitial` 或 `ExtractionOutcome::GiveUp`。
#[derive(Error, Debug)]
pub enum QuicError {
    /// 数据包太短，放不下下一个字段
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    /// 不是 Long Header 的 Initial 包
    #[error("Not a QUIC Initial packet (first byte: {0:#04x})")]
    NotInitialPacket(u8),

    /// Connection ID 超过 QUIC v1/v2 允许的 20 字节
    #[error("Invalid connection ID length: {0}")]
    InvalidConnectionId(usize),

    /// 密钥派生失败
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// 头部保护解除失败
    #[error("Header protection removal failed: {0}")]
    HeaderProtectionFailed(String),

    /// AEAD 解密失败
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Packet Number 解码失败
    #[error("Packet number decoding failed: {0}")]
    PacketNumberError(String),

    /// 解密后的 payload 中有格式错误的帧
    #[error("Frame parsing failed: {0}")]
    FrameError(String),

    /// 变长整数格式错误
    #[error("VarInt decoding failed: {0}")]
    VarIntError(String),

    /// 没有公开 Initial salt 的版本
    #[error("Unsupported QUIC version: {:#010x}", version)]
    UnsupportedVersion { version: u32 },
}

impl QuicError {
    /// datagram 是否只是不属于检查范围
    /// (而不是解码失败的 Initial 包)
    pub fn is_not_initial(&self) -> bool {
        matches!(
            self,
            QuicError::NotInitialPacket(_) | QuicError::UnsupportedVersion { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, QuicError>;
