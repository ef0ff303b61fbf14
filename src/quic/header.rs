//! QUIC 头部保护解除与 Packet Number 解码
//!
//! 参考 RFC 9001 Section 5.4 (Header Protection) 和 RFC 9000 Section 17.1 /
//! Appendix A.3 (Packet Number Decoding)

use crate::quic::crypto::InitialKeys;
use crate::quic::error::{QuicError, Result};
use crate::quic::parser::InitialHeader;
use ring::aead::quic::{HeaderProtectionKey, AES_128};
use tracing::trace;

/// AES 头部保护的采样长度
pub const SAMPLE_LEN: usize = 16;

/// 采样从 Packet Number 字段起始处后 4 字节开始，
/// 相当于假定 Packet Number 总是 4 字节
const SAMPLE_OFFSET: usize = 4;

/// 解除保护后的头部
#[derive(Debug, Clone)]
pub struct UnprotectedHeader {
    /// 解除掩码后、直到 Packet Number (含) 的头部字节，
    /// 即 AEAD 的附加数据
    pub aad: Vec<u8>,
    /// 完整的 Packet Number
    pub packet_number: u64,
    /// 编码后的 Packet Number 长度 (1-4)
    pub pn_len: usize,
}

/// 计算 5 字节的头部保护掩码: AES-128-ECB(hp_key, sample)
pub fn header_protection_mask(hp_key: &[u8], sample: &[u8]) -> Result<[u8; 5]> {
    let key = HeaderProtectionKey::new(&AES_128, hp_key).map_err(|e| {
        QuicError::HeaderProtectionFailed(format!("Failed to create HP key: {:?}", e))
    })?;
    key.new_mask(sample)
        .map_err(|e| QuicError::HeaderProtectionFailed(format!("Failed to generate mask: {:?}", e)))
}

/// 解除 `header` 所描述的 Initial 包的头部保护
///
/// 不修改 datagram 本身: 过滤器要把原始字节交回调用方，
/// 所以解除掩码的头部以副本返回。
pub fn remove_header_protection(
    packet: &[u8],
    header: &InitialHeader,
    keys: &InitialKeys,
) -> Result<UnprotectedHeader> {
    let pn_offset = header.pn_offset;
    let sample_start = pn_offset + SAMPLE_OFFSET;
    let sample_end = sample_start + SAMPLE_LEN;

    // 采样必须位于当前包内，不能落到合并的下一个包
    if header.packet_end() < sample_end || packet.len() < sample_end {
        return Err(QuicError::PacketTooShort {
            expected: sample_end,
            actual: header.packet_end().min(packet.len()),
        });
    }

    let mask = header_protection_mask(&keys.hp_key, &packet[sample_start..sample_end])?;

    // Long Header 只保护首字节的低 4 位
    let first_byte = header.first_byte ^ (mask[0] & 0x0f);

    // 解除保护后保留位 (0x0c) 必须为 0
    if first_byte & 0x0c != 0 {
        return Err(QuicError::HeaderProtectionFailed(format!(
            "reserved bits set after unprotection (first byte {:#04x})",
            first_byte
        )));
    }

    let pn_len = ((first_byte & 0x03) + 1) as usize;

    let mut aad = packet[..pn_offset + pn_len].to_vec();
    aad[0] = first_byte;
    for i in 0..pn_len {
        aad[pn_offset + i] ^= mask[1 + i];
    }

    let packet_number = decode_packet_number(&aad[pn_offset..], None)?;

    trace!(
        "Header protection removed: first_byte={:#04x}, pn={}, pn_len={}",
        first_byte,
        packet_number,
        pn_len
    );

    Ok(UnprotectedHeader {
        aad,
        packet_number,
        pn_len,
    })
}

/// 解码截断的 Packet Number (RFC 9000 Appendix A.3)
///
/// `largest_pn` 是该 packet number space 中已处理的最大编号；
/// 尚未收到任何包时为 `None`，
/// 过滤器解码的 Initial 包都属于这种情况。
pub fn decode_packet_number(truncated_pn: &[u8], largest_pn: Option<u64>) -> Result<u64> {
    let pn_len = truncated_pn.len();
    if pn_len == 0 || pn_len > 4 {
        return Err(QuicError::PacketNumberError(format!(
            "invalid packet number length: {}",
            pn_len
        )));
    }

    let truncated = truncated_pn
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64);

    let expected = largest_pn.map(|pn| pn + 1).unwrap_or(0);
    let pn_win = 1u64 << (8 * pn_len);
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let candidate = (expected & !pn_mask) | truncated;

    let decoded = if candidate + pn_hwin <= expected && candidate < (1u64 << 62) - pn_win {
        candidate + pn_win
    } else if candidate > expected + pn_hwin && candidate >= pn_win {
        candidate - pn_win
    } else {
        candidate
    };

    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::crypto::{derive_initial_keys, QuicVersion};
    use bytes::Bytes;

    #[test]
    fn test_rfc9001_header_protection_mask() {
        // RFC 9001 Appendix A.2
        let hp = hex::decode("9f50449e04a0e810283a1e9933adedd2").unwrap();
        let sample = hex::decode("d1b1c98dd7689fb8ec11d242b123dc9b").unwrap();
        let mask = header_protection_mask(&hp, &sample).unwrap();
        assert_eq!(hex::encode(mask), "437b9aec36");
    }

    #[test]
    fn test_decode_packet_number_without_history() {
        assert_eq!(decode_packet_number(&[0x00], None).unwrap(), 0);
        assert_eq!(decode_packet_number(&[0xc8], None).unwrap(), 200);
        assert_eq!(decode_packet_number(&[0x01, 0x23], None).unwrap(), 0x0123);
        assert_eq!(
            decode_packet_number(&[0x12, 0x34, 0x56, 0x78], None).unwrap(),
            0x12345678
        );
    }

    #[test]
    fn test_decode_packet_number_rfc9000_example() {
        // RFC 9000 Appendix A.3
        let decoded = decode_packet_number(&[0x9b, 0x32], Some(0xa82f30ea)).unwrap();
        assert_eq!(decoded, 0xa82f9b32);
    }

    #[test]
    fn test_decode_packet_number_rollover() {
        assert_eq!(decode_packet_number(&[0x00], Some(255)).unwrap(), 256);
    }

    #[test]
    fn test_decode_packet_number_invalid_length() {
        assert!(matches!(
            decode_packet_number(&[0, 1, 2, 3, 4], None),
            Err(QuicError::PacketNumberError(_))
        ));
        assert!(decode_packet_number(&[], None).is_err());
    }

    #[test]
    fn test_remove_header_protection_packet_too_short() {
        let keys = derive_initial_keys(&[1, 2, 3, 4], QuicVersion::V1).unwrap();
        let packet = [0u8; 30];
        let header = InitialHeader {
            first_byte: 0xc0,
            version: QuicVersion::V1,
            dcid: Bytes::new(),
            scid: Bytes::new(),
            token_len: 0,
            payload_len: 5,
            pn_offset: 25,
        };
        assert!(matches!(
            remove_header_protection(&packet, &header, &keys),
            Err(QuicError::PacketTooShort { .. })
        ));
    }
}
