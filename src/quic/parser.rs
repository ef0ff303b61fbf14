//! QUIC Initial Packet 头部解析器
//!
//! 参考 RFC 9000 Section 17.2 (Long Header Packets) 和 RFC 9369 Section 3.2
//! (QUIC v2 的 Long Header 包类型)

use crate::quic::crypto::QuicVersion;
use crate::quic::error::{QuicError, Result};
use bytes::Bytes;
use tracing::trace;

/// QUIC v1/v2 的 Connection ID 最大长度 (RFC 9000 Section 17.2)
pub const MAX_CID_LEN: usize = 20;

/// 解析后的 QUIC Initial 头部，截止到受保护的 Packet Number (不含)
#[derive(Debug, Clone)]
pub struct InitialHeader {
    /// 第一个字节，仍处于头部保护之下
    pub first_byte: u8,
    /// QUIC 版本号
    pub version: QuicVersion,
    /// Destination Connection ID (密钥派生的输入)
    pub dcid: Bytes,
    /// Source Connection ID
    pub scid: Bytes,
    /// Token 长度
    pub token_len: usize,
    /// Length 字段: Packet Number + 受保护的 payload
    pub payload_len: usize,
    /// Packet Number 在 datagram 中的偏移量
    pub pn_offset: usize,
}

impl InitialHeader {
    /// 当前包在 datagram 中的结束位置，之后的字节属于合并的其他包
    pub fn packet_end(&self) -> usize {
        self.pn_offset + self.payload_len
    }
}

/// 解析 QUIC Initial 包的 Long Header
///
/// Short Header 和其他 Long Header 类型返回 `NotInitialPacket`，
/// 没有已知 Initial salt 的版本返回 `UnsupportedVersion`，
/// 截断的输入返回 `PacketTooShort`/`VarIntError`。
pub fn parse_initial_header(packet: &[u8]) -> Result<InitialHeader> {
    let first_byte = *packet.first().ok_or(QuicError::PacketTooShort {
        expected: 1,
        actual: 0,
    })?;

    // Long Header: 0b1xxxxxxx
    if (first_byte & 0x80) == 0 {
        return Err(QuicError::NotInitialPacket(first_byte));
    }

    if packet.len() < 6 {
        return Err(QuicError::PacketTooShort {
            expected: 6,
            actual: packet.len(),
        });
    }

    let raw_version = u32::from_be_bytes([packet[1], packet[2], packet[3], packet[4]]);
    let version = QuicVersion::from_wire(raw_version)
        .ok_or(QuicError::UnsupportedVersion { version: raw_version })?;

    // Long Header 的包类型在 bits 5-4，
    // Initial 在 v1 中是 0b00，在 v2 中是 0b01
    let packet_type = (first_byte & 0x30) >> 4;
    if packet_type != version.initial_packet_type() {
        return Err(QuicError::NotInitialPacket(first_byte));
    }

    let mut offset = 5;

    let dcil = packet[offset] as usize;
    offset += 1;
    if dcil > MAX_CID_LEN {
        return Err(QuicError::InvalidConnectionId(dcil));
    }
    ensure_len(packet, offset + dcil)?;
    let dcid = Bytes::copy_from_slice(&packet[offset..offset + dcil]);
    offset += dcil;

    trace!("DCID: {:02x?} ({} bytes)", dcid, dcil);

    ensure_len(packet, offset + 1)?;
    let scil = packet[offset] as usize;
    offset += 1;
    if scil > MAX_CID_LEN {
        return Err(QuicError::InvalidConnectionId(scil));
    }
    ensure_len(packet, offset + scil)?;
    let scid = Bytes::copy_from_slice(&packet[offset..offset + scil]);
    offset += scil;

    trace!("SCID: {:02x?} ({} bytes)", scid, scil);

    let (token_len, varint_len) = parse_varint(&packet[offset..])?;
    offset += varint_len;
    let token_len = usize::try_from(token_len)
        .map_err(|_| QuicError::VarIntError(format!("token length {} overflows", token_len)))?;
    ensure_len(packet, offset.saturating_add(token_len))?;
    offset += token_len;

    trace!("Token Length: {} bytes", token_len);

    let (payload_len, varint_len) = parse_varint(&packet[offset..])?;
    offset += varint_len;
    let payload_len = usize::try_from(payload_len)
        .map_err(|_| QuicError::VarIntError(format!("length {} overflows", payload_len)))?;

    let pn_offset = offset;
    ensure_len(packet, pn_offset.saturating_add(payload_len))?;

    trace!(
        "Initial header: version={:?}, payload_len={}, pn_offset={}",
        version,
        payload_len,
        pn_offset
    );

    Ok(InitialHeader {
        first_byte,
        version,
        dcid,
        scid,
        token_len,
        payload_len,
        pn_offset,
    })
}

fn ensure_len(packet: &[u8], expected: usize) -> Result<()> {
    if packet.len() < expected {
        return Err(QuicError::PacketTooShort {
            expected,
            actual: packet.len(),
        });
    }
    Ok(())
}

/// 解析 QUIC 变长整数 (RFC 9000 Section 16)
///
/// 返回 `(value, bytes_consumed)`
pub fn parse_varint(data: &[u8]) -> Result<(u64, usize)> {
    let first = *data
        .first()
        .ok_or_else(|| QuicError::VarIntError("No data for VarInt".to_string()))?;

    // 最高两位表示长度: 1、2、4 或 8 字节
    let length = 1usize << (first >> 6);
    if data.len() < length {
        return Err(QuicError::VarIntError(format!(
            "VarInt truncated: expected {} bytes, got {}",
            length,
            data.len()
        )));
    }

    let value = data[1..length]
        .iter()
        .fold((first & 0x3f) as u64, |acc, &b| (acc << 8) | b as u64);

    Ok((value, length))
}
