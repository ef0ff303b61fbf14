//! QUIC Initial payload 解密与帧扫描
//!
//! 参考 RFC 9001 Section 5.3 (AEAD Usage) 和 RFC 9000 Section 19 (Frames)

use crate::quic::crypto::{derive_initial_keys, InitialKeys, QuicVersion, IV_LEN};
use crate::quic::error::{QuicError, Result};
use crate::quic::header::remove_header_protection;
use crate::quic::parser::{parse_initial_header, parse_varint};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use bytes::Bytes;
use tracing::{debug, trace};

/// AES-128-GCM 认证标签长度
pub const TAG_LEN: usize = 16;

const FRAME_PADDING: u64 = 0x00;
const FRAME_PING: u64 = 0x01;
const FRAME_ACK: u64 = 0x02;
const FRAME_ACK_ECN: u64 = 0x03;
const FRAME_CRYPTO: u64 = 0x06;
const FRAME_CONNECTION_CLOSE: u64 = 0x1c;

/// 一个 CRYPTO 帧: TLS 握手流的一段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame {
    pub offset: u64,
    pub data: Bytes,
}

/// 解密后的客户端 Initial 包
#[derive(Debug, Clone)]
pub struct DecryptedInitial {
    pub version: QuicVersion,
    pub dcid: Bytes,
    pub packet_number: u64,
    pub crypto_frames: Vec<CryptoFrame>,
}

/// 解析、解除保护并解密 `datagram` 中的第一个 QUIC 包，
/// 返回其中的 CRYPTO 帧。
///
/// 第一个包之后合并的包会被忽略。
pub fn decrypt_initial(datagram: &[u8]) -> Result<DecryptedInitial> {
    let header = parse_initial_header(datagram)?;
    let keys = derive_initial_keys(&header.dcid, header.version)?;
    let unprotected = remove_header_protection(datagram, &header, &keys)?;

    let payload_start = header.pn_offset + unprotected.pn_len;
    let payload_end = header.packet_end();
    if payload_end < payload_start + TAG_LEN {
        return Err(QuicError::PacketTooShort {
            expected: payload_start + TAG_LEN,
            actual: payload_end,
        });
    }

    let plaintext = decrypt_payload(
        &datagram[payload_start..payload_end],
        &unprotected.aad,
        unprotected.packet_number,
        &keys,
    )?;

    trace!(
        "Decrypted payload: {} bytes, pn={}",
        plaintext.len(),
        unprotected.packet_number
    );

    let crypto_frames = parse_crypto_frames(&plaintext)?;

    Ok(DecryptedInitial {
        version: header.version,
        dcid: header.dcid,
        packet_number: unprotected.packet_number,
        crypto_frames,
    })
}

/// AEAD 解密受保护的 payload (密文后跟认证标签)
pub fn decrypt_payload(
    ciphertext: &[u8],
    aad: &[u8],
    packet_number: u64,
    keys: &InitialKeys,
) -> Result<Vec<u8>> {
    let cipher = Aes128Gcm::new_from_slice(&keys.key).map_err(|e| {
        QuicError::DecryptionFailed(format!("Failed to create AEAD key: {}", e))
    })?;
    let nonce = construct_nonce(&keys.iv, packet_number);

    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| QuicError::DecryptionFailed("AEAD tag mismatch".to_string()))
}

/// Nonce = IV XOR packet number (左侧补零到 IV 长度)
pub fn construct_nonce(iv: &[u8; IV_LEN], packet_number: u64) -> [u8; IV_LEN] {
    let mut nonce = *iv;
    for (n, p) in nonce[IV_LEN - 8..].iter_mut().zip(packet_number.to_be_bytes()) {
        *n ^= p;
    }
    nonce
}

/// 扫描解密后的帧并收集 CRYPTO 帧
///
/// 跳过 PADDING、PING、ACK 和 CONNECTION_CLOSE。其他帧类型
/// 不允许出现在 Initial 包中，遇到时停止扫描，
/// 保留已收集的帧。
pub fn parse_crypto_frames(payload: &[u8]) -> Result<Vec<CryptoFrame>> {
    let mut cursor = payload;
    let mut frames = Vec::new();

    while !cursor.is_empty() {
        // 客户端 Initial 的大部分内容是连续的 padding
        if cursor[0] == 0x00 {
            let padding = cursor.iter().take_while(|&&b| b == 0x00).count();
            cursor = &cursor[padding..];
            continue;
        }

        let frame_type = read_varint(&mut cursor)?;
        match frame_type {
            FRAME_PADDING | FRAME_PING => {}
            FRAME_ACK | FRAME_ACK_ECN => {
                // Largest Acknowledged, ACK Delay, ACK Range Count, First ACK Range
                let _largest = read_varint(&mut cursor)?;
                let _delay = read_varint(&mut cursor)?;
                let range_count = read_varint(&mut cursor)?;
                let _first_range = read_varint(&mut cursor)?;
                for _ in 0..range_count {
                    let _gap = read_varint(&mut cursor)?;
                    let _len = read_varint(&mut cursor)?;
                }
                if frame_type == FRAME_ACK_ECN {
                    for _ in 0..3 {
                        read_varint(&mut cursor)?;
                    }
                }
            }
            FRAME_CRYPTO => {
                let offset = read_varint(&mut cursor)?;
                let length = read_varint(&mut cursor)?;
                let data = take(&mut cursor, length)?;
                trace!("CRYPTO frame: offset={}, length={}", offset, length);
                frames.push(CryptoFrame {
                    offset,
                    data: Bytes::copy_from_slice(data),
                });
            }
            FRAME_CONNECTION_CLOSE => {
                let _error_code = read_varint(&mut cursor)?;
                let _frame_type = read_varint(&mut cursor)?;
                let reason_len = read_varint(&mut cursor)?;
                take(&mut cursor, reason_len)?;
            }
            other => {
                debug!("Stopping frame scan on frame type {:#x}", other);
                break;
            }
        }
    }

    Ok(frames)
}

fn read_varint(cursor: &mut &[u8]) -> Result<u64> {
    let (value, len) = parse_varint(cursor)?;
    *cursor = &cursor[len..];
    Ok(value)
}

fn take<'a>(cursor: &mut &'a [u8], len: u64) -> Result<&'a [u8]> {
    let available = cursor.len();
    let len = usize::try_from(len)
        .ok()
        .filter(|&len| len <= available)
        .ok_or_else(|| {
            QuicError::FrameError(format!(
                "frame data truncated: expected {}, got {}",
                len, available
            ))
        })?;
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    Ok(head)
}
