//! 构造真实的 (受保护的) QUIC Initial 包，用于端到端测试
#![allow(dead_code)]

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use quic_sni_filter::quic::crypto::{derive_initial_keys, QuicVersion};
use quic_sni_filter::quic::decrypt::construct_nonce;
use quic_sni_filter::quic::header::header_protection_mask;
use std::net::{Ipv4Addr, Ipv6Addr};

/// RFC 9001 Appendix A 的 DCID
pub const RFC_DCID: [u8; 8] = [0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];

pub const CLIENT_V4: Ipv4Addr = Ipv4Addr::new(10, 8, 0, 2);
pub const SERVER_V4: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

/// 客户端 Initial datagram 至少填充到这个大小
const MIN_INITIAL_SIZE: usize = 1200;
const PN_LEN: usize = 4;

/// TLS ClientHello 握手消息 (不含 record 层)
///
/// `padding` 添加对应字节数的 padding 扩展 (type 21)，
/// 使消息可以超过一个 datagram
pub fn client_hello(sni: Option<&str>, padding: usize) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // legacy_version
    body.extend((0u8..32).map(|b| b.wrapping_mul(7))); // random
    body.push(0x00); // session id
    body.extend_from_slice(&[0x00, 0x06, 0x13, 0x01, 0x13, 0x02, 0x13, 0x03]); // cipher suites
    body.extend_from_slice(&[0x01, 0x00]); // compression

    let mut extensions = Vec::new();
    // supported_versions: TLS 1.3
    extensions.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);
    if let Some(name) = sni {
        let name = name.as_bytes();
        extensions.extend_from_slice(&[0x00, 0x00]);
        extensions.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
        extensions.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        extensions.push(0x00);
        extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
        extensions.extend_from_slice(name);
    }
    if padding > 0 {
        extensions.extend_from_slice(&[0x00, 0x15]);
        extensions.extend_from_slice(&(padding as u16).to_be_bytes());
        extensions.resize(extensions.len() + padding, 0);
    }
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut msg = vec![0x01];
    msg.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    msg.extend_from_slice(&body);
    msg
}

pub fn encode_varint(value: u64, out: &mut Vec<u8>) {
    if value < 1 << 6 {
        out.push(value as u8);
    } else if value < 1 << 14 {
        out.extend_from_slice(&(value as u16 | 0x4000).to_be_bytes());
    } else if value < 1 << 30 {
        out.extend_from_slice(&(value as u32 | 0x8000_0000).to_be_bytes());
    } else {
        out.extend_from_slice(&(value | 0xc000_0000_0000_0000).to_be_bytes());
    }
}

/// 在 `offset` 处携带 `data` 的 CRYPTO 帧
pub fn crypto_frame(offset: u64, data: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x06];
    encode_varint(offset, &mut frame);
    encode_varint(data.len() as u64, &mut frame);
    frame.extend_from_slice(data);
    frame
}

/// 把 `frames` 封装成客户端 Initial 包: 先 AEAD 加密，再加头部保护
///
/// 明文会被填充，使 datagram 达到 1200 字节的下限
pub fn initial_packet(version: QuicVersion, dcid: &[u8], packet_number: u32, frames: &[u8]) -> Vec<u8> {
    let keys = derive_initial_keys(dcid, version).unwrap();
    let scid = [0x5c; 8];

    let mut header = vec![0xc0 | (version.initial_packet_type() << 4) | (PN_LEN as u8 - 1)];
    header.extend_from_slice(&version.wire().to_be_bytes());
    header.push(dcid.len() as u8);
    header.extend_from_slice(dcid);
    header.push(scid.len() as u8);
    header.extend_from_slice(&scid);
    header.push(0x00); // token length

    // 这里 Length 字段固定为两字节
    let fixed = header.len() + 2 + PN_LEN + 16;
    let mut plaintext = frames.to_vec();
    if fixed + plaintext.len() < MIN_INITIAL_SIZE {
        plaintext.resize(MIN_INITIAL_SIZE - fixed, 0x00);
    }
    let length = PN_LEN + plaintext.len() + 16;
    assert!(length < 1 << 14);
    header.extend_from_slice(&(length as u16 | 0x4000).to_be_bytes());

    let pn_offset = header.len();
    header.extend_from_slice(&packet_number.to_be_bytes());

    let cipher = Aes128Gcm::new_from_slice(&keys.key).unwrap();
    let nonce = construct_nonce(&keys.iv, u64::from(packet_number));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &plaintext,
                aad: &header,
            },
        )
        .unwrap();

    let mut packet = header;
    packet.extend_from_slice(&ciphertext);

    let sample_start = pn_offset + 4;
    let mask = header_protection_mask(&keys.hp_key, &packet[sample_start..sample_start + 16]).unwrap();
    packet[0] ^= mask[0] & 0x0f;
    for i in 0..PN_LEN {
        packet[pn_offset + i] ^= mask[1 + i];
    }
    packet
}

/// 单个 Initial 包携带 `sni` 对应的完整 ClientHello
pub fn simple_initial(version: QuicVersion, sni: &str) -> Vec<u8> {
    let hello = client_hello(Some(sni), 0);
    initial_packet(version, &RFC_DCID, 0, &crypto_frame(0, &hello))
}

pub fn ipv4_udp(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total = 20 + udp_len;
    let mut packet = vec![0x45, 0x00];
    packet.extend_from_slice(&(total as u16).to_be_bytes());
    packet.extend_from_slice(&[0x12, 0x34, 0x40, 0x00]);
    packet.extend_from_slice(&[64, 17, 0, 0]);
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&dst.octets());
    packet.extend_from_slice(&sport.to_be_bytes());
    packet.extend_from_slice(&dport.to_be_bytes());
    packet.extend_from_slice(&(udp_len as u16).to_be_bytes());
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(payload);
    packet
}

pub fn ipv6_udp(src: Ipv6Addr, dst: Ipv6Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let mut packet = vec![0x60, 0, 0, 0];
    packet.extend_from_slice(&(udp_len as u16).to_be_bytes());
    packet.extend_from_slice(&[17, 64]);
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&dst.octets());
    packet.extend_from_slice(&sport.to_be_bytes());
    packet.extend_from_slice(&dport.to_be_bytes());
    packet.extend_from_slice(&(udp_len as u16).to_be_bytes());
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(payload);
    packet
}

/// 测试客户端发出的 UDP/443 datagram
pub fn quic_v4(sport: u16, payload: &[u8]) -> Vec<u8> {
    ipv4_udp(CLIENT_V4, SERVER_V4, sport, 443, payload)
}
