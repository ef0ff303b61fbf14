//! 跨 Initial 包的 CRYPTO 流重组
//!
//! 客户端的 ClientHello 经常超过一个 datagram (后量子密钥交换、
//! 大量扩展)，因此按流收集 CRYPTO 帧，
//! 直到从 offset 0 开始的握手前缀包含完整的 ClientHello。

use crate::quic::decrypt::CryptoFrame;
use crate::tls::sni::{inspect_client_hello, ClientHello};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// 默认的 CRYPTO 重组字节上限
pub const DEFAULT_MAX_CRYPTO_BYTES: usize = 8 * 1024;
/// 默认的单流 Initial 包检查上限
pub const DEFAULT_MAX_INITIAL_PACKETS: usize = 4;

/// 单个流重组的安全上限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassemblyLimits {
    pub max_crypto_bytes: usize,
    pub max_packets: usize,
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self {
            max_crypto_bytes: DEFAULT_MAX_CRYPTO_BYTES,
            max_packets: DEFAULT_MAX_INITIAL_PACKETS,
        }
    }
}

/// 单个流的重组进度
///
/// 由流表持有，但只在这里解释。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CryptoReassembly {
    #[default]
    Empty,
    Accumulating {
        /// 以流偏移为键的 CRYPTO 分片
        fragments: BTreeMap<u64, Vec<u8>>,
        /// 已合并的 Initial 包数
        packets: usize,
        /// `fragments` 中的字节数
        bytes: usize,
    },
}

/// 检查一个流中一个 datagram 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    /// 不是受支持版本的 QUIC Initial 包
    NotInitial,
    /// 已解析出 SNI
    Found(String),
    /// ClientHello 尚不完整
    NeedMore(CryptoReassembly),
    /// 无法确定该流的 SNI
    GiveUp,
}

impl CryptoReassembly {
    pub fn is_empty(&self) -> bool {
        matches!(self, CryptoReassembly::Empty)
    }

    /// 合并一个包的 CRYPTO 帧并尝试读取 ClientHello
    ///
    /// 不会返回 `NotInitial`。
    pub fn absorb(self, frames: Vec<CryptoFrame>, limits: &ReassemblyLimits) -> ExtractionOutcome {
        let (mut fragments, packets) = match self {
            CryptoReassembly::Empty => (BTreeMap::new(), 0),
            CryptoReassembly::Accumulating {
                fragments, packets, ..
            } => (fragments, packets),
        };

        let packets = packets + 1;
        if packets > limits.max_packets {
            debug!(
                "Giving up: ClientHello still incomplete after {} Initial packets",
                limits.max_packets
            );
            return ExtractionOutcome::GiveUp;
        }

        for frame in frames {
            let end = frame.offset.checked_add(frame.data.len() as u64);
            if end.map_or(true, |end| end > limits.max_crypto_bytes as u64) {
                debug!(
                    "Giving up: CRYPTO frame at offset {} ({} bytes) exceeds the {} byte cap",
                    frame.offset,
                    frame.data.len(),
                    limits.max_crypto_bytes
                );
                return ExtractionOutcome::GiveUp;
            }
            // 重传可能重复同一 offset，保留最长的一份
            let slot = fragments.entry(frame.offset).or_insert_with(Vec::new);
            if frame.data.len() > slot.len() {
                *slot = frame.data.to_vec();
            }
        }

        let bytes: usize = fragments.values().map(Vec::len).sum();
        if bytes > limits.max_crypto_bytes {
            debug!("Giving up: {} buffered CRYPTO bytes exceed the cap", bytes);
            return ExtractionOutcome::GiveUp;
        }

        let stream = contiguous_prefix(&fragments);
        trace!(
            "CRYPTO stream: {} contiguous bytes from {} fragments ({} packets)",
            stream.len(),
            fragments.len(),
            packets
        );

        match inspect_client_hello(&stream) {
            Ok(ClientHello::ServerName(host)) => ExtractionOutcome::Found(host),
            Ok(ClientHello::Incomplete { total: Some(total) })
                if total > limits.max_crypto_bytes =>
            {
                debug!(
                    "Giving up: ClientHello of {} bytes exceeds the {} byte cap",
                    total, limits.max_crypto_bytes
                );
                ExtractionOutcome::GiveUp
            }
            Ok(ClientHello::Incomplete { .. }) => {
                ExtractionOutcome::NeedMore(CryptoReassembly::Accumulating {
                    fragments,
                    packets,
                    bytes,
                })
            }
            Ok(ClientHello::NoServerName) => {
                debug!("ClientHello carries no server_name");
                ExtractionOutcome::GiveUp
            }
            Err(e) => {
                debug!("Unusable ClientHello: {}", e);
                ExtractionOutcome::GiveUp
            }
        }
    }
}

/// 从 offset 0 开始无空洞的字节
fn contiguous_prefix(fragments: &BTreeMap<u64, Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut cur: u64 = 0;
    for (&offset, data) in fragments {
        if offset > cur {
            break;
        }
        let skip = (cur - offset) as usize;
        if skip < data.len() {
            out.extend_from_slice(&data[skip..]);
            cur += (data.len() - skip) as u64;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn hello(host: &str) -> Vec<u8> {
        let mut body = vec![0x03, 0x03];
        body.extend([0u8; 32]);
        body.push(0);
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01, 0x01, 0x00]);
        let name = host.as_bytes();
        let mut ext = vec![0x00, 0x00];
        ext.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
        ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        ext.push(0);
        ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
        ext.extend_from_slice(name);
        body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext);
        let mut msg = vec![0x01];
        msg.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        msg.extend_from_slice(&body);
        msg
    }

    fn frame(offset: usize, data: &[u8]) -> CryptoFrame {
        CryptoFrame {
            offset: offset as u64,
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn test_single_packet_found() {
        let msg = hello("test.example");
        let outcome = CryptoReassembly::Empty.absorb(vec![frame(0, &msg)], &ReassemblyLimits::default());
        assert_eq!(outcome, ExtractionOutcome::Found("test.example".to_string()));
    }

    #[test]
    fn test_split_across_packets() {
        let msg = hello("test.example");
        let limits = ReassemblyLimits::default();
        let (a, b) = msg.split_at(40);

        let state = match CryptoReassembly::Empty.absorb(vec![frame(0, a)], &limits) {
            ExtractionOutcome::NeedMore(state) => state,
            other => panic!("expected NeedMore, got {:?}", other),
        };
        assert!(!state.is_empty());

        let outcome = state.absorb(vec![frame(40, b)], &limits);
        assert_eq!(outcome, ExtractionOutcome::Found("test.example".to_string()));
    }

    #[test]
    fn test_out_of_order_fragments() {
        let msg = hello("late.example");
        let limits = ReassemblyLimits::default();
        let (a, b) = msg.split_at(10);

        // 先到尾部: offset 0 开始的前缀为空
        let state = match CryptoReassembly::Empty.absorb(vec![frame(10, b)], &limits) {
            ExtractionOutcome::NeedMore(state) => state,
            other => panic!("expected NeedMore, got {:?}", other),
        };
        assert_eq!(
            state.absorb(vec![frame(0, a)], &limits),
            ExtractionOutcome::Found("late.example".to_string())
        );
    }

    #[test]
    fn test_overlapping_retransmission() {
        let msg = hello("dup.example");
        let limits = ReassemblyLimits::default();
        let state = match CryptoReassembly::Empty.absorb(vec![frame(0, &msg[..30])], &limits) {
            ExtractionOutcome::NeedMore(state) => state,
            other => panic!("expected NeedMore, got {:?}", other),
        };
        let outcome = state.absorb(vec![frame(0, &msg[..20]), frame(20, &msg[20..])], &limits);
        assert_eq!(outcome, ExtractionOutcome::Found("dup.example".to_string()));
    }

    #[test]
    fn test_packet_cap() {
        let limits = ReassemblyLimits {
            max_crypto_bytes: 8192,
            max_packets: 2,
        };
        let msg = hello("slow.example");
        let mut state = CryptoReassembly::Empty;
        for i in 0..2 {
            state = match state.absorb(vec![frame(i, &msg[i..i + 1])], &limits) {
                ExtractionOutcome::NeedMore(state) => state,
                other => panic!("expected NeedMore, got {:?}", other),
            };
        }
        assert_eq!(
            state.absorb(vec![frame(2, &msg[2..3])], &limits),
            ExtractionOutcome::GiveUp
        );
    }

    #[test]
    fn test_byte_cap() {
        let limits = ReassemblyLimits {
            max_crypto_bytes: 64,
            max_packets: 4,
        };
        // 帧超出上限
        assert_eq!(
            CryptoReassembly::Empty.absorb(vec![frame(60, &[0u8; 8])], &limits),
            ExtractionOutcome::GiveUp
        );
        // 声明的 ClientHello 长度超过上限
        assert_eq!(
            CryptoReassembly::Empty.absorb(vec![frame(0, &[0x01, 0x00, 0x01, 0x00])], &limits),
            ExtractionOutcome::GiveUp
        );
    }

    #[test]
    fn test_not_client_hello_gives_up() {
        let outcome = CryptoReassembly::Empty.absorb(
            vec![frame(0, &[0x02, 0x00, 0x00, 0x10])],
            &ReassemblyLimits::default(),
        );
        assert_eq!(outcome, ExtractionOutcome::GiveUp);
    }

    #[test]
    fn test_contiguous_prefix_stops_at_gap() {
        let mut fragments = BTreeMap::new();
        fragments.insert(0, vec![1, 2, 3]);
        fragments.insert(2, vec![3, 4]);
        fragments.insert(10, vec![9]);
        assert_eq!(contiguous_prefix(&fragments), vec![1, 2, 3, 4]);
    }
}
