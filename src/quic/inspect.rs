//! 逐个 datagram 的 Initial 检查流程
//!
//! 把解码和重组串起来，并把所有失败归并为 [`ExtractionOutcome`]

use crate::quic::decrypt::decrypt_initial;
use crate::quic::reassembly::{CryptoReassembly, ExtractionOutcome, ReassemblyLimits};
use tracing::{debug, trace};

/// 结合流的重组进度检查该流的一个 UDP payload
///
/// 实现不得修改或保留传入的 datagram 字节
pub trait InitialInspector: Send + Sync {
    fn inspect(&self, datagram: &[u8], state: CryptoReassembly) -> ExtractionOutcome;
}

/// 解密客户端 Initial 包 (QUIC v1 和 v2) 并读取 SNI
#[derive(Debug, Clone, Default)]
pub struct QuicInitialInspector {
    limits: ReassemblyLimits,
}

impl QuicInitialInspector {
    pub fn new(limits: ReassemblyLimits) -> Self {
        Self { limits }
    }
}

impl InitialInspector for QuicInitialInspector {
    fn inspect(&self, datagram: &[u8], state: CryptoReassembly) -> ExtractionOutcome {
        match decrypt_initial(datagram) {
            Ok(initial) => {
                trace!(
                    "Initial packet {:?} pn={} dcid={:02x?}: {} CRYPTO frames",
                    initial.version,
                    initial.packet_number,
                    initial.dcid.as_ref(),
                    initial.crypto_frames.len()
                );
                state.absorb(initial.crypto_frames, &self.limits)
            }
            Err(e) if e.is_not_initial() => {
                trace!("Not a QUIC Initial packet: {}", e);
                ExtractionOutcome::NotInitial
            }
            Err(e) => {
                debug!("Failed to decode QUIC Initial packet: {}", e);
                ExtractionOutcome::GiveUp
            }
        }
    }
}
