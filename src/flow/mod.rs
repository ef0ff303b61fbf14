//! 流跟踪与决策缓存
//!
//! 每个 UDP/443 流依次经历 Unseen -> Accumulating -> Decided。
//! 只解密流的前几个 Initial 包；决策缓存后，
//! 该流的后续包都直接由流表应答。

mod state;

pub use state::FlowState;

use crate::packet::{FlowKey, TunnelPacket};
use crate::policy::Action;
use crate::quic::inspect::InitialInspector;
use crate::quic::reassembly::{CryptoReassembly, ExtractionOutcome};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::ops::Range;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// 默认流空闲超时
pub const DEFAULT_FLOW_TIMEOUT: Duration = Duration::from_millis(500);
/// 默认清理间隔
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// 交给流表的单个包的处理结果
#[derive(Debug)]
pub enum FlowVerdict<P> {
    /// 新流上的非 QUIC Initial 包，不做记录
    Untracked(P),
    /// 缓存到流有决策为止
    Buffered,
    /// 流已有决策，只返回当前包
    Cached {
        action: Action,
        domain: Option<String>,
        packet: P,
    },
    /// 当前包使流得出决策，缓存的包排在前面
    Decided {
        action: Action,
        domain: Option<String>,
        packets: Vec<P>,
    },
}

/// 一次空闲清理或关闭清空的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Eviction {
    pub flows: usize,
    pub packets: usize,
}

/// 以四元组为键的流表
pub struct FlowTracker<P> {
    flows: DashMap<FlowKey, FlowState<P>>,
    flow_timeout: Duration,
    sweep_interval: Duration,
    last_sweep: Mutex<Instant>,
}

impl<P: TunnelPacket> FlowTracker<P> {
    pub fn new(flow_timeout: Duration, sweep_interval: Duration) -> Self {
        Self {
            flows: DashMap::new(),
            flow_timeout,
            sweep_interval,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// 让 `key` 对应流的一个包走一遍状态机
    ///
    /// `payload` 是 UDP payload 在 `packet.data()` 中的范围。
    /// `decide` 把域名映射为动作；它和检查器一样，
    /// 执行时不持有任何流表锁。
    pub fn process<I, F>(
        &self,
        key: FlowKey,
        packet: P,
        payload: Range<usize>,
        now: Instant,
        inspector: &I,
        decide: F,
    ) -> FlowVerdict<P>
    where
        I: InitialInspector + ?Sized,
        F: FnOnce(&str) -> Action,
    {
        let (tracked, reassembly) = match self.flows.get_mut(&key) {
            Some(mut entry) => {
                entry.touch(now);
                if let Some(action) = entry.decision {
                    trace!("Flow {} already decided: {}", key, action);
                    return FlowVerdict::Cached {
                        action,
                        domain: entry.domain.clone(),
                        packet,
                    };
                }
                (true, std::mem::take(&mut entry.reassembly))
            }
            None => (false, CryptoReassembly::Empty),
        };

        let outcome = {
            let datagram = packet.data().get(payload).unwrap_or_default();
            inspector.inspect(datagram, reassembly)
        };

        match outcome {
            ExtractionOutcome::NotInitial if !tracked => FlowVerdict::Untracked(packet),
            ExtractionOutcome::NeedMore(reassembly) => {
                let mut entry = self
                    .flows
                    .entry(key)
                    .or_insert_with(|| FlowState::new(now));
                entry.reassembly = reassembly;
                entry.buffered.push_back(packet);
                entry.touch(now);
                debug!(
                    "Flow {}: ClientHello incomplete, {} packet(s) buffered",
                    key,
                    entry.buffered.len()
                );
                FlowVerdict::Buffered
            }
            outcome => {
                let (action, domain) = match outcome {
                    ExtractionOutcome::Found(domain) => (decide(&domain), Some(domain)),
                    _ => (Action::None, None),
                };
                let mut entry = self
                    .flows
                    .entry(key)
                    .or_insert_with(|| FlowState::new(now));
                let mut packets = entry.decide(action, domain.clone());
                entry.touch(now);
                drop(entry);

                packets.push(packet);
                debug!(
                    "Flow {} decided: {} (domain: {:?}), releasing {} packet(s)",
                    key,
                    action,
                    domain,
                    packets.len()
                );
                FlowVerdict::Decided {
                    action,
                    domain,
                    packets,
                }
            }
        }
    }

    /// 距上次清理超过间隔时清理空闲流
    ///
    /// 并发调用方不会等待: 拿到锁的负责清理，
    /// 其余直接跳过。
    pub fn maybe_sweep(&self, now: Instant) -> Option<Eviction> {
        let mut last_sweep = self.last_sweep.try_lock()?;
        if now.saturating_duration_since(*last_sweep) < self.sweep_interval {
            return None;
        }
        *last_sweep = now;
        drop(last_sweep);

        Some(self.evict_idle(now))
    }

    /// 移除所有空闲超时的流，并释放它们缓存的包
    pub fn evict_idle(&self, now: Instant) -> Eviction {
        let timeout = self.flow_timeout;
        let mut orphaned = Vec::new();
        let mut flows = 0;

        self.flows.retain(|key, state| {
            if state.is_idle(now, timeout) {
                trace!("Evicting idle flow {}", key);
                flows += 1;
                orphaned.extend(state.buffered.drain(..));
                false
            } else {
                true
            }
        });

        let packets = dispose_packets(orphaned);
        if flows > 0 {
            debug!(
                "Evicted {} idle flow(s), disposed {} buffered packet(s)",
                flows, packets
            );
        }
        Eviction { flows, packets }
    }

    /// 清空流表并释放所有缓存的包
    pub fn dispose_all(&self) -> Eviction {
        let mut orphaned = Vec::new();
        let mut flows = 0;
        self.flows.retain(|_, state| {
            flows += 1;
            orphaned.extend(state.buffered.drain(..));
            false
        });

        let packets = dispose_packets(orphaned);
        Eviction { flows, packets }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

}

#[cfg(test)]
impl<P: TunnelPacket> FlowTracker<P> {
    fn decision(&self, key: &FlowKey) -> Option<Action> {
        self.flows.get(key).and_then(|state| state.decision)
    }

    fn buffered_len(&self, key: &FlowKey) -> usize {
        self.flows.get(key).map_or(0, |state| state.buffered.len())
    }
}

/// 释放不会再被路由的包，返回交给 `dispose` 的数量。
/// 失败只记录日志。
fn dispose_packets<P: TunnelPacket>(packets: Vec<P>) -> usize {
    let count = packets.len();
    for packet in packets {
        if let Err(e) = packet.dispose() {
            warn!("Failed to dispose buffered packet: {:#}", e);
        }
    }
    count
}
