//! 包级 SNI 过滤器
//!
//! 隧道入口: 从隧道读出的每个 IP 包都经过 [`SniFilter::process`]，
//! 要么原样交回，要么缓存到该流的 ClientHello 完整为止，
//! 要么连同该流的策略决策一起放行。

use crate::config::Config;
use crate::error::{FilterError, Result};
use crate::flow::{Eviction, FlowTracker, FlowVerdict, DEFAULT_FLOW_TIMEOUT, DEFAULT_SWEEP_INTERVAL};
use crate::packet::{classify, TunnelPacket};
use crate::policy::{Action, Policy};
use crate::quic::inspect::{InitialInspector, QuicInitialInspector};
use crate::quic::reassembly::ReassemblyLimits;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 过滤器运行参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOptions {
    /// 没有配置任何规则时也跟踪流并记录域名
    pub force_logging: bool,
    /// 流空闲多久后被遗忘
    pub flow_timeout: Duration,
    /// 两次空闲清理之间的最小间隔
    pub sweep_interval: Duration,
    /// 单个流的重组上限
    pub limits: ReassemblyLimits,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            force_logging: false,
            flow_timeout: DEFAULT_FLOW_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            limits: ReassemblyLimits::default(),
        }
    }
}

/// 从 QUIC Initial 包中解析出的域名
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SniEvent {
    pub domain: String,
    pub destination: IpAddr,
    pub protocol: &'static str,
}

/// 每解析出一个 QUIC 域名调用一次的回调
pub type SniLogger = Box<dyn Fn(&SniEvent) + Send + Sync>;

fn default_logger() -> SniLogger {
    Box::new(|event: &SniEvent| {
        info!(
            "{} SNI: {} -> {}",
            event.protocol, event.domain, event.destination
        );
    })
}

/// 单个包经过 [`SniFilter::process`] 的结果
#[derive(Debug)]
pub enum ProcessResult<P> {
    /// 不需要检查，按默认规则路由
    Passthrough(P),
    /// 已被过滤器缓存，调用方不要路由也不要重新提交
    Buffered,
    /// 所有包按 `action` 路由，可能包含之前缓存的包
    Release {
        action: Action,
        domain: Option<String>,
        packets: Vec<P>,
    },
}

impl<P> ProcessResult<P> {
    pub fn is_passthrough(&self) -> bool {
        matches!(self, ProcessResult::Passthrough(_))
    }

    pub fn is_buffered(&self) -> bool {
        matches!(self, ProcessResult::Buffered)
    }

    /// 要执行的动作，直通和缓存的包为 `None`
    pub fn action(&self) -> Action {
        match self {
            ProcessResult::Release { action, .. } => *action,
            _ => Action::None,
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            ProcessResult::Release { domain, .. } => domain.as_deref(),
            _ => None,
        }
    }

    pub fn packets(&self) -> &[P] {
        match self {
            ProcessResult::Passthrough(packet) => std::slice::from_ref(packet),
            ProcessResult::Buffered => &[],
            ProcessResult::Release { packets, .. } => packets,
        }
    }

    pub fn into_packets(self) -> Vec<P> {
        match self {
            ProcessResult::Passthrough(packet) => vec![packet],
            ProcessResult::Buffered => Vec::new(),
            ProcessResult::Release { packets, .. } => packets,
        }
    }
}

/// 过滤器计数器快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    pub packets: u64,
    pub passthrough: u64,
    pub buffered: u64,
    pub released: u64,
    pub domains_resolved: u64,
    pub give_ups: u64,
    pub flows_evicted: u64,
    pub packets_disposed: u64,
}

impl fmt::Display for FilterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "packets={} passthrough={} buffered={} released={} domains={} give_ups={} evicted={} disposed={}",
            self.packets,
            self.passthrough,
            self.buffered,
            self.released,
            self.domains_resolved,
            self.give_ups,
            self.flows_evicted,
            self.packets_disposed
        )
    }
}

#[derive(Debug, Default)]
struct Counters {
    packets: AtomicU64,
    passthrough: AtomicU64,
    buffered: AtomicU64,
    released: AtomicU64,
    domains_resolved: AtomicU64,
    give_ups: AtomicU64,
    flows_evicted: AtomicU64,
    packets_disposed: AtomicU64,
}

impl Counters {
    fn record_eviction(&self, eviction: Eviction) {
        self.flows_evicted
            .fetch_add(eviction.flows as u64, Ordering::Relaxed);
        self.packets_disposed
            .fetch_add(eviction.packets as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> FilterStats {
        FilterStats {
            packets: self.packets.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            domains_resolved: self.domains_resolved.load(Ordering::Relaxed),
            give_ups: self.give_ups.load(Ordering::Relaxed),
            flows_evicted: self.flows_evicted.load(Ordering::Relaxed),
            packets_disposed: self.packets_disposed.load(Ordering::Relaxed),
        }
    }
}

/// 按流工作的 QUIC SNI 过滤器
///
/// 同一个流的包必须按顺序、非并发地提交；
/// 不同的流可以在不同线程中处理。
pub struct SniFilter<P: TunnelPacket, I: InitialInspector = QuicInitialInspector> {
    policy: Policy,
    options: FilterOptions,
    inspector: I,
    tracker: FlowTracker<P>,
    logger: SniLogger,
    counters: Counters,
    disposed: AtomicBool,
}

impl<P: TunnelPacket> SniFilter<P> {
    pub fn new(policy: Policy, options: FilterOptions) -> Self {
        let inspector = QuicInitialInspector::new(options.limits);
        Self::with_inspector(policy, options, inspector)
    }

    /// 由 `[filter]` 和 `[rules]` 配置段构建过滤器
    pub fn from_config(config: &Config) -> Result<Self> {
        let policy = config.policy()?;
        Ok(Self::new(policy, config.filter_options()))
    }
}

impl<P: TunnelPacket, I: InitialInspector> SniFilter<P, I> {
    pub fn with_inspector(policy: Policy, options: FilterOptions, inspector: I) -> Self {
        let tracker = FlowTracker::new(options.flow_timeout, options.sweep_interval);
        Self {
            policy,
            options,
            inspector,
            tracker,
            logger: default_logger(),
            counters: Counters::default(),
            disposed: AtomicBool::new(false),
        }
    }

    /// 替换域名解析成功时调用的回调
    pub fn with_logger<F>(mut self, logger: F) -> Self
    where
        F: Fn(&SniEvent) + Send + Sync + 'static,
    {
        self.logger = Box::new(logger);
        self
    }

    /// 是否检查数据包
    pub fn is_enabled(&self) -> bool {
        !self.policy.is_empty() || self.options.force_logging
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn options(&self) -> &FilterOptions {
        &self.options
    }

    pub fn stats(&self) -> FilterStats {
        self.counters.snapshot()
    }

    /// 流表中当前的流数量
    pub fn tracked_flows(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// 对已提取出的域名做决策 (TCP/TLS 路径)
    pub fn evaluate_domain(&self, domain: Option<&str>) -> Action {
        match domain {
            Some(domain) if !domain.is_empty() => self.policy.evaluate(domain),
            _ => Action::None,
        }
    }

    /// 处理一个从隧道读出的 IP 包
    pub fn process(&self, packet: P) -> Result<ProcessResult<P>> {
        self.process_at(packet, Instant::now())
    }

    /// 与 [`process`](Self::process) 相同，但显式传入当前时间
    pub fn process_at(&self, packet: P, now: Instant) -> Result<ProcessResult<P>> {
        if self.is_disposed() {
            return Err(FilterError::Disposed);
        }
        self.counters.packets.fetch_add(1, Ordering::Relaxed);

        if !self.is_enabled() {
            return Ok(self.passthrough(packet));
        }

        let meta = match classify(packet.data()) {
            Some(meta) if meta.is_quic_candidate() => meta,
            _ => return Ok(self.passthrough(packet)),
        };

        if let Some(eviction) = self.tracker.maybe_sweep(now) {
            self.counters.record_eviction(eviction);
        }

        let policy = &self.policy;
        let verdict = self.tracker.process(
            meta.key,
            packet,
            meta.payload.clone(),
            now,
            &self.inspector,
            |domain| policy.evaluate(domain),
        );

        let result = match verdict {
            FlowVerdict::Untracked(packet) => self.passthrough(packet),
            FlowVerdict::Buffered => {
                self.counters.buffered.fetch_add(1, Ordering::Relaxed);
                if self.is_disposed() {
                    // 检查期间 dispose() 已执行，这个包不能留在流表里
                    self.drain();
                }
                ProcessResult::Buffered
            }
            FlowVerdict::Cached {
                action,
                domain,
                packet,
            } => {
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                ProcessResult::Release {
                    action,
                    domain,
                    packets: vec![packet],
                }
            }
            FlowVerdict::Decided {
                action,
                domain,
                packets,
            } => {
                match &domain {
                    Some(domain) => {
                        self.counters
                            .domains_resolved
                            .fetch_add(1, Ordering::Relaxed);
                        (self.logger)(&SniEvent {
                            domain: domain.clone(),
                            destination: meta.key.dst,
                            protocol: "quic",
                        });
                    }
                    None => {
                        self.counters.give_ups.fetch_add(1, Ordering::Relaxed);
                    }
                }
                self.counters
                    .released
                    .fetch_add(packets.len() as u64, Ordering::Relaxed);
                ProcessResult::Release {
                    action,
                    domain,
                    packets,
                }
            }
        };

        Ok(result)
    }

    /// 释放所有缓存的包并停止接受新包
    ///
    /// 可以重复调用，只有第一次生效。
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let eviction = self.drain();
        info!(
            "SNI filter disposed: {} flow(s) dropped, {} buffered packet(s) disposed",
            eviction.flows, eviction.packets
        );
        debug!("Final filter stats: {}", self.stats());
    }

    fn drain(&self) -> Eviction {
        let eviction = self.tracker.dispose_all();
        self.counters.record_eviction(eviction);
        eviction
    }

    fn passthrough(&self, packet: P) -> ProcessResult<P> {
        self.counters.passthrough.fetch_add(1, Ordering::Relaxed);
        ProcessResult::Passthrough(packet)
    }
}

impl<P: TunnelPacket, I: InitialInspector> Drop for SniFilter<P, I> {
    fn drop(&mut self) {
        // 与 dispose() 并发的调用可能在其之后又缓存了包，这里总是清空
        if self.is_disposed() {
            self.drain();
        } else {
            self.dispose();
        }
    }
}
