use crate::policy::Action;
use crate::quic::reassembly::CryptoReassembly;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 单个流的检查状态
///
/// 未决策时流持有被缓存的包；
/// 决策缓存后缓冲区清空且保持为空。
#[derive(Debug)]
pub struct FlowState<P> {
    /// CRYPTO 重组进度，只由检查器解释
    pub reassembly: CryptoReassembly,
    /// 解析出的 SNI，最多设置一次
    pub domain: Option<String>,
    /// 缓存的策略决策
    pub decision: Option<Action>,
    /// 累积阶段缓存的包
    pub buffered: VecDeque<P>,
    pub last_activity: Instant,
}

impl<P> FlowState<P> {
    pub fn new(now: Instant) -> Self {
        Self {
            reassembly: CryptoReassembly::Empty,
            domain: None,
            decision: None,
            buffered: VecDeque::new(),
            last_activity: now,
        }
    }

    /// 缓存决策并交回全部缓存的包
    pub fn decide(&mut self, action: Action, domain: Option<String>) -> Vec<P> {
        self.decision = Some(action);
        self.domain = domain;
        self.reassembly = CryptoReassembly::Empty;
        self.buffered.drain(..).collect()
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }
}
