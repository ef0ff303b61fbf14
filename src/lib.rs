//! quic-sni-filter 库
//!
//! 在 VPN 隧道中按流检查 UDP/443 的 QUIC Initial 包，解密出 TLS ClientHello
//! 中的 SNI，并根据 block / include / exclude 规则为整个流做出决策。

pub mod config;
pub mod error;
pub mod filter;
pub mod flow;
pub mod packet;
pub mod policy;
pub mod quic;
pub mod tls;

// 重新导出常用类型
pub use config::Config;
pub use error::{FilterError, PolicyError};
pub use filter::{FilterOptions, FilterStats, ProcessResult, SniEvent, SniFilter};
pub use packet::{FlowKey, TunnelPacket};
pub use policy::{Action, Policy};
