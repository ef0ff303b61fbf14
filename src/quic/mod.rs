//! QUIC Initial 检查
//!
//! 客户端 Initial 包的密钥可以由 Destination Connection ID 直接派生，
//! 因此无需参与连接就能读取其中的 TLS ClientHello 及 SNI。
//!
//! 流程: [`parser`] (Long Header) -> [`crypto`] (Initial 密钥) ->
//! [`header`] (头部保护) -> [`decrypt`] (AEAD + 帧) ->
//! [`reassembly`] (CRYPTO 流 + ClientHello) -> [`inspect`]

pub mod crypto;
pub mod decrypt;
pub mod error;
pub mod header;
pub mod inspect;
pub mod parser;
pub mod reassembly;

pub use crypto::{derive_initial_keys, InitialKeys, QuicVersion};
pub use decrypt::{decrypt_initial, CryptoFrame, DecryptedInitial};
pub use error::QuicError;
pub use inspect::{InitialInspector, QuicInitialInspector};
pub use reassembly::{CryptoReassembly, ExtractionOutcome, ReassemblyLimits};
