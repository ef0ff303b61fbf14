//! TLS ClientHello 解析
pub mod sni;

pub use sni::{extract_sni, inspect_client_hello, ClientHello, SniError};
