//! QUIC Initial 密钥派生
//!
//! 参考 RFC 9001 Section 5.2 (Initial Secrets)、RFC 8446 Section 7.1
//! (HKDF-Expand-Label) 和 RFC 9369 Section 3.3 (QUIC v2 的 salt 与标签)

use crate::quic::error::{QuicError, Result};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::trace;

/// QUIC Version 1 Initial Salt (RFC 9001 Section 5.2)
pub const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// QUIC Version 2 Initial Salt (RFC 9369 Section 3.3.1)
pub const INITIAL_SALT_V2: [u8; 20] = [
    0x0d, 0xed, 0xe3, 0xde, 0xf7, 0x00, 0xa6, 0xdb, 0x81, 0x93, 0x81, 0xbe, 0x6e, 0x26, 0x9d,
    0xcb, 0xf9, 0xbd, 0x2e, 0xd9,
];

/// AES-128-GCM 密钥长度
pub const KEY_LEN: usize = 16;
/// AEAD IV 长度
pub const IV_LEN: usize = 12;
/// AES-128 头部保护密钥长度
pub const HP_KEY_LEN: usize = 16;

const SECRET_LEN: usize = 32;

/// 支持解除 Initial 包保护的 QUIC 版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuicVersion {
    /// RFC 9000
    V1,
    /// RFC 9369
    V2,
}

impl QuicVersion {
    pub const V1_WIRE: u32 = 0x0000_0001;
    pub const V2_WIRE: u32 = 0x6b33_43cf;

    /// 将线上版本号映射为已知版本，其他版本
    /// (包括版本协商 `0x00000000`) 返回 `None`
    pub fn from_wire(version: u32) -> Option<Self> {
        match version {
            Self::V1_WIRE => Some(QuicVersion::V1),
            Self::V2_WIRE => Some(QuicVersion::V2),
            _ => None,
        }
    }

    pub fn wire(self) -> u32 {
        match self {
            QuicVersion::V1 => Self::V1_WIRE,
            QuicVersion::V2 => Self::V2_WIRE,
        }
    }

    /// 表示 Initial 包的 Long Header 类型位
    pub fn initial_packet_type(self) -> u8 {
        match self {
            QuicVersion::V1 => 0b00,
            QuicVersion::V2 => 0b01,
        }
    }

    fn salt(self) -> &'static [u8; 20] {
        match self {
            QuicVersion::V1 => &INITIAL_SALT_V1,
            QuicVersion::V2 => &INITIAL_SALT_V2,
        }
    }

    fn key_label(self) -> &'static [u8] {
        match self {
            QuicVersion::V1 => b"quic key",
            QuicVersion::V2 => b"quicv2 key",
        }
    }

    fn iv_label(self) -> &'static [u8] {
        match self {
            QuicVersion::V1 => b"quic iv",
            QuicVersion::V2 => b"quicv2 iv",
        }
    }

    fn hp_label(self) -> &'static [u8] {
        match self {
            QuicVersion::V1 => b"quic hp",
            QuicVersion::V2 => b"quicv2 hp",
        }
    }
}

/// 客户端 Initial 包保护密钥
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialKeys {
    /// AEAD 密钥 (AES-128-GCM)
    pub key: [u8; KEY_LEN],
    /// AEAD IV
    pub iv: [u8; IV_LEN],
    /// 头部保护密钥 (AES-128-ECB)
    pub hp_key: [u8; HP_KEY_LEN],
}

/// 根据 `dcid` 派生客户端 Initial 密钥
///
/// ```text
/// initial_secret        = HKDF-Extract(initial_salt, dcid)
/// client_initial_secret = HKDF-Expand-Label(initial_secret, "client in", "", 32)
/// key                   = HKDF-Expand-Label(client_initial_secret, "quic key", "", 16)
/// iv                    = HKDF-Expand-Label(client_initial_secret, "quic iv", "", 12)
/// hp                    = HKDF-Expand-Label(client_initial_secret, "quic hp", "", 16)
/// ```
///
/// v2 使用另一个 salt 和 `quicv2 *` 标签。只派生客户端方向:
/// 过滤器只会看到发往 443 端口的包。
pub fn derive_initial_keys(dcid: &[u8], version: QuicVersion) -> Result<InitialKeys> {
    trace!(
        "Deriving initial keys from DCID: {:02x?} ({} bytes), version: {:?}",
        dcid,
        dcid.len(),
        version
    );

    let initial = Hkdf::<Sha256>::new(Some(&version.salt()[..]), dcid);

    let mut client_secret = [0u8; SECRET_LEN];
    hkdf_expand_label(&initial, b"client in", &mut client_secret)?;

    let client = Hkdf::<Sha256>::from_prk(&client_secret).map_err(|e| {
        QuicError::KeyDerivationFailed(format!("client initial secret: {}", e))
    })?;

    let mut keys = InitialKeys {
        key: [0u8; KEY_LEN],
        iv: [0u8; IV_LEN],
        hp_key: [0u8; HP_KEY_LEN],
    };
    hkdf_expand_label(&client, version.key_label(), &mut keys.key)?;
    hkdf_expand_label(&client, version.iv_label(), &mut keys.iv)?;
    hkdf_expand_label(&client, version.hp_label(), &mut keys.hp_key)?;

    Ok(keys)
}

/// context 为空的 HKDF-Expand-Label，填满 `out`
fn hkdf_expand_label(secret: &Hkdf<Sha256>, label: &[u8], out: &mut [u8]) -> Result<()> {
    let info = HkdfLabel::new(out.len(), label, b"").as_bytes();
    secret.expand(&info, out).map_err(|e| {
        QuicError::KeyDerivationFailed(format!(
            "HKDF-Expand '{}': {}",
            String::from_utf8_lossy(label),
            e
        ))
    })
}

/// HkdfLabel 结构 (RFC 8446 Section 7.1)
///
/// ```text
/// struct {
///     uint16 length = Length;
///     opaque label<7..255> = "tls13 " + Label;
///     opaque context<0..255> = Context;
/// } HkdfLabel;
/// ```
struct HkdfLabel {
    length: u16,
    label: Vec<u8>,
    context: Vec<u8>,
}

impl HkdfLabel {
    fn new(length: usize, label: &[u8], context: &[u8]) -> Self {
        Self {
            length: length as u16,
            label: [b"tls13 ".as_slice(), label].concat(),
            context: context.to_vec(),
        }
    }

    fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.label.len() + self.context.len());
        bytes.extend_from_slice(&self.length.to_be_bytes());
        bytes.push(self.label.len() as u8);
        bytes.extend_from_slice(&self.label);
        bytes.push(self.context.len() as u8);
        bytes.extend_from_slice(&self.context);
        bytes
    }
}
