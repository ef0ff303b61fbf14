use anyhow::{bail, Result};
use thiserror::Error;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// TLS SNI 提取错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
    #[error("Data too short")]
    DataTooShort,
    #[error("Not ClientHello (handshake type {0:#04x})")]
    NotClientHello(u8),
    #[error("Malformed ClientHello: {0}")]
    Malformed(&'static str),
    #[error("Invalid extension")]
    InvalidExtension,
    #[error("Invalid hostname")]
    InvalidHostname,
}

/// 从 offset 0 开始的 (可能不完整的) 握手字节流的状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientHello {
    /// 还需要更多字节。读到 4 字节握手头之后，
    /// `total` 为完整消息长度 (含头部)
    Incomplete { total: Option<usize> },
    /// 带 `server_name` 的完整 ClientHello
    ServerName(String),
    /// 没有 `server_name` 扩展的完整 ClientHello
    NoServerName,
}

/// 检查 TLS 握手流的开头 (即 QUIC CRYPTO 帧承载的内容，
/// 没有 record 层)
pub fn inspect_client_hello(stream: &[u8]) -> std::result::Result<ClientHello, SniError> {
    if stream.len() < 4 {
        return Ok(ClientHello::Incomplete { total: None });
    }

    // Handshake: [msg_type(1)][length(3)][body...]
    if stream[0] != HANDSHAKE_CLIENT_HELLO {
        return Err(SniError::NotClientHello(stream[0]));
    }
    let body_len = u32::from_be_bytes([0, stream[1], stream[2], stream[3]]) as usize;
    let total = 4 + body_len;
    if stream.len() < total {
        return Ok(ClientHello::Incomplete { total: Some(total) });
    }

    match parse_client_hello_body(&stream[4..total])? {
        Some(host) => Ok(ClientHello::ServerName(host)),
        None => Ok(ClientHello::NoServerName),
    }
}

/// 从 TLS 连接的起始字节中提取 SNI
///
/// 既接受 TLS record (content type 为 `0x16`，即从 TCP 流读到的数据)，
/// 也接受裸的握手消息。完整但没有 SNI 的 ClientHello
/// 返回 `Ok(None)`。
pub fn extract_sni(data: &[u8]) -> Result<Option<String>> {
    let payload: &[u8] = if data.first().copied() == Some(CONTENT_TYPE_HANDSHAKE) {
        // TLS record: [type(1)=0x16][version(2)][len(2)][handshake...]
        if data.len() < 5 {
            bail!(SniError::DataTooShort);
        }
        let length = u16::from_be_bytes([data[3], data[4]]) as usize;
        if data.len() < 5 + length {
            bail!(SniError::DataTooShort);
        }
        &data[5..5 + length]
    } else {
        data
    };

    match inspect_client_hello(payload)? {
        ClientHello::Incomplete { .. } => bail!(SniError::DataTooShort),
        ClientHello::ServerName(host) => Ok(Some(host)),
        ClientHello::NoServerName => Ok(None),
    }
}

/// 遍历 ClientHello 消息体直到 `server_name` 扩展
fn parse_client_hello_body(body: &[u8]) -> std::result::Result<Option<String>, SniError> {
    let mut reader = Reader::new(body);

    reader.skip(2, "legacy_version")?;
    reader.skip(32, "random")?;
    let session_id_len = reader.u8("session_id")? as usize;
    reader.skip(session_id_len, "session_id")?;
    let cipher_suites_len = reader.u16("cipher_suites")? as usize;
    reader.skip(cipher_suites_len, "cipher_suites")?;
    let compression_len = reader.u8("compression_methods")? as usize;
    reader.skip(compression_len, "compression_methods")?;

    // ClientHello 语法中扩展是可选的
    if reader.is_empty() {
        return Ok(None);
    }

    let extensions_len = reader.u16("extensions")? as usize;
    let mut extensions = Reader::new(reader.take(extensions_len, "extensions")?);

    let mut ext_count = 0;
    while !extensions.is_empty() {
        let ext_type = extensions.u16("extension type").map_err(|_| SniError::InvalidExtension)?;
        let ext_len = extensions.u16("extension length").map_err(|_| SniError::InvalidExtension)? as usize;
        let ext_data = extensions
            .take(ext_len, "extension data")
            .map_err(|_| SniError::InvalidExtension)?;
        ext_count += 1;

        if ext_type == EXTENSION_SERVER_NAME {
            tracing::trace!("Found SNI extension (extension #{})", ext_count);
            return parse_sni_extension(ext_data).map(Some);
        }
    }

    tracing::trace!("SNI extension not found (checked {} extensions)", ext_count);
    Ok(None)
}

/// 解码 `server_name` 扩展并返回其中的 `host_name`
fn parse_sni_extension(data: &[u8]) -> std::result::Result<String, SniError> {
    let mut reader = Reader::new(data);
    let list_len = reader.u16("server_name_list").map_err(|_| SniError::InvalidExtension)? as usize;
    let mut list = Reader::new(
        reader
            .take(list_len, "server_name_list")
            .map_err(|_| SniError::InvalidExtension)?,
    );

    while !list.is_empty() {
        let name_type = list.u8("name_type").map_err(|_| SniError::InvalidExtension)?;
        let name_len = list.u16("name length").map_err(|_| SniError::InvalidExtension)? as usize;
        let name = list.take(name_len, "name").map_err(|_| SniError::InvalidExtension)?;

        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }

        let hostname = std::str::from_utf8(name).map_err(|_| SniError::InvalidHostname)?;
        if !is_valid_hostname(hostname) {
            return Err(SniError::InvalidHostname);
        }
        return Ok(hostname.to_string());
    }

    Err(SniError::InvalidExtension)
}

fn is_valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 253 {
        return false;
    }

    hostname
        .bytes()
        .all(|c| c.is_ascii_alphanumeric() || c == b'.' || c == b'-' || c == b'_')
}

/// 带边界检查的大端读取器
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, len: usize, field: &'static str) -> std::result::Result<&'a [u8], SniError> {
        if self.data.len() < len {
            return Err(SniError::Malformed(field));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn skip(&mut self, len: usize, field: &'static str) -> std::result::Result<(), SniError> {
        self.take(len, field).map(|_| ())
    }

    fn u8(&mut self, field: &'static str) -> std::result::Result<u8, SniError> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> std::result::Result<u16, SniError> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}
