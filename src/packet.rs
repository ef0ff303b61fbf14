//! 隧道数据包与 IP 层分类
//!
//! 只读取确定流和定位传输层 payload 所需的头部，
//! 不校验 checksum。

use bytes::Bytes;
use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use std::fmt;
use std::net::IpAddr;
use std::ops::Range;

/// 检查 QUIC Initial 包的 UDP 目的端口
pub const QUIC_PORT: u16 = 443;

const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;

/// 从隧道读出的 IP 包
///
/// 过滤器原样交回数据包；缓存后未能交回的包
/// (空闲淘汰、关闭) 通过 [`dispose`] 释放。
///
/// [`dispose`]: TunnelPacket::dispose
pub trait TunnelPacket: Send {
    /// 原始 IP 包字节
    fn data(&self) -> &[u8];

    /// 释放不会再被路由的包
    fn dispose(self) -> anyhow::Result<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

impl TunnelPacket for Vec<u8> {
    fn data(&self) -> &[u8] {
        self
    }
}

impl TunnelPacket for Bytes {
    fn data(&self) -> &[u8] {
        self
    }
}

/// 传输层连接的一个方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.src, self.dst) {
            (IpAddr::V6(src), IpAddr::V6(dst)) => write!(
                f,
                "[{}]:{} -> [{}]:{}",
                src, self.src_port, dst, self.dst_port
            ),
            (src, dst) => write!(f, "{}:{} -> {}:{}", src, self.src_port, dst, self.dst_port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// 过滤器需要的 IP 包信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMeta {
    pub key: FlowKey,
    pub transport: Transport,
    /// 传输层 payload 在 IP 包中的范围
    pub payload: Range<usize>,
}

impl PacketMeta {
    /// 发往 443 端口的 UDP
    pub fn is_quic_candidate(&self) -> bool {
        self.transport == Transport::Udp && self.key.dst_port == QUIC_PORT
    }
}

/// 对原始 IPv4/IPv6 包分类
///
/// 不是完整、未分片的 UDP 或 TCP 包时返回 `None`:
/// 包括其他协议、IPv4 分片、IPv6 扩展头和截断的输入。
pub fn classify(packet: &[u8]) -> Option<PacketMeta> {
    match packet.first()? >> 4 {
        4 => classify_ipv4(packet),
        6 => classify_ipv6(packet),
        _ => None,
    }
}

fn classify_ipv4(packet: &[u8]) -> Option<PacketMeta> {
    let ip = Ipv4Packet::new_checked(packet).ok()?;
    if ip.more_frags() || ip.frag_offset() != 0 {
        return None;
    }
    let start = usize::from(ip.header_len());
    let end = usize::from(ip.total_len());
    classify_transport(
        packet,
        IpAddr::from(ip.src_addr().0),
        IpAddr::from(ip.dst_addr().0),
        ip.next_header(),
        start..end,
    )
}

fn classify_ipv6(packet: &[u8]) -> Option<PacketMeta> {
    let ip = Ipv6Packet::new_checked(packet).ok()?;
    let end = IPV6_HEADER_LEN + usize::from(ip.payload_len());
    classify_transport(
        packet,
        IpAddr::from(ip.src_addr().0),
        IpAddr::from(ip.dst_addr().0),
        ip.next_header(),
        IPV6_HEADER_LEN..end,
    )
}

fn classify_transport(
    packet: &[u8],
    src: IpAddr,
    dst: IpAddr,
    protocol: IpProtocol,
    ip_payload: Range<usize>,
) -> Option<PacketMeta> {
    let segment = packet.get(ip_payload.clone())?;
    match protocol {
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(segment).ok()?;
            let payload_end = ip_payload.start + usize::from(udp.len());
            Some(PacketMeta {
                key: FlowKey {
                    src,
                    dst,
                    src_port: udp.src_port(),
                    dst_port: udp.dst_port(),
                },
                transport: Transport::Udp,
                payload: ip_payload.start + UDP_HEADER_LEN..payload_end,
            })
        }
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(segment).ok()?;
            Some(PacketMeta {
                key: FlowKey {
                    src,
                    dst,
                    src_port: tcp.src_port(),
                    dst_port: tcp.dst_port(),
                },
                transport: Transport::Tcp,
                payload: ip_payload.start + usize::from(tcp.header_len())..ip_payload.end,
            })
        }
        _ => None,
    }
}

/// 单元测试共用的原始包构造函数
#[cfg(test)]
pub(crate) mod testing {
    use std::net::{Ipv4Addr, Ipv6Addr};

    pub fn ipv4_udp(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let mut udp = Vec::with_capacity(8 + payload.len());
        udp.extend_from_slice(&sport.to_be_bytes());
        udp.extend_from_slice(&dport.to_be_bytes());
        udp.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        udp.extend_from_slice(&[0, 0]);
        udp.extend_from_slice(payload);
        ipv4(src, dst, 17, &udp)
    }

    pub fn ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> Vec<u8> {
        let total = 20 + segment.len();
        let mut packet = vec![0x45, 0x00];
        packet.extend_from_slice(&(total as u16).to_be_bytes());
        packet.extend_from_slice(&[0x00, 0x01, 0x40, 0x00]); // id, DF
        packet.extend_from_slice(&[64, protocol, 0, 0]);
        packet.extend_from_slice(&src.octets());
        packet.extend_from_slice(&dst.octets());
        packet.extend_from_slice(segment);
        packet
    }

    pub fn ipv6_udp(src: Ipv6Addr, dst: Ipv6Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let udp_len = 8 + payload.len();
        let mut packet = vec![0x60, 0, 0, 0];
        packet.extend_from_slice(&(udp_len as u16).to_be_bytes());
        packet.extend_from_slice(&[17, 64]);
        packet.extend_from_slice(&src.octets());
        packet.extend_from_slice(&dst.octets());
        packet.extend_from_slice(&sport.to_be_bytes());
        packet.extend_from_slice(&dport.to_be_bytes());
        packet.extend_from_slice(&(udp_len as u16).to_be_bytes());
        packet.extend_from_slice(&[0, 0]);
        packet.extend_from_slice(payload);
        packet
    }

    pub fn ipv4_tcp(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let mut tcp = Vec::with_capacity(20 + payload.len());
        tcp.extend_from_slice(&sport.to_be_bytes());
        tcp.extend_from_slice(&dport.to_be_bytes());
        tcp.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0]); // seq, ack
        tcp.extend_from_slice(&[0x50, 0x18, 0xff, 0xff, 0, 0, 0, 0]); // data offset 5, PSH|ACK
        tcp.extend_from_slice(payload);
        ipv4(src, dst, 6, &tcp)
    }
}
