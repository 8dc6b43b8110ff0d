/// 入站帧解析
///
/// 手写偏移解析 Ethernet / IPv4 / IPv6 / TCP，热路径零拷贝、零分配。
/// 支持一层 802.1Q/QinQ 标签；IPv6 仅跳过常见扩展头，
/// 遇到无法识别的扩展链直接放弃该帧。
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const ETHER_HDR_LEN: usize = 14;
const ETH_IPV4: u16 = 0x0800;
const ETH_IPV6: u16 = 0x86DD;
const ETH_VLAN: u16 = 0x8100;
const ETH_QINQ: u16 = 0x88A8;
const IP_PROTO_TCP: u8 = 6;
const IPV4_MIN_HDR: usize = 20;
const IPV6_HDR_LEN: usize = 40;
const TCP_MIN_HDR_LEN: usize = 20;

/// 解析结果：源地址、目的端口、TCP 负载（借用自输入帧）
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedFrame<'a> {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

pub fn parse_ether_ip_tcp(frame: &[u8]) -> Option<ParsedFrame<'_>> {
    if frame.len() < ETHER_HDR_LEN {
        return None;
    }
    let mut off = ETHER_HDR_LEN;
    let mut ether_type = be16(&frame[12..14]);
    if ether_type == ETH_VLAN || ether_type == ETH_QINQ {
        // VLAN tag: TCI(2) + encapsulated ethertype(2)
        if frame.len() < ETHER_HDR_LEN + 4 {
            return None;
        }
        ether_type = be16(&frame[16..18]);
        off += 4;
    }

    match ether_type {
        ETH_IPV4 => {
            if frame.len() < off + IPV4_MIN_HDR {
                return None;
            }
            let ihl = ((frame[off] & 0x0F) as usize) * 4;
            if ihl < IPV4_MIN_HDR || frame.len() < off + ihl {
                return None;
            }
            if frame[off + 9] != IP_PROTO_TCP {
                return None;
            }
            let src: [u8; 4] = frame[off + 12..off + 16].try_into().ok()?;
            let tcp_off = off + ihl;
            parse_tcp(frame, tcp_off, IpAddr::V4(Ipv4Addr::from(src)))
        }

        ETH_IPV6 => {
            if frame.len() < off + IPV6_HDR_LEN {
                return None;
            }
            let mut next = frame[off + 6];
            let src: [u8; 16] = frame[off + 8..off + 24].try_into().ok()?;
            let mut tcp_off = off + IPV6_HDR_LEN;

            // Best-effort skip over the common extension headers.
            loop {
                match next {
                    IP_PROTO_TCP => {
                        return parse_tcp(frame, tcp_off, IpAddr::V6(Ipv6Addr::from(src)));
                    }

                    // Hop-by-Hop (0), Routing (43), Destination Options (60)
                    0 | 43 | 60 => {
                        if frame.len() < tcp_off + 2 {
                            return None;
                        }
                        let ext_next = frame[tcp_off];
                        let ext_len = (frame[tcp_off + 1] as usize + 1) * 8;
                        if frame.len() < tcp_off + ext_len {
                            return None;
                        }
                        next = ext_next;
                        tcp_off += ext_len;
                    }

                    // Fragment (44) is always 8 bytes.
                    44 => {
                        if frame.len() < tcp_off + 8 {
                            return None;
                        }
                        next = frame[tcp_off];
                        tcp_off += 8;
                    }

                    // AH (51): length in 4-byte units, not counting the first 2.
                    51 => {
                        if frame.len() < tcp_off + 2 {
                            return None;
                        }
                        let ext_next = frame[tcp_off];
                        let ext_len = (frame[tcp_off + 1] as usize + 2) * 4;
                        if frame.len() < tcp_off + ext_len {
                            return None;
                        }
                        next = ext_next;
                        tcp_off += ext_len;
                    }

                    _ => return None,
                }
            }
        }

        _ => None,
    }
}

fn parse_tcp(frame: &[u8], tcp_off: usize, src_ip: IpAddr) -> Option<ParsedFrame<'_>> {
    if frame.len() < tcp_off + TCP_MIN_HDR_LEN {
        return None;
    }
    let data_off = ((frame[tcp_off + 12] >> 4) as usize) * 4;
    if data_off < TCP_MIN_HDR_LEN || frame.len() < tcp_off + data_off {
        return None;
    }
    Some(ParsedFrame {
        src_ip,
        src_port: be16(&frame[tcp_off..tcp_off + 2]),
        dst_port: be16(&frame[tcp_off + 2..tcp_off + 4]),
        payload: &frame[tcp_off + data_off..],
    })
}
