/// 地址指纹
///
/// FNV-1a 64，用作流表/覆盖表的 map key，避免在热路径上分配字符串。
use std::net::{IpAddr, SocketAddr};

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(state: u64, bytes: &[u8]) -> u64 {
    let mut h = state;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// (ip, port) 指纹，客户端 TCP 标志覆盖表的 key
pub fn ip_addr(addr: &SocketAddr) -> u64 {
    let mut h = FNV_OFFSET;
    match addr.ip() {
        IpAddr::V4(ip) => h = fnv1a(h, &ip.octets()),
        IpAddr::V6(ip) => h = fnv1a(h, &ip.octets()),
    }
    fnv1a(h, &addr.port().to_be_bytes())
}

/// (local, target) 地址对指纹，UDP 流表的 key
pub fn addr_pair(local: &str, target: &str) -> u64 {
    let h = fnv1a(FNV_OFFSET, local.as_bytes());
    let h = fnv1a(h, &[0]);
    fnv1a(h, target.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_pair_is_stable() {
        let a = addr_pair("1.2.3.4:1000", "8.8.8.8:53");
        let b = addr_pair("1.2.3.4:1000", "8.8.8.8:53");
        assert_eq!(a, b);
    }

    #[test]
    fn test_addr_pair_distinguishes_tuples() {
        let a = addr_pair("1.2.3.4:1000", "8.8.8.8:53");
        let b = addr_pair("1.2.3.4:1001", "8.8.8.8:53");
        let c = addr_pair("1.2.3.4:100", "18.8.8.8:53");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_ip_addr_v4_v6_differ() {
        let v4: SocketAddr = "1.2.3.4:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert_ne!(ip_addr(&v4), ip_addr(&v6));
    }
}
