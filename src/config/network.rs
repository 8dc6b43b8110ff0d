/// 网络层配置：接口、地址、下一跳 MAC、TCP 标志序列、抓包参数
use super::Role;
use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;

/// 合成帧使用的 TCP 标志位集合
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpFlags {
    #[serde(default)]
    pub fin: bool,
    #[serde(default)]
    pub syn: bool,
    #[serde(default)]
    pub rst: bool,
    #[serde(default)]
    pub psh: bool,
    #[serde(default)]
    pub ack: bool,
    #[serde(default)]
    pub urg: bool,
    #[serde(default)]
    pub ece: bool,
    #[serde(default)]
    pub cwr: bool,
    #[serde(default)]
    pub ns: bool,
}

impl TcpFlags {
    pub const PSH_ACK: TcpFlags = TcpFlags {
        fin: false,
        syn: false,
        rst: false,
        psh: true,
        ack: true,
        urg: false,
        ece: false,
        cwr: false,
        ns: false,
    };

    pub const ACK: TcpFlags = TcpFlags {
        fin: false,
        syn: false,
        rst: false,
        psh: false,
        ack: true,
        urg: false,
        ece: false,
        cwr: false,
        ns: false,
    };

    /// 线上表示：FIN=0x01 SYN=0x02 RST=0x04 PSH=0x08 ACK=0x10 URG=0x20 ECE=0x40 CWR=0x80 NS=0x100
    pub fn bits(&self) -> u16 {
        let mut bits = 0u16;
        if self.fin {
            bits |= 0x01;
        }
        if self.syn {
            bits |= 0x02;
        }
        if self.rst {
            bits |= 0x04;
        }
        if self.psh {
            bits |= 0x08;
        }
        if self.ack {
            bits |= 0x10;
        }
        if self.urg {
            bits |= 0x20;
        }
        if self.ece {
            bits |= 0x40;
        }
        if self.cwr {
            bits |= 0x80;
        }
        if self.ns {
            bits |= 0x100;
        }
        bits
    }

    pub fn from_bits(bits: u16) -> Self {
        TcpFlags {
            fin: bits & 0x01 != 0,
            syn: bits & 0x02 != 0,
            rst: bits & 0x04 != 0,
            psh: bits & 0x08 != 0,
            ack: bits & 0x10 != 0,
            urg: bits & 0x20 != 0,
            ece: bits & 0x40 != 0,
            cwr: bits & 0x80 != 0,
            ns: bits & 0x100 != 0,
        }
    }
}

/// rf = 期望对端使用的标志序列（通过 TCPF 帧发送给对端）
/// lf = 本端合成帧使用的标志序列
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcpProfiles {
    #[serde(default)]
    pub rf: Vec<TcpFlags>,
    #[serde(default)]
    pub lf: Vec<TcpFlags>,
}

/// 一个地址族的本端地址 + 下一跳（网关）MAC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpGateway {
    pub addr: IpAddr,
    pub router: String,
}

impl IpGateway {
    pub fn router_mac(&self) -> Result<MacAddr, String> {
        MacAddr::from_str(&self.router)
            .map_err(|_| format!("invalid router MAC address '{}'", self.router))
    }
}

/// 抓包参数
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PcapConfig {
    #[serde(default)]
    pub sockbuf: usize,
    #[serde(default)]
    pub snaplen: usize,
    #[serde(default)]
    pub promisc: Option<bool>,
    #[serde(default)]
    pub immediate: Option<bool>,
    #[serde(default)]
    pub timeout_ms: u64,
}

impl PcapConfig {
    fn set_defaults(&mut self, role: Role) {
        if self.sockbuf == 0 {
            self.sockbuf = if role == Role::Server {
                64 * 1024 * 1024
            } else {
                4 * 1024 * 1024
            };
        }
        if self.snaplen == 0 {
            self.snaplen = 65535;
        }
        if self.promisc.is_none() {
            self.promisc = Some(false);
        }
        if self.immediate.is_none() {
            self.immediate = Some(true);
        }
        if self.timeout_ms == 0 {
            self.timeout_ms = 100;
        }
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.sockbuf < 1024 {
            errors.push("pcap sockbuf must be >= 1024 bytes".to_string());
        }
        if self.sockbuf > 256 * 1024 * 1024 {
            errors.push("pcap sockbuf too large (max 256MB)".to_string());
        }
        if self.snaplen < 64 || self.snaplen > 65535 {
            errors.push("pcap snaplen must be between 64-65535".to_string());
        }
        if self.timeout_ms > 60000 {
            errors.push("pcap timeout_ms must be between 0-60000".to_string());
        }
        errors
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub interface: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub ipv4: Option<IpGateway>,
    #[serde(default)]
    pub ipv6: Option<IpGateway>,
    #[serde(default)]
    pub tcp: TcpProfiles,
    #[serde(default)]
    pub pcap: PcapConfig,
}

impl NetworkConfig {
    pub fn set_defaults(&mut self, role: Role) {
        if self.tcp.lf.is_empty() {
            self.tcp.lf = vec![TcpFlags::PSH_ACK, TcpFlags::ACK];
        }
        self.pcap.set_defaults(role);
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.interface.is_empty() {
            errors.push("network.interface is required".to_string());
        }

        if self.ipv4.is_none() && self.ipv6.is_none() {
            errors.push("at least one of network.ipv4 / network.ipv6 is required".to_string());
        }
        if let Some(v4) = &self.ipv4 {
            if !v4.addr.is_ipv4() {
                errors.push(format!("network.ipv4.addr '{}' is not an IPv4 address", v4.addr));
            }
            if let Err(e) = v4.router_mac() {
                errors.push(format!("network.ipv4: {}", e));
            }
        }
        if let Some(v6) = &self.ipv6 {
            if !v6.addr.is_ipv6() {
                errors.push(format!("network.ipv6.addr '{}' is not an IPv6 address", v6.addr));
            }
            if let Err(e) = v6.router_mac() {
                errors.push(format!("network.ipv6: {}", e));
            }
        }

        if self.tcp.rf.len() > 255 || self.tcp.lf.len() > 255 {
            errors.push("network.tcp flag profiles are limited to 255 entries".to_string());
        }

        errors.extend(self.pcap.validate());
        errors
    }

    /// 本端 IP（优先 IPv4），用于合成帧源地址与日志
    pub fn local_ip(&self) -> Option<IpAddr> {
        self.ipv4
            .as_ref()
            .map(|g| g.addr)
            .or_else(|| self.ipv6.as_ref().map(|g| g.addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> NetworkConfig {
        let mut n = NetworkConfig {
            interface: "eth0".to_string(),
            port: 9000,
            ipv4: Some(IpGateway {
                addr: "192.0.2.1".parse().unwrap(),
                router: "02:00:00:00:00:01".to_string(),
            }),
            ipv6: None,
            tcp: TcpProfiles::default(),
            pcap: PcapConfig::default(),
        };
        n.set_defaults(Role::Client);
        n
    }

    #[test]
    fn test_defaults() {
        let n = base();
        assert_eq!(n.pcap.sockbuf, 4 * 1024 * 1024);
        assert_eq!(n.pcap.snaplen, 65535);
        assert_eq!(n.pcap.promisc, Some(false));
        assert_eq!(n.pcap.immediate, Some(true));
        assert_eq!(n.tcp.lf, vec![TcpFlags::PSH_ACK, TcpFlags::ACK]);
        assert!(n.validate().is_empty());
    }

    #[test]
    fn test_requires_address_family() {
        let mut n = base();
        n.ipv4 = None;
        assert!(n.validate().iter().any(|e| e.contains("ipv4 / network.ipv6")));
    }

    #[test]
    fn test_rejects_bad_router_mac() {
        let mut n = base();
        n.ipv4.as_mut().unwrap().router = "not-a-mac".to_string();
        assert!(n.validate().iter().any(|e| e.contains("router MAC")));
    }

    #[test]
    fn test_flag_bits_round_trip() {
        let all = TcpFlags {
            fin: true,
            syn: true,
            rst: true,
            psh: true,
            ack: true,
            urg: true,
            ece: true,
            cwr: true,
            ns: true,
        };
        assert_eq!(all.bits(), 0x1FF);
        assert_eq!(TcpFlags::from_bits(all.bits()), all);
        assert_eq!(TcpFlags::from_bits(TcpFlags::PSH_ACK.bits()), TcpFlags::PSH_ACK);
        assert_eq!(TcpFlags::default().bits(), 0);
    }
}
