/// 隧道内传递的目标地址（host:port，host 可以是域名）
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    pub host: String,
    pub port: u16,
}

impl Addr {
    pub fn new(host: String, port: u16) -> Self {
        Addr { host, port }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Addr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            // [v6]:port
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| format!("invalid address '{}'", s))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| format!("invalid address '{}'", s))?;
            (host.to_string(), port)
        } else {
            let (host, port) = s
                .rsplit_once(':')
                .ok_or_else(|| format!("invalid address '{}': missing port", s))?;
            if host.contains(':') {
                return Err(format!("invalid address '{}': IPv6 needs brackets", s));
            }
            (host.to_string(), port)
        };
        if host.is_empty() {
            return Err(format!("invalid address '{}': empty host", s));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port in address '{}'", s))?;
        Ok(Addr::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let a: Addr = "example.com:8080".parse().unwrap();
        assert_eq!(a.host, "example.com");
        assert_eq!(a.port, 8080);
        assert_eq!(a.to_string(), "example.com:8080");
    }

    #[test]
    fn test_parse_ipv6_brackets() {
        let a: Addr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(a.host, "2001:db8::1");
        assert_eq!(a.port, 443);
        assert_eq!(a.to_string(), "[2001:db8::1]:443");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("noport".parse::<Addr>().is_err());
        assert!(":8080".parse::<Addr>().is_err());
        assert!("host:notaport".parse::<Addr>().is_err());
        assert!("2001:db8::1:443".parse::<Addr>().is_err());
    }
}
