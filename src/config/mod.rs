/// 配置加载与验证
///
/// 从单个 YAML 文件加载配置，按 role 填充默认值，
/// 然后逐节验证并汇总所有错误，避免用户反复试错。
mod kcp;
mod network;

pub use kcp::{KcpConfig, KcpTuning};
pub use network::{IpGateway, NetworkConfig, PcapConfig, TcpFlags, TcpProfiles};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

/// 运行角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    None,
}

impl LogLevel {
    /// tracing EnvFilter 指令
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::None => "off",
        }
    }

    /// 当前级别下，给定级别的日志是否会输出
    pub fn allows(&self, emitted: LogLevel) -> bool {
        if matches!(self, LogLevel::None) || matches!(emitted, LogLevel::None) {
            return false;
        }
        (emitted as u8) >= (*self as u8)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
}

/// 调试选项：pprof 风格的 HTTP 绑定地址 + 诊断计数器开关
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugConfig {
    #[serde(default)]
    pub pprof: Option<String>,
    #[serde(default)]
    pub diag: bool,
}

/// 传输层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub conn: usize,
    #[serde(default)]
    pub kcp: KcpConfig,
}

fn default_protocol() -> String {
    "kcp".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            conn: 0,
            kcp: KcpConfig::default(),
        }
    }
}

impl TransportConfig {
    fn set_defaults(&mut self, role: Role) {
        if self.conn == 0 {
            // Default to one capture handle per CPU. Each handle has its own
            // kernel buffer, so more handles means less contention under load.
            self.conn = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .clamp(2, 16);
        }
        self.kcp.set_defaults(role);
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.protocol != "kcp" {
            errors.push(format!(
                "transport protocol must be 'kcp', got '{}'",
                self.protocol
            ));
        }
        if self.conn < 1 || self.conn > 256 {
            errors.push("transport conn must be between 1-256 connections".to_string());
        }
        errors.extend(self.kcp.validate());
        errors
    }
}

/// 客户端的服务器地址
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub addr: String,
}

/// 服务端的监听地址（仅用于日志/诊断展示）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default)]
    pub addr: String,
}

/// 一条端口转发规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRule {
    pub listen: String,
    pub target: String,
}

/// 客户端前端：TCP / UDP 转发监听器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardConfig {
    #[serde(default)]
    pub tcp: Vec<ForwardRule>,
    #[serde(default)]
    pub udp: Vec<ForwardRule>,
}

/// 客户端前端：SOCKS5 监听器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SocksConfig {
    #[serde(default)]
    pub listen: Option<String>,
}

/// 顶层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub role: Role,
    #[serde(default)]
    pub transport: TransportConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub socks: SocksConfig,
    #[serde(default)]
    pub debug: DebugConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// 从 YAML 文件加载、填充默认值并验证
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::load_from_str(&raw)
    }

    pub fn load_from_str(raw: &str) -> Result<Self> {
        let mut cfg: AppConfig =
            serde_yaml::from_str(raw).context("Failed to parse YAML configuration")?;
        cfg.set_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn set_defaults(&mut self) {
        self.transport.set_defaults(self.role);
        self.network.set_defaults(self.role);
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        match self.role {
            Role::Client => {
                if self.server.addr.is_empty() {
                    errors.push("server.addr is required for role 'client'".to_string());
                } else if let Err(e) = self.server_addr() {
                    errors.push(format!("invalid server.addr '{}': {}", self.server.addr, e));
                }
                for rule in self.forward.tcp.iter().chain(self.forward.udp.iter()) {
                    if rule.listen.parse::<SocketAddr>().is_err() {
                        errors.push(format!("invalid forward listen address '{}'", rule.listen));
                    }
                    if rule.target.is_empty() {
                        errors.push("forward target address is required".to_string());
                    }
                }
                if let Some(listen) = &self.socks.listen {
                    if listen.parse::<SocketAddr>().is_err() {
                        errors.push(format!("invalid socks listen address '{}'", listen));
                    }
                }
            }
            Role::Server => {
                if self.network.port == 0 {
                    errors.push(
                        "server network.port cannot be 0 (a fixed listen port is required)"
                            .to_string(),
                    );
                }
            }
        }

        if let Some(pprof) = &self.debug.pprof {
            match pprof.parse::<SocketAddr>() {
                Ok(addr) if !addr.ip().is_loopback() => {
                    errors.push(format!(
                        "debug.pprof must bind a loopback address, got '{}'",
                        pprof
                    ));
                }
                Ok(_) => {}
                Err(e) => errors.push(format!("invalid debug.pprof address '{}': {}", pprof, e)),
            }
        }
        if self.debug.diag && self.debug.pprof.is_none() {
            errors.push("debug.diag requires debug.pprof to be set (loopback only)".to_string());
        }

        errors.extend(self.transport.validate());
        errors.extend(self.network.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("invalid configuration:\n  - {}", errors.join("\n  - "))
        }
    }

    /// 解析客户端的服务器地址
    pub fn server_addr(&self) -> Result<SocketAddr> {
        let addr = self
            .server
            .addr
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve '{}'", self.server.addr))?
            .next()
            .context("address resolved to nothing")?;
        if addr.port() == 0 {
            anyhow::bail!("server port must be between 1-65535");
        }
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_YAML: &str = r#"
role: client
server:
  addr: "203.0.113.7:9000"
network:
  interface: eth0
  port: 18000
  ipv4:
    addr: 192.0.2.10
    router: "aa:bb:cc:dd:ee:ff"
transport:
  protocol: kcp
  conn: 2
  kcp:
    key: secret
forward:
  tcp:
    - listen: "127.0.0.1:8080"
      target: "10.0.0.1:80"
log:
  level: debug
"#;

    #[test]
    fn test_load_client_config() {
        let cfg = AppConfig::load_from_str(CLIENT_YAML).unwrap();
        assert_eq!(cfg.role, Role::Client);
        assert_eq!(cfg.transport.conn, 2);
        assert_eq!(cfg.server_addr().unwrap().port(), 9000);
        assert_eq!(cfg.log.level, LogLevel::Debug);
        // defaults filled in
        assert_eq!(cfg.transport.kcp.mode, "fast2");
        assert_eq!(cfg.transport.kcp.mtu, 1350);
        assert!(cfg.transport.kcp.guard_enabled());
    }

    #[test]
    fn test_client_requires_server_addr() {
        let yaml = CLIENT_YAML.replace("  addr: \"203.0.113.7:9000\"", "  addr: \"\"");
        let err = AppConfig::load_from_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("server.addr is required"));
    }

    #[test]
    fn test_server_requires_port() {
        let yaml = r#"
role: server
network:
  interface: eth0
  ipv4:
    addr: 192.0.2.1
    router: "aa:bb:cc:dd:ee:ff"
transport:
  kcp:
    key: secret
"#;
        let err = AppConfig::load_from_str(yaml).unwrap_err();
        assert!(err.to_string().contains("network.port cannot be 0"));
    }

    #[test]
    fn test_diag_requires_pprof() {
        let yaml = CLIENT_YAML.to_string() + "debug:\n  diag: true\n";
        let err = AppConfig::load_from_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("requires debug.pprof"));
    }

    #[test]
    fn test_pprof_must_be_loopback() {
        let yaml = CLIENT_YAML.to_string() + "debug:\n  diag: true\n  pprof: \"0.0.0.0:6060\"\n";
        let err = AppConfig::load_from_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("loopback"));
    }

    #[test]
    fn test_log_level_allows() {
        assert!(LogLevel::Info.allows(LogLevel::Warn));
        assert!(!LogLevel::Info.allows(LogLevel::Debug));
        assert!(!LogLevel::None.allows(LogLevel::Error));
        assert_eq!(LogLevel::None.as_filter(), "off");
    }

    #[test]
    fn test_conn_defaults_clamped() {
        let yaml = CLIENT_YAML.replace("  conn: 2\n", "");
        let cfg = AppConfig::load_from_str(&yaml).unwrap();
        assert!(cfg.transport.conn >= 2 && cfg.transport.conn <= 16);
    }
}
