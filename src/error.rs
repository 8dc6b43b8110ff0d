/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，替代泛型的 anyhow::Error
/// 这样可以让调用者进行更精确的错误处理和恢复
use std::io;
use thiserror::Error;

/// paqet 的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 抓包/注入层错误
    #[error("Packet transport error on {iface}: {msg}")]
    PacketTransport { iface: String, msg: String },

    /// 隧道连接不可用
    #[error("no tunnel connections available")]
    NoTunnelConnections,

    /// 协议错误
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// 连接测试（ping）失败
    #[error("connection test failed: {0}")]
    PingFailed(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// 拨号失败
    #[error("Failed to dial {addr}: {source}")]
    DialFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建协议错误
    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 创建拨号失败错误
    pub fn dial_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::DialFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_creation() {
        let err = TunnelError::config_error("bad port");
        assert!(err.is_config_error());
        assert_eq!(err.to_string(), "Configuration error: bad port");
    }

    #[test]
    fn test_timeout_error() {
        let err = TunnelError::timeout(Duration::from_secs(3));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_io_timeout_is_timeout() {
        let err = TunnelError::Io(io::Error::new(io::ErrorKind::TimedOut, "deadline"));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_no_tunnel_connections_message() {
        assert_eq!(
            TunnelError::NoTunnelConnections.to_string(),
            "no tunnel connections available"
        );
    }
}
