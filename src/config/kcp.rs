/// KCP 传输与流多路复用配置
use super::Role;
use serde::{Deserialize, Serialize};

/// 模式预设解析出的参数组
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KcpTuning {
    pub nodelay: bool,
    pub interval: i32,
    pub resend: i32,
    pub nocongestion: bool,
    pub wdelay: bool,
    pub acknodelay: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KcpConfig {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub nodelay: i32,
    #[serde(default)]
    pub interval: i32,
    #[serde(default)]
    pub resend: i32,
    #[serde(default)]
    pub nocongestion: i32,
    #[serde(default)]
    pub wdelay: bool,
    #[serde(default)]
    pub acknodelay: bool,

    #[serde(default)]
    pub mtu: usize,
    #[serde(default)]
    pub rcvwnd: u16,
    #[serde(default)]
    pub sndwnd: u16,

    #[serde(default)]
    pub block: String,
    #[serde(default)]
    pub key: String,

    // Guard is a lightweight packet-level filter applied BEFORE the KCP block
    // cipher runs. It prepends a short header and rejects packets that don't
    // match, which cheaply drops junk / DoS traffic hitting the port.
    //
    // Both client and server MUST have identical guard settings.
    #[serde(default)]
    pub guard: Option<bool>,
    #[serde(default)]
    pub guard_magic: String,
    #[serde(default)]
    pub guard_window: u64,
    #[serde(default)]
    pub guard_skew: u32,

    // Defensive server-side limits. Use -1 for unlimited.
    #[serde(default)]
    pub max_sessions: i64,
    #[serde(default)]
    pub max_streams_total: i64,
    #[serde(default)]
    pub max_streams_per_session: i64,

    /// 读取每条流首个协议头的期限（秒），限制挂起客户端占用资源
    #[serde(default)]
    pub header_timeout: u64,

    #[serde(default)]
    pub smuxbuf: usize,
    #[serde(default)]
    pub streambuf: usize,
}

impl KcpConfig {
    pub fn set_defaults(&mut self, role: Role) {
        if self.mode.is_empty() {
            self.mode = "fast2".to_string();
        }
        if self.mtu == 0 {
            self.mtu = 1350;
        }
        if self.rcvwnd == 0 {
            self.rcvwnd = if role == Role::Server { 1024 } else { 512 };
        }
        if self.sndwnd == 0 {
            self.sndwnd = if role == Role::Server { 1024 } else { 512 };
        }
        if self.block.is_empty() {
            self.block = "aes".to_string();
        }

        // Default hardening: enable guard unless explicitly disabled.
        if self.guard.is_none() {
            self.guard = Some(true);
        }
        if self.guard_magic.is_empty() {
            self.guard_magic = "PQT1".to_string();
        }
        if self.guard_window == 0 {
            self.guard_window = 30;
        }
        if self.guard_skew == 0 {
            self.guard_skew = 1;
        }

        if self.header_timeout == 0 {
            self.header_timeout = 10;
        }

        if role == Role::Server {
            if self.max_sessions == 0 {
                self.max_sessions = 1024;
            }
            if self.max_streams_total == 0 {
                self.max_streams_total = 32768;
            }
            if self.max_streams_per_session == 0 {
                self.max_streams_per_session = 4096;
            }
        }

        if self.smuxbuf == 0 {
            self.smuxbuf = 4 * 1024 * 1024;
        }
        if self.streambuf == 0 {
            self.streambuf = 2 * 1024 * 1024;
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        const VALID_MODES: [&str; 5] = ["normal", "fast", "fast2", "fast3", "manual"];
        if !VALID_MODES.contains(&self.mode.as_str()) {
            errors.push(format!("KCP mode must be one of: {:?}", VALID_MODES));
        }

        if self.mtu < 50 || self.mtu > 1500 {
            errors.push("KCP MTU must be between 50-1500 bytes".to_string());
        }
        if self.rcvwnd < 1 {
            errors.push("KCP rcvwnd must be between 1-65535".to_string());
        }
        if self.sndwnd < 1 {
            errors.push("KCP sndwnd must be between 1-65535".to_string());
        }

        const VALID_BLOCKS: [&str; 4] = ["aes", "aes-gcm", "none", "null"];
        if !VALID_BLOCKS.contains(&self.block.as_str()) {
            errors.push(format!("KCP encryption block must be one of: {:?}", VALID_BLOCKS));
        }
        if !matches!(self.block.as_str(), "none" | "null") && self.key.is_empty() {
            errors.push("KCP encryption key is required".to_string());
        }

        if self.guard_enabled() {
            if self.guard_magic.len() != 4 {
                errors.push("KCP guard_magic must be exactly 4 bytes".to_string());
            }
            if self.guard_window < 1 || self.guard_window > 3600 {
                errors.push("KCP guard_window must be between 1-3600 seconds".to_string());
            }
            if self.guard_skew > 10 {
                errors.push("KCP guard_skew must be between 0-10 windows".to_string());
            }
            // We need a secret to compute the guard cookie even if encryption
            // is disabled.
            if self.key.is_empty() {
                errors.push("KCP guard requires a non-empty key".to_string());
            }
        }

        if self.header_timeout < 1 || self.header_timeout > 3600 {
            errors.push("KCP header_timeout must be between 1-3600 seconds".to_string());
        }

        if self.max_sessions < -1 || self.max_sessions > 1_000_000 {
            errors.push("KCP max_sessions must be -1 or between 1-1000000".to_string());
        }
        if self.max_streams_total < -1 || self.max_streams_total > 10_000_000 {
            errors.push("KCP max_streams_total must be -1 or between 1-10000000".to_string());
        }
        if self.max_streams_per_session < -1 || self.max_streams_per_session > 1_000_000 {
            errors.push("KCP max_streams_per_session must be -1 or between 1-1000000".to_string());
        }

        if self.smuxbuf != 0 && self.smuxbuf < 1024 {
            errors.push("KCP smuxbuf must be >= 1024 bytes".to_string());
        }
        if self.streambuf != 0 && self.streambuf < 1024 {
            errors.push("KCP streambuf must be >= 1024 bytes".to_string());
        }

        errors
    }

    pub fn guard_enabled(&self) -> bool {
        self.guard.unwrap_or(false)
    }

    /// 模式预设 → (nodelay, interval, resend, nocongestion, wdelay, acknodelay)
    pub fn tuning(&self) -> KcpTuning {
        match self.mode.as_str() {
            "normal" => KcpTuning {
                nodelay: false,
                interval: 40,
                resend: 2,
                nocongestion: false,
                wdelay: true,
                acknodelay: false,
            },
            "fast" => KcpTuning {
                nodelay: false,
                interval: 30,
                resend: 2,
                nocongestion: false,
                wdelay: true,
                acknodelay: false,
            },
            "fast3" => KcpTuning {
                nodelay: true,
                interval: 10,
                resend: 2,
                nocongestion: true,
                wdelay: false,
                acknodelay: true,
            },
            "manual" => KcpTuning {
                nodelay: self.nodelay != 0,
                interval: self.interval,
                resend: self.resend,
                nocongestion: self.nocongestion != 0,
                wdelay: self.wdelay,
                acknodelay: self.acknodelay,
            },
            // fast2 is also the fallback for unset modes before defaults run
            _ => KcpTuning {
                nodelay: true,
                interval: 20,
                resend: 2,
                nocongestion: false,
                wdelay: false,
                acknodelay: true,
            },
        }
    }
}
