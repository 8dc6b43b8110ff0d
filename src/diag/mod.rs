/// 诊断计数器与状态快照
///
/// 计数器默认关闭（debug.diag 打开后启用），读取方接受跨计数器的撕裂视图。
mod benign;
mod bidi;
mod copy;
pub mod http;

pub use benign::{
    context_canceled, deadline_exceeded, enobufs, is_benign_stream_err, is_no_buffer_or_no_mem,
    is_transient_backpressure,
};
pub use bidi::bidi_copy;
pub use copy::{copy_tcp_down, copy_tcp_up, copy_udp_down, copy_udp_up, copy_with_retry};

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

static ENABLED: AtomicBool = AtomicBool::new(false);

pub fn enable(v: bool) {
    ENABLED.store(v, Ordering::Relaxed);
}

pub fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

fn start_time() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

/// 启动时记录的静态配置信息，随快照一起输出
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigInfo {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub interface: String,
    pub dscp: u8,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ipv4_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ipv6_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub listen_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pprof: String,
    pub guard: bool,
    pub conns: usize,
    /// KeyID 是共享密钥的短指纹（可安全展示），用于核对两端密钥一致
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key_id: String,
}

static CONFIG: Mutex<Option<ConfigInfo>> = Mutex::new(None);

pub fn set_config(info: ConfigInfo) {
    if !enabled() {
        return;
    }
    *CONFIG.lock().unwrap() = Some(info);
}

static SESSIONS: AtomicI64 = AtomicI64::new(0);
static STREAMS: AtomicI64 = AtomicI64::new(0);

static RAW_UP_PACKETS: AtomicU64 = AtomicU64::new(0);
static RAW_DOWN_PACKETS: AtomicU64 = AtomicU64::new(0);
static RAW_UP_BYTES: AtomicU64 = AtomicU64::new(0);
static RAW_DOWN_BYTES: AtomicU64 = AtomicU64::new(0);
static RAW_UP_DROPS: AtomicU64 = AtomicU64::new(0);
static RAW_UP_DROP_BYTES: AtomicU64 = AtomicU64::new(0);

// Frames captured but dropped because they exceeded the receive buffer the
// ARQ layer reads into. With GRO/LRO this happens when the kernel coalesces
// segments the tunnel fails to split.
static RAW_DOWN_OVERSIZE_DROPS: AtomicU64 = AtomicU64::new(0);
static RAW_DOWN_OVERSIZE_DROP_BYTES: AtomicU64 = AtomicU64::new(0);

// Coalescing events (GRO/LRO) detected and split into individual guarded
// packets.
static RAW_DOWN_COALESCED_FRAMES: AtomicU64 = AtomicU64::new(0);
static RAW_DOWN_COALESCED_PARTS: AtomicU64 = AtomicU64::new(0);

static GUARD_PASS: AtomicU64 = AtomicU64::new(0);
static GUARD_DROPS: AtomicU64 = AtomicU64::new(0);

static TCP_UP_BYTES: AtomicU64 = AtomicU64::new(0);
static TCP_DOWN_BYTES: AtomicU64 = AtomicU64::new(0);
static UDP_UP_BYTES: AtomicU64 = AtomicU64::new(0);
static UDP_DOWN_BYTES: AtomicU64 = AtomicU64::new(0);

static ENOBUFS_RETRIES: AtomicU64 = AtomicU64::new(0);
static ENOBUFS_SUSTAINED: AtomicU64 = AtomicU64::new(0);

static PING_LAST_AT: AtomicI64 = AtomicI64::new(0);
static PING_LAST_RTT_NS: AtomicI64 = AtomicI64::new(0);
static PING_LAST_ERR: Mutex<String> = Mutex::new(String::new());

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

pub fn inc_sessions() {
    if enabled() {
        SESSIONS.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn dec_sessions() {
    if enabled() {
        SESSIONS.fetch_sub(1, Ordering::Relaxed);
    }
}

pub fn inc_streams() {
    if enabled() {
        STREAMS.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn dec_streams() {
    if enabled() {
        STREAMS.fetch_sub(1, Ordering::Relaxed);
    }
}

pub fn add_raw_up(n: usize) {
    if enabled() && n > 0 {
        RAW_UP_PACKETS.fetch_add(1, Ordering::Relaxed);
        RAW_UP_BYTES.fetch_add(n as u64, Ordering::Relaxed);
    }
}

pub fn add_raw_up_drop(n: usize) {
    if enabled() {
        RAW_UP_DROPS.fetch_add(1, Ordering::Relaxed);
        RAW_UP_DROP_BYTES.fetch_add(n as u64, Ordering::Relaxed);
    }
}

pub fn add_raw_down(n: usize) {
    if enabled() && n > 0 {
        RAW_DOWN_PACKETS.fetch_add(1, Ordering::Relaxed);
        RAW_DOWN_BYTES.fetch_add(n as u64, Ordering::Relaxed);
    }
}

pub fn add_raw_down_oversize_drop(n: usize) {
    if enabled() {
        RAW_DOWN_OVERSIZE_DROPS.fetch_add(1, Ordering::Relaxed);
        RAW_DOWN_OVERSIZE_DROP_BYTES.fetch_add(n as u64, Ordering::Relaxed);
    }
}

pub fn add_raw_down_coalesced(parts: usize) {
    if enabled() {
        RAW_DOWN_COALESCED_FRAMES.fetch_add(1, Ordering::Relaxed);
        RAW_DOWN_COALESCED_PARTS.fetch_add(parts as u64, Ordering::Relaxed);
    }
}

pub fn add_guard_pass() {
    if enabled() {
        GUARD_PASS.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn add_guard_drop() {
    if enabled() {
        GUARD_DROPS.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn add_tcp_up(n: u64) {
    if enabled() {
        TCP_UP_BYTES.fetch_add(n, Ordering::Relaxed);
    }
}

pub fn add_tcp_down(n: u64) {
    if enabled() {
        TCP_DOWN_BYTES.fetch_add(n, Ordering::Relaxed);
    }
}

pub fn add_udp_up(n: u64) {
    if enabled() {
        UDP_UP_BYTES.fetch_add(n, Ordering::Relaxed);
    }
}

pub fn add_udp_down(n: u64) {
    if enabled() {
        UDP_DOWN_BYTES.fetch_add(n, Ordering::Relaxed);
    }
}

pub fn add_enobufs_retry() {
    if enabled() {
        ENOBUFS_RETRIES.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn add_enobufs_sustained() {
    if enabled() {
        ENOBUFS_SUSTAINED.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn set_ping(rtt: Duration, err: Option<&str>) {
    if !enabled() {
        return;
    }
    PING_LAST_AT.store(unix_nanos(), Ordering::Relaxed);
    PING_LAST_RTT_NS.store(rtt.as_nanos() as i64, Ordering::Relaxed);
    *PING_LAST_ERR.lock().unwrap() = err.unwrap_or("").to_string();
}

/// 计数器快照
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub uptime_secs: u64,
    pub version: &'static str,

    pub config: ConfigInfo,

    pub sessions: i64,
    pub streams: i64,

    pub raw_up_packets: u64,
    pub raw_down_packets: u64,
    pub raw_up_bytes: u64,
    pub raw_down_bytes: u64,
    pub raw_up_drops: u64,
    pub raw_up_drop_bytes: u64,

    pub raw_down_oversize_drops: u64,
    pub raw_down_oversize_drop_bytes: u64,

    pub raw_down_coalesced_frames: u64,
    pub raw_down_coalesced_parts: u64,

    pub guard_pass: u64,
    pub guard_drops: u64,

    pub tcp_up_bytes: u64,
    pub tcp_down_bytes: u64,
    pub udp_up_bytes: u64,
    pub udp_down_bytes: u64,

    pub enobufs_retries: u64,
    pub enobufs_sustained: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_last_at_unix_ns: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_last_rtt_ms: Option<f64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ping_last_err: String,
}

pub fn snapshot() -> Status {
    let ping_at = PING_LAST_AT.load(Ordering::Relaxed);
    let ping_rtt = PING_LAST_RTT_NS.load(Ordering::Relaxed);
    Status {
        uptime_secs: start_time().elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        config: CONFIG.lock().unwrap().clone().unwrap_or_default(),
        sessions: SESSIONS.load(Ordering::Relaxed),
        streams: STREAMS.load(Ordering::Relaxed),
        raw_up_packets: RAW_UP_PACKETS.load(Ordering::Relaxed),
        raw_down_packets: RAW_DOWN_PACKETS.load(Ordering::Relaxed),
        raw_up_bytes: RAW_UP_BYTES.load(Ordering::Relaxed),
        raw_down_bytes: RAW_DOWN_BYTES.load(Ordering::Relaxed),
        raw_up_drops: RAW_UP_DROPS.load(Ordering::Relaxed),
        raw_up_drop_bytes: RAW_UP_DROP_BYTES.load(Ordering::Relaxed),
        raw_down_oversize_drops: RAW_DOWN_OVERSIZE_DROPS.load(Ordering::Relaxed),
        raw_down_oversize_drop_bytes: RAW_DOWN_OVERSIZE_DROP_BYTES.load(Ordering::Relaxed),
        raw_down_coalesced_frames: RAW_DOWN_COALESCED_FRAMES.load(Ordering::Relaxed),
        raw_down_coalesced_parts: RAW_DOWN_COALESCED_PARTS.load(Ordering::Relaxed),
        guard_pass: GUARD_PASS.load(Ordering::Relaxed),
        guard_drops: GUARD_DROPS.load(Ordering::Relaxed),
        tcp_up_bytes: TCP_UP_BYTES.load(Ordering::Relaxed),
        tcp_down_bytes: TCP_DOWN_BYTES.load(Ordering::Relaxed),
        udp_up_bytes: UDP_UP_BYTES.load(Ordering::Relaxed),
        udp_down_bytes: UDP_DOWN_BYTES.load(Ordering::Relaxed),
        enobufs_retries: ENOBUFS_RETRIES.load(Ordering::Relaxed),
        enobufs_sustained: ENOBUFS_SUSTAINED.load(Ordering::Relaxed),
        ping_last_at_unix_ns: (ping_at > 0).then_some(ping_at),
        ping_last_rtt_ms: (ping_rtt > 0).then(|| ping_rtt as f64 / 1e6),
        ping_last_err: PING_LAST_ERR.lock().unwrap().clone(),
    }
}

/// 人类可读的状态文本
pub fn format_text(s: &Status) -> String {
    let total_up = s.tcp_up_bytes + s.udp_up_bytes;
    let total_down = s.tcp_down_bytes + s.udp_down_bytes;

    let ping_line = match (s.ping_last_rtt_ms, s.ping_last_err.as_str()) {
        (None, "") => "ping: n/a".to_string(),
        (rtt, err) => format!(
            "ping: rtt={} err={}",
            rtt.map(|ms| format!("{:.1}ms", ms)).unwrap_or_else(|| "n/a".to_string()),
            if err.is_empty() { "-" } else { err }
        ),
    };

    format!(
        "paqet status\n\
         \x20 role: {}\n\
         \x20 uptime: {}s\n\
         \x20 version: {}\n\
         \x20 streams: {}  sessions: {}\n\
         \x20 bytes: up={}  down={}\n\
         \x20   raw: packets up={}  down={}\n\
         \x20   raw: bytes   up={}  down={}\n\
         \x20   raw: drops  packets={} bytes={}\n\
         \x20   raw: coalesced frames={} parts={}\n\
         \x20   raw: oversize drops={} bytes={}\n\
         \x20   guard: pass={}  drops={}\n\
         \x20   tcp: up={}  down={}\n\
         \x20   udp: up={}  down={}\n\
         \x20   enobufs: retries={} sustained={}\n\
         \x20 {}\n\
         \x20 config: iface={} dscp={} ipv4={} ipv6={} server={} listen={} conns={} guard={} key_id={} pprof={}\n",
        s.config.role,
        s.uptime_secs,
        s.version,
        s.streams,
        s.sessions,
        total_up,
        total_down,
        s.raw_up_packets,
        s.raw_down_packets,
        s.raw_up_bytes,
        s.raw_down_bytes,
        s.raw_up_drops,
        s.raw_up_drop_bytes,
        s.raw_down_coalesced_frames,
        s.raw_down_coalesced_parts,
        s.raw_down_oversize_drops,
        s.raw_down_oversize_drop_bytes,
        s.guard_pass,
        s.guard_drops,
        s.tcp_up_bytes,
        s.tcp_down_bytes,
        s.udp_up_bytes,
        s.udp_down_bytes,
        s.enobufs_retries,
        s.enobufs_sustained,
        ping_line,
        s.config.interface,
        s.config.dscp,
        s.config.ipv4_addr,
        s.config.ipv6_addr,
        s.config.server_addr,
        s.config.listen_addr,
        s.config.conns,
        s.config.guard,
        s.config.key_id,
        s.config.pprof,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_noop_when_disabled() {
        enable(false);
        let before = snapshot().guard_drops;
        add_guard_drop();
        add_guard_drop();
        assert_eq!(snapshot().guard_drops, before);
    }

    #[test]
    fn test_counters_accumulate_when_enabled() {
        enable(true);
        let before = snapshot();
        add_raw_up(100);
        add_raw_down(200);
        add_guard_pass();
        let after = snapshot();
        assert!(after.raw_up_packets >= before.raw_up_packets + 1);
        assert!(after.raw_up_bytes >= before.raw_up_bytes + 100);
        assert!(after.raw_down_bytes >= before.raw_down_bytes + 200);
        assert!(after.guard_pass >= before.guard_pass + 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        enable(true);
        let s = snapshot();
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("raw_up_packets"));
        let text = format_text(&s);
        assert!(text.contains("paqet status"));
        assert!(text.contains("guard: pass="));
    }
}
