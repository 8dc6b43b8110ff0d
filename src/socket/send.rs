/// 出站帧合成与注入
///
/// 把 guard 头 + KCP 报文包装成一个看起来合理的 TCP 段：
/// 按标志序列轮转选择 TCP 标志位，并用计数器伪造递进的
/// seq/ack/时间戳（不维护任何真实 TCP 状态）。
///
/// 注入由独立的 writer 线程完成；ENOBUFS/ENOMEM 在线程内做
/// 有界重试（200µs→20ms 指数退避，总预算 50ms），超预算按
/// 丢包处理并继续（UDP 式丢包语义，上层 ARQ 自行恢复）。
use crate::config::{NetworkConfig, TcpFlags};
use crate::diag;
use crate::pkg::{fingerprint, iterator};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Flags, MutableIpv4Packet};
use pnet::packet::ipv6::MutableIpv6Packet;
use pnet::packet::tcp::{self, MutableTcpPacket, TcpOption};
use pnet::util::MacAddr;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, warn};

const ETHER_HDR_LEN: usize = 14;
const IPV4_HDR_LEN: usize = 20;
const IPV6_HDR_LEN: usize = 40;
const TCP_HDR_LEN: usize = 20;
// SYN: MSS(4) + SACK-permitted(2) + timestamps(10) + NOP(1) + window-scale(3)
const SYN_OPTS_LEN: usize = 20;
// 非 SYN: NOP + NOP + timestamps
const ACK_OPTS_LEN: usize = 12;

const INJECT_MAX_TOTAL_SLEEP: Duration = Duration::from_millis(50);
const INJECT_MAX_BACKOFF: Duration = Duration::from_millis(20);
const INJECT_INITIAL_BACKOFF: Duration = Duration::from_micros(200);

const SEND_QUEUE_DEPTH: usize = 1024;

/// 注入函数：生产环境是 pnet datalink sender，测试里可注入任意桩
pub(crate) type FrameSink = Box<dyn FnMut(&[u8]) -> io::Result<()> + Send>;

struct OutFrame {
    frame: Vec<u8>,
    wire_len: usize,
}

/// 合成帧所需的本端参数
#[derive(Debug, Clone)]
pub struct SendParams {
    pub src_mac: MacAddr,
    pub src_port: u16,
    pub ipv4: Option<(Ipv4Addr, MacAddr)>,
    pub ipv6: Option<(Ipv6Addr, MacAddr)>,
    pub local_flags: Vec<TcpFlags>,
}

impl SendParams {
    pub fn from_config(cfg: &NetworkConfig, src_mac: MacAddr, port: u16) -> io::Result<Self> {
        let ipv4 = match &cfg.ipv4 {
            Some(g) => match g.addr {
                IpAddr::V4(ip) => Some((
                    ip,
                    g.router_mac()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
                )),
                IpAddr::V6(_) => None,
            },
            None => None,
        };
        let ipv6 = match &cfg.ipv6 {
            Some(g) => match g.addr {
                IpAddr::V6(ip) => Some((
                    ip,
                    g.router_mac()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
                )),
                IpAddr::V4(_) => None,
            },
            None => None,
        };
        Ok(SendParams {
            src_mac,
            src_port: port,
            ipv4,
            ipv6,
            local_flags: cfg.tcp.lf.clone(),
        })
    }
}

struct TcpfState {
    global: iterator::Iterator<TcpFlags>,
    client: RwLock<HashMap<u64, Arc<iterator::Iterator<TcpFlags>>>>,
}

pub struct SendHandle {
    params: SendParams,
    base_ms: u32,
    ts_counter: AtomicU32,
    tcpf: TcpfState,
    tx: tokio::sync::mpsc::Sender<OutFrame>,
    fatal: Arc<Mutex<Option<(io::ErrorKind, String)>>>,
}

impl SendHandle {
    pub(crate) fn new(params: SendParams, sink: FrameSink) -> Arc<SendHandle> {
        let (tx, rx) = tokio::sync::mpsc::channel(SEND_QUEUE_DEPTH);
        let fatal = Arc::new(Mutex::new(None));
        let handle = Arc::new(SendHandle {
            tcpf: TcpfState {
                global: iterator::Iterator::new(params.local_flags.clone()),
                client: RwLock::new(HashMap::new()),
            },
            base_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u32)
                .unwrap_or(0),
            ts_counter: AtomicU32::new(0),
            params,
            tx,
            fatal: fatal.clone(),
        });

        std::thread::Builder::new()
            .name("paqet-inject".to_string())
            .spawn(move || writer_loop(rx, sink, fatal))
            .expect("failed to spawn injection thread");

        handle
    }

    /// 合成并入队一帧；prefix 是可选的 guard 头，两段在帧内直接拼接
    pub async fn send(&self, prefix: Option<&[u8]>, payload: &[u8], dst: SocketAddr) -> io::Result<()> {
        if let Some((kind, msg)) = self.fatal.lock().unwrap().clone() {
            return Err(io::Error::new(kind, msg));
        }
        let (frame, wire_len) = self.build_frame(prefix, payload, dst)?;
        self.tx
            .send(OutFrame { frame, wire_len })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "injection handle closed"))
    }

    /// 设置某个客户端的标志序列覆盖
    pub fn set_client_tcpf(&self, addr: SocketAddr, flags: Vec<TcpFlags>) {
        let key = fingerprint::ip_addr(&addr);
        self.tcpf
            .client
            .write()
            .unwrap()
            .insert(key, Arc::new(iterator::Iterator::new(flags)));
    }

    pub fn clear_client_tcpf(&self, addr: SocketAddr) {
        let key = fingerprint::ip_addr(&addr);
        self.tcpf.client.write().unwrap().remove(&key);
    }

    fn next_flags(&self, dst: &SocketAddr) -> TcpFlags {
        let key = fingerprint::ip_addr(dst);
        if let Some(it) = self.tcpf.client.read().unwrap().get(&key) {
            if let Some(f) = it.next() {
                return *f;
            }
        }
        self.tcpf.global.next().copied().unwrap_or(TcpFlags::PSH_ACK)
    }

    /// 合成完整以太帧；返回 (帧, 线上计数字节数)
    pub(crate) fn build_frame(
        &self,
        prefix: Option<&[u8]>,
        payload: &[u8],
        dst: SocketAddr,
    ) -> io::Result<(Vec<u8>, usize)> {
        let flags = self.next_flags(&dst);
        let opts_len = if flags.syn { SYN_OPTS_LEN } else { ACK_OPTS_LEN };
        let tcp_len = TCP_HDR_LEN + opts_len;
        let data_len = prefix.map_or(0, |p| p.len()) + payload.len();

        let counter = self.ts_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let ts_val = self.base_ms.wrapping_add(counter >> 3);
        let (seq, ack, ts_ecr) = if flags.syn {
            let seq = 1 + (counter & 0x7);
            let ack = if flags.ack { seq.wrapping_add(1) } else { 0 };
            (seq, ack, 0)
        } else {
            let seq = self.base_ms.wrapping_add(counter.wrapping_shl(7));
            let ack = seq.wrapping_sub(counter & 0x3FF).wrapping_add(1400);
            (seq, ack, ts_val.wrapping_sub(counter % 200 + 50))
        };

        match dst.ip() {
            IpAddr::V4(dst_ip) => {
                let (src_ip, router) = self.params.ipv4.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no IPv4 address configured")
                })?;
                let total = ETHER_HDR_LEN + IPV4_HDR_LEN + tcp_len + data_len;
                let mut frame = vec![0u8; total];

                {
                    let mut eth = MutableEthernetPacket::new(&mut frame).unwrap();
                    eth.set_destination(router);
                    eth.set_source(self.params.src_mac);
                    eth.set_ethertype(EtherTypes::Ipv4);
                }
                {
                    let mut ip = MutableIpv4Packet::new(&mut frame[ETHER_HDR_LEN..]).unwrap();
                    ip.set_version(4);
                    ip.set_header_length(5);
                    ip.set_dscp(46);
                    ip.set_ecn(0);
                    ip.set_total_length((IPV4_HDR_LEN + tcp_len + data_len) as u16);
                    ip.set_flags(Ipv4Flags::DontFragment);
                    ip.set_ttl(64);
                    ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
                    ip.set_source(src_ip);
                    ip.set_destination(dst_ip);
                    let ck = ipv4::checksum(&ip.to_immutable());
                    ip.set_checksum(ck);
                }
                self.fill_tcp(&mut frame[ETHER_HDR_LEN + IPV4_HDR_LEN..], dst.port(), flags, seq, ack, ts_val, ts_ecr, opts_len, prefix, payload);
                {
                    let mut tcp_pkt = MutableTcpPacket::new(&mut frame[ETHER_HDR_LEN + IPV4_HDR_LEN..]).unwrap();
                    let ck = tcp::ipv4_checksum(&tcp_pkt.to_immutable(), &src_ip, &dst_ip);
                    tcp_pkt.set_checksum(ck);
                }
                Ok((frame, data_len))
            }
            IpAddr::V6(dst_ip) => {
                let (src_ip, router) = self.params.ipv6.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no IPv6 address configured")
                })?;
                let total = ETHER_HDR_LEN + IPV6_HDR_LEN + tcp_len + data_len;
                let mut frame = vec![0u8; total];

                {
                    let mut eth = MutableEthernetPacket::new(&mut frame).unwrap();
                    eth.set_destination(router);
                    eth.set_source(self.params.src_mac);
                    eth.set_ethertype(EtherTypes::Ipv6);
                }
                {
                    let mut ip = MutableIpv6Packet::new(&mut frame[ETHER_HDR_LEN..]).unwrap();
                    ip.set_version(6);
                    ip.set_traffic_class(184);
                    ip.set_payload_length((tcp_len + data_len) as u16);
                    ip.set_next_header(IpNextHeaderProtocols::Tcp);
                    ip.set_hop_limit(64);
                    ip.set_source(src_ip);
                    ip.set_destination(dst_ip);
                }
                self.fill_tcp(&mut frame[ETHER_HDR_LEN + IPV6_HDR_LEN..], dst.port(), flags, seq, ack, ts_val, ts_ecr, opts_len, prefix, payload);
                {
                    let mut tcp_pkt = MutableTcpPacket::new(&mut frame[ETHER_HDR_LEN + IPV6_HDR_LEN..]).unwrap();
                    let ck = tcp::ipv6_checksum(&tcp_pkt.to_immutable(), &src_ip, &dst_ip);
                    tcp_pkt.set_checksum(ck);
                }
                Ok((frame, data_len))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_tcp(
        &self,
        buf: &mut [u8],
        dst_port: u16,
        flags: TcpFlags,
        seq: u32,
        ack: u32,
        ts_val: u32,
        ts_ecr: u32,
        opts_len: usize,
        prefix: Option<&[u8]>,
        payload: &[u8],
    ) {
        // payload lands right after the options; write it first so the
        // checksum pass sees the final bytes
        let data_start = TCP_HDR_LEN + opts_len;
        let mut off = data_start;
        if let Some(p) = prefix {
            buf[off..off + p.len()].copy_from_slice(p);
            off += p.len();
        }
        buf[off..off + payload.len()].copy_from_slice(payload);

        let mut tcp_pkt = MutableTcpPacket::new(buf).unwrap();
        tcp_pkt.set_source(self.params.src_port);
        tcp_pkt.set_destination(dst_port);
        tcp_pkt.set_sequence(seq);
        tcp_pkt.set_acknowledgement(ack);
        tcp_pkt.set_data_offset(((TCP_HDR_LEN + opts_len) / 4) as u8);
        tcp_pkt.set_flags(flags.bits() as u8);
        tcp_pkt.set_window(65535);
        if flags.syn {
            tcp_pkt.set_options(&[
                TcpOption::mss(1460),
                TcpOption::sack_perm(),
                TcpOption::timestamp(ts_val, ts_ecr),
                TcpOption::nop(),
                TcpOption::wscale(8),
            ]);
        } else {
            tcp_pkt.set_options(&[
                TcpOption::nop(),
                TcpOption::nop(),
                TcpOption::timestamp(ts_val, ts_ecr),
            ]);
        }
    }
}

/// writer 线程：排空队列、注入、有界重试
fn writer_loop(
    mut rx: tokio::sync::mpsc::Receiver<OutFrame>,
    mut sink: FrameSink,
    fatal: Arc<Mutex<Option<(io::ErrorKind, String)>>>,
) {
    while let Some(out) = rx.blocking_recv() {
        let mut backoff = INJECT_INITIAL_BACKOFF;
        let mut total_slept = Duration::ZERO;
        loop {
            match sink(&out.frame) {
                Ok(()) => {
                    diag::add_raw_up(out.wire_len);
                    break;
                }
                Err(e) if diag::is_no_buffer_or_no_mem(&e) => {
                    diag::add_enobufs_retry();
                    // Bounded retry to smooth bursts, then drop (as loss) so
                    // the ARQ layer recovers via retransmit.
                    if total_slept >= INJECT_MAX_TOTAL_SLEEP {
                        diag::add_raw_up_drop(out.wire_len);
                        break;
                    }
                    std::thread::sleep(backoff);
                    total_slept += backoff;
                    if backoff < INJECT_MAX_BACKOFF {
                        backoff = (backoff * 2).min(INJECT_MAX_BACKOFF);
                    }
                }
                Err(e) => {
                    error!("packet injection failed fatally: {}", e);
                    *fatal.lock().unwrap() = Some((e.kind(), e.to_string()));
                    return;
                }
            }
        }
    }
    warn!("packet injection queue closed");
}
