/// 原始包传输
///
/// 对上层（KCP）呈现一个面向数据报的双工通道，底层通过抓包库
/// 在指定接口上注入/捕获 TCP 形状的帧。guard 校验、GRO/LRO
/// 合并帧拆分、超长丢弃都发生在 read_from 内。
mod guard;
mod parse;
mod recv;
mod send;

pub use guard::{GuardState, GUARD_HEADER_LEN};
pub use parse::{parse_ether_ip_tcp, ParsedFrame};
pub use send::{SendHandle, SendParams};

use crate::config::{KcpConfig, NetworkConfig, TcpFlags};
use crate::diag;
use crate::error::TunnelError;
use bytes::{Bytes, BytesMut};
use pnet::datalink::{self, Channel};
use rand::Rng;
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

enum Outbound {
    Link(Arc<SendHandle>),
    Memory(tokio::sync::mpsc::Sender<(Bytes, SocketAddr)>),
}

struct Inbound {
    rx: tokio::sync::mpsc::Receiver<(Bytes, SocketAddr)>,
    // Guarded payload de-coalescing: some NICs/kernels merge multiple small
    // TCP segments into one large frame (GRO/LRO), which would break the ARQ
    // layer (it expects one packet per read_from). read_from drains pending
    // before pulling a new capture.
    pending: VecDeque<Bytes>,
    pending_addr: Option<SocketAddr>,
}

pub struct PacketConn {
    local: SocketAddr,
    guard: Option<Arc<GuardState>>,
    outbound: Outbound,
    inbound: tokio::sync::Mutex<Inbound>,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl PacketConn {
    /// 在指定接口上打开抓包通道并启动注入/捕获线程
    pub fn new(
        cfg: &NetworkConfig,
        port: u16,
        kcp: &KcpConfig,
        parent: &CancellationToken,
    ) -> crate::Result<PacketConn> {
        let port = if port != 0 {
            port
        } else {
            rand::thread_rng().gen_range(32768..=65535)
        };

        let iface = datalink::interfaces()
            .into_iter()
            .find(|i| i.name == cfg.interface)
            .ok_or_else(|| TunnelError::PacketTransport {
                iface: cfg.interface.clone(),
                msg: "interface not found".to_string(),
            })?;
        let src_mac = iface.mac.ok_or_else(|| TunnelError::PacketTransport {
            iface: cfg.interface.clone(),
            msg: "interface has no MAC address".to_string(),
        })?;

        let link_cfg = datalink::Config {
            read_buffer_size: cfg.pcap.sockbuf,
            write_buffer_size: cfg.pcap.sockbuf,
            read_timeout: Some(std::time::Duration::from_millis(cfg.pcap.timeout_ms)),
            promiscuous: cfg.pcap.promisc.unwrap_or(false),
            ..Default::default()
        };
        let (link_tx, link_rx) = match datalink::channel(&iface, link_cfg) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => {
                return Err(TunnelError::PacketTransport {
                    iface: cfg.interface.clone(),
                    msg: "unsupported channel type".to_string(),
                })
            }
            Err(e) => {
                return Err(TunnelError::PacketTransport {
                    iface: cfg.interface.clone(),
                    msg: format!("failed to open capture handle: {}", e),
                })
            }
        };

        let params =
            SendParams::from_config(cfg, src_mac, port).map_err(|e| TunnelError::PacketTransport {
                iface: cfg.interface.clone(),
                msg: e.to_string(),
            })?;
        let mut link_tx = link_tx;
        let send_handle = SendHandle::new(
            params,
            Box::new(move |frame: &[u8]| match link_tx.send_to(frame, None) {
                Some(r) => r,
                None => Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "link-layer send unsupported on this interface",
                )),
            }),
        );

        let cancel = parent.child_token();
        let (in_tx, in_rx) = tokio::sync::mpsc::channel(recv::RECV_QUEUE_DEPTH);
        recv::spawn_capture(link_rx, port, in_tx, cancel.clone());

        let local_ip = cfg.local_ip().unwrap_or(IpAddr::V4([0, 0, 0, 0].into()));
        Ok(PacketConn {
            local: SocketAddr::new(local_ip, port),
            guard: GuardState::new(kcp),
            outbound: Outbound::Link(send_handle),
            inbound: tokio::sync::Mutex::new(Inbound {
                rx: in_rx,
                pending: VecDeque::new(),
                pending_addr: None,
            }),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            cancel,
        })
    }

    /// 纯内存传输：入站直接收 guarded 负载，出站写到对端队列。
    /// 测试与本机基准专用。
    #[doc(hidden)]
    pub fn in_memory(
        local: SocketAddr,
        guard: Option<Arc<GuardState>>,
        incoming: tokio::sync::mpsc::Receiver<(Bytes, SocketAddr)>,
        outgoing: tokio::sync::mpsc::Sender<(Bytes, SocketAddr)>,
        parent: &CancellationToken,
    ) -> PacketConn {
        PacketConn {
            local,
            guard,
            outbound: Outbound::Memory(outgoing),
            inbound: tokio::sync::Mutex::new(Inbound {
                rx: incoming,
                pending: VecDeque::new(),
                pending_addr: None,
            }),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            cancel: parent.child_token(),
        }
    }

    /// 一对交叉相连的内存传输
    #[doc(hidden)]
    pub fn memory_pair(
        kcp: Option<&KcpConfig>,
        a_addr: SocketAddr,
        b_addr: SocketAddr,
        parent: &CancellationToken,
    ) -> (PacketConn, PacketConn) {
        let guard = kcp.and_then(GuardState::new);
        let (a_tx, a_rx) = tokio::sync::mpsc::channel(recv::RECV_QUEUE_DEPTH);
        let (b_tx, b_rx) = tokio::sync::mpsc::channel(recv::RECV_QUEUE_DEPTH);
        let a = PacketConn::in_memory(a_addr, guard.clone(), a_rx, b_tx, parent);
        let b = PacketConn::in_memory(b_addr, guard, b_rx, a_tx, parent);
        (a, b)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn guard_enabled(&self) -> bool {
        self.guard.is_some()
    }

    pub fn set_read_deadline(&self, t: Option<Instant>) {
        *self.read_deadline.lock().unwrap() = t;
    }

    pub fn set_write_deadline(&self, t: Option<Instant>) {
        *self.write_deadline.lock().unwrap() = t;
    }

    pub fn set_deadline(&self, t: Option<Instant>) {
        self.set_read_deadline(t);
        self.set_write_deadline(t);
    }

    pub fn set_client_tcpf(&self, addr: SocketAddr, flags: Vec<TcpFlags>) {
        if let Outbound::Link(sh) = &self.outbound {
            sh.set_client_tcpf(addr, flags);
        }
    }

    pub fn clear_client_tcpf(&self, addr: SocketAddr) {
        if let Outbound::Link(sh) = &self.outbound {
            sh.clear_client_tcpf(addr);
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 读取一个负载到 buf。caller 的 buf 不够大时丢弃该包并继续
    /// （绝不截断，也绝不向 ARQ 层返回可恢复场景下的错误）。
    pub async fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let deadline = *self.read_deadline.lock().unwrap();
        let mut inbound = self.inbound.lock().await;

        loop {
            // Drain pending packets from a previously split coalesced frame
            // before capturing anything new.
            if let Some(seg) = inbound.pending.pop_front() {
                let addr = inbound.pending_addr.unwrap_or(self.local);
                if seg.len() > buf.len() {
                    // Should never happen (the ARQ layer reads into a fixed
                    // MTU-sized buffer); drop rather than error.
                    continue;
                }
                buf[..seg.len()].copy_from_slice(&seg);
                diag::add_raw_down(seg.len() + GUARD_HEADER_LEN);
                return Ok((seg.len(), addr));
            }

            let (payload, addr) = tokio::select! {
                _ = self.cancel.cancelled() => return Err(diag::context_canceled()),
                _ = sleep_until_opt(deadline) => return Err(diag::deadline_exceeded()),
                recv = inbound.rx.recv() => match recv {
                    Some(item) => item,
                    None => {
                        return Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "capture handle closed",
                        ))
                    }
                },
            };

            let mut payload = payload;
            if let Some(g) = &self.guard {
                if payload.len() < GUARD_HEADER_LEN {
                    diag::add_guard_drop();
                    continue;
                }
                let cookies = g.cookies();
                if !g.verify_at(&payload, 0, &cookies) {
                    diag::add_guard_drop();
                    continue;
                }

                // Detect and split GRO/LRO-coalesced payloads: the frame may
                // carry several (guardHeader + kcpPacket) records back-to-back.
                if g.find_next_guard(&payload, GUARD_HEADER_LEN, &cookies).is_some() {
                    let parts = split_coalesced(g, &cookies, &payload);
                    if !parts.is_empty() {
                        diag::add_raw_down_coalesced(parts.len());
                        inbound.pending = parts.into();
                        inbound.pending_addr = Some(addr);
                        continue;
                    }
                }

                diag::add_guard_pass();
                payload = payload.slice(GUARD_HEADER_LEN..);
            }

            if payload.len() > buf.len() {
                let mut raw = payload.len();
                if self.guard.is_some() {
                    raw += GUARD_HEADER_LEN;
                }
                diag::add_raw_down_oversize_drop(raw);
                continue;
            }
            buf[..payload.len()].copy_from_slice(&payload);
            let mut raw = payload.len();
            if self.guard.is_some() {
                raw += GUARD_HEADER_LEN;
            }
            diag::add_raw_down(raw);
            return Ok((payload.len(), addr));
        }
    }

    /// 发送一个负载；guard 打开时自动前置 12 字节头。
    /// 注入层的瞬时失败按丢包处理，调用方总是看到成功。
    pub async fn write_to(&self, data: &[u8], dst: SocketAddr) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(diag::context_canceled());
        }
        let deadline = *self.write_deadline.lock().unwrap();
        let hdr = self.guard.as_ref().map(|g| g.header());
        let wire_len = data.len() + hdr.map_or(0, |h| h.len());

        match &self.outbound {
            Outbound::Link(sh) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(diag::context_canceled()),
                    _ = sleep_until_opt(deadline) => return Err(diag::deadline_exceeded()),
                    r = sh.send(hdr.as_ref().map(|h| &h[..]), data, dst) => r?,
                }
            }
            Outbound::Memory(tx) => {
                let mut b = BytesMut::with_capacity(wire_len);
                if let Some(h) = &hdr {
                    b.extend_from_slice(h);
                }
                b.extend_from_slice(data);
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(diag::context_canceled()),
                    _ = sleep_until_opt(deadline) => return Err(diag::deadline_exceeded()),
                    r = tx.send((b.freeze(), self.local)) => {
                        r.map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer transport closed"))?;
                        diag::add_raw_up(wire_len);
                    }
                }
            }
        }
        Ok(data.len())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(t) => tokio::time::sleep_until(t.into()).await,
        None => std::future::pending().await,
    }
}

/// 把一个合并帧按已验证的 guard 头切成多个负载
fn split_coalesced(g: &GuardState, cookies: &guard::GuardCookies, payload: &Bytes) -> Vec<Bytes> {
    let buf: &[u8] = payload;
    let mut parts = Vec::new();
    let mut pos = 0usize;
    while pos + GUARD_HEADER_LEN <= buf.len() {
        if !g.verify_at(buf, pos, cookies) {
            diag::add_guard_drop();
            pos += 1;
            continue;
        }
        diag::add_guard_pass();
        let start = pos + GUARD_HEADER_LEN;
        let next = g.find_next_guard(buf, start, cookies);
        let end = next.unwrap_or(buf.len());
        if end > start {
            parts.push(payload.slice(start..end));
        }
        match next {
            Some(n) => pos = n,
            None => break,
        }
    }
    parts
}
