/// 可靠通道：KCP 会话 + yamux 多路复用
///
/// 一个 driver 任务独占 yamux Connection，同时处理入站流接收与
/// 出站流打开请求（经 command channel 转交）。
use super::session::{KcpSession, SessionInput};
use crate::config::{KcpConfig, TcpFlags};
use crate::protocol::{Proto, PPING, PPONG};
use crate::socket::PacketConn;
use crate::tnet::crypto::BlockCipher;
use crate::tnet::Strm;
use crate::TunnelError;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 默认连通性验证超时
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// ARQ 层读缓冲，与典型以太 MTU 对齐
pub(crate) const MTU_LIMIT: usize = 1500;

type OpenRequest = oneshot::Sender<Result<yamux::Stream, String>>;

pub struct Channel {
    pconn: Arc<PacketConn>,
    own_packet_conn: AtomicBool,
    peer: SocketAddr,
    open_tx: mpsc::Sender<OpenRequest>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<yamux::Stream>>,
    sid: AtomicU64,
    session_closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Channel {
    /// 在给定的包传输上建立一条通道。own_packet_conn 决定 close 时
    /// 是否级联关闭 PacketConn（端口回退拨号时需要保留复用）。
    pub(crate) fn new(
        pconn: Arc<PacketConn>,
        peer: SocketAddr,
        cfg: &KcpConfig,
        cipher: Arc<BlockCipher>,
        mode: yamux::Mode,
        own_packet_conn: bool,
        parent: &CancellationToken,
    ) -> (Channel, SessionInput) {
        let cancel = parent.child_token();

        // KCP 报文经块加密后落到包传输；MTU 给加密开销留位
        let kcp_mtu = cfg.mtu.saturating_sub(cipher.overhead()).max(64);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<bytes::Bytes>();
        let (session, input) = KcpSession::new(cfg, kcp_mtu, out_tx);
        let session_closed = session.closed_flag();

        // wire pump：明文 KCP 报文 → 加密 → 注入
        {
            let pconn = pconn.clone();
            let cipher = cipher.clone();
            let cancel = cancel.clone();
            let closed = session_closed.clone();
            tokio::spawn(async move {
                loop {
                    let pkt = tokio::select! {
                        _ = cancel.cancelled() => break,
                        p = out_rx.recv() => match p {
                            Some(p) => p,
                            None => break,
                        },
                    };
                    let sealed = cipher.seal(&pkt);
                    if pconn.write_to(&sealed, peer).await.is_err() {
                        closed.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            });
        }

        let mut mux_cfg = yamux::Config::default();
        mux_cfg.set_max_connection_receive_window(Some(cfg.smuxbuf));
        let connection = yamux::Connection::new(session, mux_cfg, mode);

        let (open_tx, open_rx) = mpsc::channel::<OpenRequest>(64);
        let (accept_tx, accept_rx) = mpsc::channel::<yamux::Stream>(256);
        tokio::spawn(mux_driver(connection, open_rx, accept_tx, cancel.clone()));

        let channel = Channel {
            pconn,
            own_packet_conn: AtomicBool::new(own_packet_conn),
            peer,
            open_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            sid: AtomicU64::new(0),
            session_closed,
            cancel,
        };
        (channel, input)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.pconn.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.session_closed.load(Ordering::Relaxed)
    }

    pub fn set_own_packet_conn(&self, own: bool) {
        self.own_packet_conn.store(own, Ordering::Relaxed);
    }

    pub fn set_client_tcpf(&self, addr: SocketAddr, flags: Vec<TcpFlags>) {
        self.pconn.set_client_tcpf(addr, flags);
    }

    pub fn clear_client_tcpf(&self, addr: SocketAddr) {
        self.pconn.clear_client_tcpf(addr);
    }

    fn next_sid(&self) -> u64 {
        self.sid.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn open_stream(&self) -> io::Result<Strm> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        let (tx, rx) = oneshot::channel();
        self.open_tx
            .send(tx)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel driver gone"))?;
        let stream = rx
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "open cancelled"))?
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionReset, e))?;
        Ok(Strm::new(stream, self.next_sid(), self.peer))
    }

    pub async fn accept_stream(&self) -> io::Result<Strm> {
        let mut rx = self.accept_rx.lock().await;
        match rx.recv().await {
            Some(stream) => Ok(Strm::new(stream, self.next_sid(), self.peer)),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed")),
        }
    }

    /// 打开一条流做 PING/PONG 连通性验证
    pub async fn ping(&self, wait: bool) -> crate::Result<()> {
        self.ping_with_timeout(wait, PING_TIMEOUT).await
    }

    pub async fn ping_with_timeout(&self, wait: bool, timeout: Duration) -> crate::Result<()> {
        let mut strm = self
            .open_stream()
            .await
            .map_err(|e| TunnelError::PingFailed(e.to_string()))?;
        if !wait {
            return Ok(());
        }
        tokio::time::timeout(timeout, async {
            Proto::new(PPING).write_to(&mut strm).await?;
            let p = Proto::read_from(&mut strm).await?;
            if p.typ != PPONG {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected response type {}", p.typ),
                ));
            }
            Ok(())
        })
        .await
        .map_err(|_| TunnelError::PingFailed(format!("no response within {:?}", timeout)))?
        .map_err(|e: io::Error| TunnelError::PingFailed(e.to_string()))
    }

    /// 级联关闭：多路复用器 → KCP 会话 → （持有时）包传输
    pub fn close(&self) {
        self.cancel.cancel();
        self.session_closed.store(true, Ordering::Relaxed);
        if self.own_packet_conn.load(Ordering::Relaxed) {
            self.pconn.close();
        }
    }

    pub(crate) fn packet_conn(&self) -> Arc<PacketConn> {
        self.pconn.clone()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

/// driver：单任务轮询 yamux Connection
async fn mux_driver(
    mut connection: yamux::Connection<KcpSession>,
    mut open_rx: mpsc::Receiver<OpenRequest>,
    accept_tx: mpsc::Sender<yamux::Stream>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => MuxEvent::Shutdown,
            ev = MuxPollFuture { connection: &mut connection, open_rx: &mut open_rx } => ev,
        };

        match event {
            MuxEvent::Inbound(Ok(stream)) => {
                if accept_tx.send(stream).await.is_err() {
                    return;
                }
            }
            MuxEvent::Inbound(Err(e)) => {
                debug!("mux connection failed: {}", e);
                return;
            }
            MuxEvent::InboundDone => return,
            MuxEvent::OpenRequest(reply) => {
                let result = std::future::poll_fn(|cx| connection.poll_new_outbound(cx)).await;
                let _ = reply.send(result.map_err(|e| e.to_string()));
            }
            MuxEvent::OpenChannelClosed => return,
            MuxEvent::Shutdown => {
                let _ = tokio::time::timeout(
                    Duration::from_secs(1),
                    std::future::poll_fn(|cx| connection.poll_close(cx)),
                )
                .await;
                return;
            }
        }
    }
}

enum MuxEvent {
    Inbound(Result<yamux::Stream, yamux::ConnectionError>),
    InboundDone,
    OpenRequest(OpenRequest),
    OpenChannelClosed,
    Shutdown,
}

struct MuxPollFuture<'a> {
    connection: &'a mut yamux::Connection<KcpSession>,
    open_rx: &'a mut mpsc::Receiver<OpenRequest>,
}

impl Future for MuxPollFuture<'_> {
    type Output = MuxEvent;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<MuxEvent> {
        match self.connection.poll_next_inbound(cx) {
            Poll::Ready(Some(result)) => return Poll::Ready(MuxEvent::Inbound(result)),
            Poll::Ready(None) => return Poll::Ready(MuxEvent::InboundDone),
            Poll::Pending => {}
        }

        match self.open_rx.poll_recv(cx) {
            Poll::Ready(Some(tx)) => return Poll::Ready(MuxEvent::OpenRequest(tx)),
            Poll::Ready(None) => return Poll::Ready(MuxEvent::OpenChannelClosed),
            Poll::Pending => {}
        }

        Poll::Pending
    }
}
