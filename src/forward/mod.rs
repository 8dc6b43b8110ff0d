/// 客户端前端：本地 TCP/UDP 监听器，把应用流量送进隧道
use crate::client::Client;
use crate::diag;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// UDP 回程静默超过该时长即回收流
const UDP_REPLY_IDLE_TIMEOUT: Duration = Duration::from_secs(8);

pub struct Forward {
    client: Arc<Client>,
    listen_addr: SocketAddr,
    target_addr: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Forward {
    pub fn new(
        client: Arc<Client>,
        listen_addr: SocketAddr,
        target_addr: String,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Forward {
        Forward {
            client,
            listen_addr,
            target_addr,
            cancel,
            tracker,
        }
    }

    pub async fn listen_tcp(self: Arc<Self>) -> io::Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await.inspect_err(|e| {
            error!("failed to bind TCP socket on {}: {}", self.listen_addr, e);
        })?;
        info!("TCP forwarder listening on {} -> {}", self.listen_addr, self.target_addr);

        loop {
            let (conn, peer) = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                r = listener.accept() => match r {
                    Ok(v) => v,
                    Err(e) => {
                        error!("failed to accept TCP connection on {}: {}", self.listen_addr, e);
                        continue;
                    }
                },
            };

            let fwd = self.clone();
            self.tracker.spawn(async move {
                match fwd.handle_tcp_conn(conn, peer).await {
                    Ok(()) => debug!("TCP connection {} -> {} closed", peer, fwd.target_addr),
                    Err(e) => {
                        if !diag::is_benign_stream_err(&e) {
                            error!(
                                "TCP connection {} -> {} closed with error: {}",
                                peer, fwd.target_addr, e
                            );
                        }
                    }
                }
            });
        }
    }

    async fn handle_tcp_conn(&self, conn: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let strm = self
            .client
            .tcp(&self.target_addr)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string()))
            .inspect_err(|e| {
                error!(
                    "failed to establish stream for {} -> {}: {}",
                    peer, self.target_addr, e
                );
            })?;
        let sid = strm.sid();
        debug!("accepted TCP connection {} -> {}", peer, self.target_addr);

        let (mut cr, mut cw) = conn.into_split();
        let (mut sr, mut sw) = tokio::io::split(strm);
        let (err_up, err_down) = diag::bidi_copy(
            &self.cancel,
            async { diag::copy_tcp_up(&mut cr, &mut sw).await },
            async { diag::copy_tcp_down(&mut sr, &mut cw).await },
        )
        .await;
        debug!("TCP stream {} closed for {} -> {}", sid, peer, self.target_addr);

        if self.cancel.is_cancelled() {
            return Ok(());
        }
        for (dir, result) in [("up", err_up), ("down", err_down)] {
            if let Err(e) = result {
                if diag::is_no_buffer_or_no_mem(&e) {
                    debug!(
                        "TCP stream {} for {} -> {} hit ENOBUFS (benign, {})",
                        sid, peer, self.target_addr, dir
                    );
                    continue;
                }
                if !diag::is_benign_stream_err(&e) {
                    error!(
                        "TCP stream {} failed for {} -> {} ({}): {}",
                        sid, peer, self.target_addr, dir, e
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub async fn listen_udp(self: Arc<Self>) {
        let socket = match UdpSocket::bind(self.listen_addr).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!("failed to bind UDP socket on {}: {}", self.listen_addr, e);
                return;
            }
        };
        info!("UDP forwarder listening on {} -> {}", self.listen_addr, self.target_addr);

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, caddr) = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = socket.recv_from(&mut buf) => match r {
                    Ok(v) => v,
                    Err(e) => {
                        error!("UDP packet handling failed on {}: {}", self.listen_addr, e);
                        continue;
                    }
                },
            };
            if n == 0 {
                continue;
            }

            if let Err(e) = self.handle_udp_packet(&socket, &buf[..n], caddr).await {
                error!("UDP packet handling failed on {}: {}", self.listen_addr, e);
            }
        }
    }

    async fn handle_udp_packet(
        &self,
        socket: &Arc<UdpSocket>,
        datagram: &[u8],
        caddr: SocketAddr,
    ) -> io::Result<()> {
        let (strm, is_new, key) = self
            .client
            .udp(&caddr.to_string(), &self.target_addr)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string()))?;

        if let Err(e) = strm.write_all(datagram).await {
            error!(
                "failed to forward {} bytes from {} -> {}: {}",
                datagram.len(),
                caddr,
                self.target_addr,
                e
            );
            self.client.close_udp(key).await;
            return Err(e);
        }
        diag::add_udp_up(datagram.len() as u64);

        if is_new {
            info!(
                "accepted UDP connection {} for {} -> {}",
                strm.sid(),
                caddr,
                self.target_addr
            );
            let fwd = self.clone_refs();
            let socket = socket.clone();
            self.tracker.spawn(async move {
                fwd.pump_udp_replies(key, strm, socket, caddr).await;
            });
        }
        Ok(())
    }

    fn clone_refs(&self) -> ForwardRefs {
        ForwardRefs {
            client: self.client.clone(),
            target_addr: self.target_addr.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

struct ForwardRefs {
    client: Arc<Client>,
    target_addr: String,
    cancel: CancellationToken,
}

impl ForwardRefs {
    /// 回程泵：从隧道流读回复，发回应用来源；读超时即回收
    async fn pump_udp_replies(
        &self,
        key: u64,
        strm: Arc<crate::client::TrackedStream>,
        socket: Arc<UdpSocket>,
        caddr: SocketAddr,
    ) {
        let sid = strm.sid();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = strm.read_timeout(&mut buf, UDP_REPLY_IDLE_TIMEOUT) => match r {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        if !diag::is_benign_stream_err(&e) {
                            error!(
                                "UDP stream {} failed for {} -> {}: {}",
                                sid, caddr, self.target_addr, e
                            );
                        }
                        break;
                    }
                },
            };

            if let Err(e) = send_to_with_retry(&socket, &buf[..n], caddr).await {
                error!("failed to reply {} bytes to {}: {}", n, caddr, e);
                break;
            }
            diag::add_udp_down(n as u64);
        }
        debug!("UDP stream {} closed for {} -> {}", sid, caddr, self.target_addr);
        self.client.close_udp(key).await;
    }
}

/// 瞬时背压下的有界重发；持续背压按 UDP 丢包处理，不拆流
async fn send_to_with_retry(socket: &UdpSocket, data: &[u8], addr: SocketAddr) -> io::Result<()> {
    let mut backoff = Duration::from_micros(200);
    for _ in 0..5 {
        match socket.send_to(data, addr).await {
            Ok(_) => return Ok(()),
            Err(e) if diag::is_transient_backpressure(&e) => {
                tokio::time::sleep(backoff).await;
                if backoff < Duration::from_millis(5) {
                    backoff *= 2;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
