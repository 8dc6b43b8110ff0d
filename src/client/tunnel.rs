/// 单条隧道连接的生命周期
///
/// maintain 常驻后台：断线时每 2s 探测、在线时每 30s 探测，
/// kick 信号可随时短路等待。reconnect 是 single-flight 的，
/// 并发调用者挂在进行中的 watch 上等待结果。
use crate::config::{AppConfig, KcpConfig, NetworkConfig};
use crate::protocol::{Proto, PTCPF};
use crate::socket::PacketConn;
use crate::tnet::crypto::BlockCipher;
use crate::tnet::kcp::Channel;
use crate::{tnet, TunnelError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MAINTAIN_CONNECTED_INTERVAL: Duration = Duration::from_secs(30);
const MAINTAIN_DISCONNECTED_INTERVAL: Duration = Duration::from_secs(2);

// Start at 500ms rather than something aggressive to reduce connection churn.
const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);
const RECONNECT_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// 偏移端口探测超时 / 基准地址拨号超时
const PROBE_PING_TIMEOUT: Duration = Duration::from_secs(3);
const DIAL_PING_TIMEOUT: Duration = Duration::from_secs(10);

struct ConnState {
    conn: Option<Arc<Channel>>,
    // single-flight reconnect: in-progress marker; the sender side is dropped
    // when the attempt finishes, which wakes every waiter.
    inflight: Option<watch::Receiver<()>>,
}

pub(crate) struct TunnelConn {
    kcp_cfg: KcpConfig,
    net_cfg: NetworkConfig,
    server_addr: SocketAddr,
    conn_index: usize,
    state: tokio::sync::Mutex<ConnState>,
    kick: Notify,
    ready_tx: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl TunnelConn {
    pub(crate) fn new(
        cfg: &AppConfig,
        server_addr: SocketAddr,
        conn_index: usize,
        ready_tx: watch::Sender<u64>,
        cancel: CancellationToken,
    ) -> crate::Result<Arc<TunnelConn>> {
        let mut net_cfg = cfg.network.clone();
        apply_conn_index(&mut net_cfg, conn_index)?;
        Ok(Arc::new(TunnelConn {
            kcp_cfg: cfg.transport.kcp.clone(),
            net_cfg,
            server_addr,
            conn_index,
            state: tokio::sync::Mutex::new(ConnState {
                conn: None,
                inflight: None,
            }),
            kick: Notify::new(),
            ready_tx,
            cancel,
        }))
    }

    pub(crate) async fn get_conn(&self) -> Option<Arc<Channel>> {
        self.state.lock().await.conn.clone()
    }

    pub(crate) fn kick_reconnect(&self) {
        self.kick.notify_one();
    }

    /// 仅当 conn 仍是调用方看到的那个时才摘除并关闭，然后踢 maintain
    pub(crate) async fn mark_broken(&self, conn: &Arc<Channel>) {
        {
            let mut st = self.state.lock().await;
            match &st.conn {
                Some(current) if Arc::ptr_eq(current, conn) => {
                    current.close();
                    st.conn = None;
                }
                _ => return,
            }
        }
        self.kick_reconnect();
    }

    pub(crate) async fn close(&self) {
        let conn = {
            let mut st = self.state.lock().await;
            st.conn.take()
        };
        if let Some(conn) = conn {
            conn.close();
        }
    }

    /// 常驻维护循环，仅在 context 取消时退出
    pub(crate) async fn maintain(self: Arc<Self>) {
        // Establish as soon as possible, never blocking the caller.
        let _ = self.reconnect().await;

        loop {
            // Long interval when connected (fewer wakeups), short when broken
            // so we notice faster.
            let interval = if self.get_conn().await.is_some() {
                MAINTAIN_CONNECTED_INTERVAL
            } else {
                MAINTAIN_DISCONNECTED_INTERVAL
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
                _ = self.kick.notified() => {}
            }

            if self.get_conn().await.is_none() {
                let _ = self.reconnect().await;
            }
        }
    }

    /// single-flight 重连；并发调用者等待进行中的那次
    pub(crate) async fn reconnect(&self) -> crate::Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(TunnelError::Io(crate::diag::context_canceled()));
            }

            let done_tx = {
                let mut st = self.state.lock().await;
                if st.conn.is_some() {
                    return Ok(());
                }
                if let Some(rx) = &st.inflight {
                    let mut rx = rx.clone();
                    drop(st);
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Err(TunnelError::Io(crate::diag::context_canceled()));
                        }
                        // Err means the in-flight attempt finished; re-check.
                        _ = rx.changed() => continue,
                    }
                }
                let (tx, rx) = watch::channel(());
                st.inflight = Some(rx);
                tx
            };

            let result = self.reconnect_loop().await;

            {
                let mut st = self.state.lock().await;
                match &result {
                    Ok(conn) => {
                        if st.conn.is_none() {
                            st.conn = Some(conn.clone());
                        } else {
                            // Someone else already installed a connection
                            // (should be rare); prefer it to avoid leaks.
                            conn.close();
                        }
                    }
                    Err(_) => {}
                }
                st.inflight = None;
            }
            drop(done_tx);

            return match result {
                Ok(_) => {
                    // Wake dialers blocked in new_stream.
                    self.ready_tx.send_modify(|v| *v += 1);
                    Ok(())
                }
                Err(e) => Err(e),
            };
        }
    }

    /// 指数退避直到拨通或取消；告警限频一分钟一条
    async fn reconnect_loop(&self) -> crate::Result<Arc<Channel>> {
        let mut backoff = RECONNECT_BACKOFF_INITIAL;
        let mut next_log = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                return Err(TunnelError::Io(crate::diag::context_canceled()));
            }
            match self.create_conn().await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    let now = Instant::now();
                    if now >= next_log {
                        warn!(
                            "tunnel connection {} reconnect failed (retrying): {}",
                            self.conn_index + 1,
                            e
                        );
                        next_log = now + RECONNECT_LOG_INTERVAL;
                    }
                }
            }
            // ±25% jitter against thundering-herd reconnect storms.
            let jitter = Duration::from_nanos(
                rand::Rng::gen_range(&mut rand::thread_rng(), 0..backoff.as_nanos().max(2) as u64 / 2),
            );
            let sleep = backoff + jitter - backoff / 4;
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(TunnelError::Io(crate::diag::context_canceled()));
                }
                _ = tokio::time::sleep(sleep) => {}
            }
            if backoff < RECONNECT_BACKOFF_MAX {
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
            }
        }
    }

    /// 建立一条全新的隧道：新包传输 → 拨号 → ping 验证 → 推送标志序列。
    /// conn_index > 0 时先试 server_port+index，失败回退基准端口。
    async fn create_conn(&self) -> crate::Result<Arc<Channel>> {
        let pconn = PacketConn::new(&self.net_cfg, self.net_cfg.port, &self.kcp_cfg, &self.cancel)?;
        let pconn = Arc::new(pconn);
        let cipher = Arc::new(BlockCipher::new(&self.kcp_cfg.block, &self.kcp_cfg.key)?);

        let mut candidates = vec![self.server_addr];
        if self.conn_index > 0 && self.server_addr.port() > 0 {
            let port = self.server_addr.port() as usize + self.conn_index;
            if port <= 65535 {
                let mut offset = self.server_addr;
                offset.set_port(port as u16);
                candidates = vec![offset, self.server_addr];
            }
        }

        let mut last_err: Option<TunnelError> = None;
        for (i, dst) in candidates.iter().enumerate() {
            let conn = match tnet::kcp::dial_on(
                pconn.clone(),
                *dst,
                &self.kcp_cfg,
                cipher.clone(),
                false,
                &self.cancel,
            ) {
                Ok(conn) => Arc::new(conn),
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };

            // Verify the tunnel is actually up (and the key matches) before
            // exposing it. The offset-port probe fails fast.
            let timeout = if i == 0 && candidates.len() > 1 {
                PROBE_PING_TIMEOUT
            } else {
                DIAL_PING_TIMEOUT
            };
            if let Err(e) = conn.ping_with_timeout(true, timeout).await {
                last_err = Some(e);
                // Keep the raw transport alive for the fallback dial.
                conn.close();
                continue;
            }

            if let Err(e) = self.send_tcpf(&conn).await {
                last_err = Some(TunnelError::Io(e));
                conn.close();
                continue;
            }

            conn.set_own_packet_conn(true);
            return Ok(conn);
        }

        pconn.close();
        Err(last_err.unwrap_or_else(|| {
            TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "failed to establish tunnel connection",
            ))
        }))
    }

    /// 把本端期望对端使用的 TCP 标志序列推给服务端
    async fn send_tcpf(&self, conn: &Channel) -> std::io::Result<()> {
        let mut strm = conn.open_stream().await?;
        let p = Proto::with_tcpf(PTCPF, self.net_cfg.tcp.rf.clone());
        p.write_to(&mut strm).await?;
        debug!("tunnel connection {} sent flag profile", self.conn_index + 1);
        Ok(())
    }
}

/// 按连接序号偏移本地端口；随机端口模式（port=0）不做偏移
fn apply_conn_index(net_cfg: &mut NetworkConfig, conn_index: usize) -> crate::Result<()> {
    if conn_index == 0 || net_cfg.port == 0 {
        return Ok(());
    }
    let port = net_cfg.port as usize + conn_index;
    if port > 65535 {
        return Err(TunnelError::config_error(format!(
            "client port range too large: base={} conn_index={} => {}",
            net_cfg.port, conn_index, port
        )));
    }
    net_cfg.port = port as u16;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net_cfg(port: u16) -> NetworkConfig {
        let mut n = NetworkConfig {
            interface: "eth0".to_string(),
            port,
            ipv4: Some(crate::config::IpGateway {
                addr: "192.0.2.10".parse().unwrap(),
                router: "02:00:00:00:00:01".to_string(),
            }),
            ipv6: None,
            tcp: Default::default(),
            pcap: Default::default(),
        };
        n.set_defaults(crate::config::Role::Client);
        n
    }

    #[test]
    fn test_conn_index_offsets_port() {
        let mut n = net_cfg(18000);
        apply_conn_index(&mut n, 3).unwrap();
        assert_eq!(n.port, 18003);
    }

    #[test]
    fn test_conn_index_rejects_overflow() {
        let mut n = net_cfg(65534);
        let err = apply_conn_index(&mut n, 2).unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("port range too large"));
    }

    #[test]
    fn test_random_port_mode_skips_offset() {
        let mut n = net_cfg(0);
        apply_conn_index(&mut n, 5).unwrap();
        assert_eq!(n.port, 0);
    }

    #[test]
    fn test_dial_candidates_offset_then_base() {
        // conn_index > 0 probes serverPort+index first, then falls back.
        let server: SocketAddr = "203.0.113.1:9000".parse().unwrap();
        let conn_index = 2usize;
        let mut candidates = vec![server];
        if conn_index > 0 {
            let mut offset = server;
            offset.set_port(server.port() + conn_index as u16);
            candidates = vec![offset, server];
        }
        assert_eq!(candidates[0].port(), 9002);
        assert_eq!(candidates[1].port(), 9000);
    }
}
