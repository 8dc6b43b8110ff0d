/// 客户端核心：隧道池 + UDP 流池
mod dial;
mod tunnel;
mod udp_pool;

pub use udp_pool::TrackedStream;

use crate::config::AppConfig;
use crate::diag;
use crate::pkg::{fingerprint, iterator};
use crate::protocol::{Proto, PTCP, PUDP};
use crate::tnet::{Addr, Strm};
use crate::TunnelError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use tunnel::TunnelConn;

const PING_TICKER_INTERVAL: Duration = Duration::from_secs(10);

pub struct Client {
    cfg: Arc<AppConfig>,
    server_addr: SocketAddr,
    pub(crate) tunnels: iterator::Iterator<Arc<TunnelConn>>,
    udp_pool: udp_pool::UdpPool,
    // 每次任一隧道重连成功都会推一个新版本，唤醒 new_stream 的等待者
    pub(crate) ready_tx: watch::Sender<u64>,
    pub(crate) cancel: CancellationToken,
    tracker: TaskTracker,
    shutdown_rx: watch::Receiver<bool>,
}

impl Client {
    /// 建 N 条隧道连接并启动后台维护。不等待任何一条拨通。
    pub fn start(cfg: AppConfig, cancel: CancellationToken) -> crate::Result<Arc<Client>> {
        let cfg = Arc::new(cfg);
        let server_addr = cfg
            .server_addr()
            .map_err(|e| TunnelError::config_error(e.to_string()))?;

        let (ready_tx, _) = watch::channel(0u64);
        let mut items = Vec::with_capacity(cfg.transport.conn);
        for i in 0..cfg.transport.conn {
            items.push(TunnelConn::new(
                &cfg,
                server_addr,
                i,
                ready_tx.clone(),
                cancel.clone(),
            )?);
        }

        let tracker = TaskTracker::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let client = Arc::new(Client {
            cfg: cfg.clone(),
            server_addr,
            tunnels: iterator::Iterator::new(items),
            udp_pool: udp_pool::UdpPool::new(),
            ready_tx,
            cancel: cancel.clone(),
            tracker: tracker.clone(),
            shutdown_rx,
        });

        for tc in client.tunnels.items.iter() {
            tracker.spawn(tc.clone().maintain());
        }
        info!(
            "client initializing {} tunnel connections in background",
            client.tunnels.len()
        );

        {
            let client = client.clone();
            tracker.spawn(async move {
                client.udp_pool.sweep(client.cancel.clone()).await;
            });
        }

        if diag::enabled() {
            let client = client.clone();
            tracker.spawn(async move { client.ping_ticker().await });
        }

        // Shutdown watcher: close every tunnel once the context is cancelled.
        {
            let client = client.clone();
            let tracker_for_wait = tracker.clone();
            tokio::spawn(async move {
                client.cancel.cancelled().await;
                for tc in client.tunnels.items.iter() {
                    tc.close().await;
                }
                tracker_for_wait.close();
                tracker_for_wait.wait().await;
                info!("client shutdown complete");
                let _ = shutdown_tx.send(true);
            });
        }

        let ipv4 = cfg
            .network
            .ipv4
            .as_ref()
            .map(|g| g.addr.to_string())
            .unwrap_or_else(|| "<nil>".to_string());
        let ipv6 = cfg
            .network
            .ipv6
            .as_ref()
            .map(|g| g.addr.to_string())
            .unwrap_or_else(|| "<nil>".to_string());
        info!(
            "Client started: IPv4:{} IPv6:{} -> {} ({} connections)",
            ipv4,
            ipv6,
            server_addr,
            client.tunnels.len()
        );
        Ok(client)
    }

    pub fn config(&self) -> &AppConfig {
        &self.cfg
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// 新开一条 TCP 流：写 PTCP 头（受 header_timeout 约束）后交给调用方
    pub async fn tcp(&self, addr: &str) -> crate::Result<Strm> {
        let taddr: Addr = addr
            .parse()
            .map_err(|e: String| TunnelError::protocol_error(e))?;
        let mut strm = self.new_stream().await.inspect_err(|e| {
            debug!("failed to create stream for TCP {}: {}", addr, e);
        })?;

        let p = Proto::with_addr(PTCP, taddr);
        if let Err(e) = self.write_header(&mut strm, &p).await {
            debug!(
                "failed to write TCP protocol header for {} on stream {}: {}",
                addr,
                strm.sid(),
                e
            );
            let _ = strm.shutdown().await;
            return Err(TunnelError::Io(e));
        }

        debug!("TCP stream {} established for {}", strm.sid(), addr);
        Ok(strm)
    }

    /// 取或建一条 UDP 流。返回 (流, 是否新建, 池 key)
    pub async fn udp(
        &self,
        local: &str,
        target: &str,
    ) -> crate::Result<(Arc<TrackedStream>, bool, u64)> {
        let key = fingerprint::addr_pair(local, target);
        if let Some(strm) = self.udp_pool.get(key) {
            debug!("reusing UDP stream {} for {} -> {}", strm.sid(), local, target);
            return Ok((strm, false, key));
        }

        let taddr: Addr = target
            .parse()
            .map_err(|e: String| TunnelError::protocol_error(e))?;
        let mut strm = self.new_stream().await.inspect_err(|e| {
            debug!("failed to create stream for UDP {} -> {}: {}", local, target, e);
        })?;

        let p = Proto::with_addr(PUDP, taddr);
        if let Err(e) = self.write_header(&mut strm, &p).await {
            debug!(
                "failed to write UDP protocol header for {} -> {} on stream {}: {}",
                local,
                target,
                strm.sid(),
                e
            );
            let _ = strm.shutdown().await;
            return Err(TunnelError::Io(e));
        }

        let tracked = TrackedStream::new(strm);
        self.udp_pool.insert(key, tracked.clone()).await;
        debug!("established UDP stream {} for {} -> {}", tracked.sid(), local, target);
        Ok((tracked, true, key))
    }

    /// 关闭并移除一条池化 UDP 流；幂等
    pub async fn close_udp(&self, key: u64) {
        self.udp_pool.delete(key).await;
    }

    async fn write_header(&self, strm: &mut Strm, p: &Proto) -> std::io::Result<()> {
        let timeout = Duration::from_secs(self.cfg.transport.kcp.header_timeout.max(1));
        match tokio::time::timeout(timeout, p.write_to(strm)).await {
            Ok(r) => r,
            Err(_) => Err(diag::deadline_exceeded()),
        }
    }

    /// diag 打开时：每 10s 轮询一条隧道做 ping，记录 RTT
    async fn ping_ticker(&self) {
        let mut ticker = tokio::time::interval(PING_TICKER_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let Some(tc) = self.tunnels.next() else { continue };
            let Some(conn) = tc.get_conn().await else { continue };
            let start = std::time::Instant::now();
            let result = conn.ping(true).await;
            diag::set_ping(start.elapsed(), result.err().map(|e| e.to_string()).as_deref());
        }
    }

    /// 等待后台任务全部排空；timeout 为零表示无限等
    pub async fn wait_shutdown(&self, timeout: Duration) -> bool {
        let mut rx = self.shutdown_rx.clone();
        let wait = async move {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        if timeout.is_zero() {
            wait.await;
            return true;
        }
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::udp_pool::{TrackedStream, UdpPool};
    use std::time::Duration;

    fn duplex_tracked(sid: u64) -> std::sync::Arc<TrackedStream> {
        let (a, _b) = tokio::io::duplex(1024);
        TrackedStream::from_io(sid, Box::new(a))
    }

    #[tokio::test]
    async fn test_pool_insert_get_delete_idempotent() {
        let pool = UdpPool::with_limits(16, Duration::from_secs(60));
        let s = duplex_tracked(1);
        pool.insert(7, s).await;
        assert!(pool.get(7).is_some());
        pool.delete(7).await;
        assert!(pool.get(7).is_none());
        // deleting again is a no-op
        pool.delete(7).await;
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_max_entries() {
        let pool = UdpPool::with_limits(4, Duration::from_secs(60));
        for i in 0..16u64 {
            pool.insert(i, duplex_tracked(i)).await;
        }
        assert!(pool.len() <= 4, "pool size {} exceeds cap", pool.len());
        pool.evict(super::udp_pool::test_now_nanos()).await;
        assert!(pool.len() <= 4);
    }

    #[tokio::test]
    async fn test_pool_evicts_idle_entries() {
        let pool = UdpPool::with_limits(64, Duration::from_secs(60));
        for i in 0..8u64 {
            let s = duplex_tracked(i);
            if i % 2 == 0 {
                // stale for longer than the idle timeout
                s.set_last_used(super::udp_pool::test_now_nanos() - 120_000_000_000);
            }
            pool.insert(i, s).await;
        }
        pool.evict(super::udp_pool::test_now_nanos()).await;
        assert_eq!(pool.len(), 4);
    }

    #[tokio::test]
    async fn test_tracked_stream_read_timeout() {
        let (a, _b) = tokio::io::duplex(64);
        let s = TrackedStream::from_io(1, Box::new(a));
        let mut buf = [0u8; 16];
        let err = s
            .read_timeout(&mut buf, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_touch_throttling_keeps_timestamp_monotonic() {
        let (a, b) = tokio::io::duplex(1024);
        let s = TrackedStream::from_io(1, Box::new(a));
        let first = s.last_used();

        let (_br, mut bw) = tokio::io::split(b);
        tokio::io::AsyncWriteExt::write_all(&mut bw, b"ping")
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        s.read(&mut buf).await.unwrap();
        // within the 5s throttle window the timestamp must not move backwards
        assert!(s.last_used() >= first);
    }
}
