/// 服务端：多监听器接纳管线
///
/// 每个端口一个包传输 + 一个 KCP 监听器 + 一个 accept 任务。
/// 会话/流的准入全部是非阻塞的：信号量拿不到就是背压信号，
/// 直接关掉多余的连接或流，不排队。
mod handle;

pub(crate) use handle::Admission;

use crate::config::AppConfig;
use crate::diag;
use crate::socket::PacketConn;
use crate::tnet::kcp::Listener;
use crate::TunnelError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(5);

pub struct Server {
    cfg: Arc<AppConfig>,
    admission: Arc<Admission>,
    header_timeout: Duration,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(cfg: AppConfig, cancel: CancellationToken) -> Server {
        let k = &cfg.transport.kcp;
        Server {
            admission: Arc::new(Admission::new(k)),
            header_timeout: Duration::from_secs(k.header_timeout.max(1)),
            cfg: Arc::new(cfg),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// 启动所有监听器并阻塞运行，直到 context 取消、全部任务排空
    pub async fn start(&self) -> crate::Result<()> {
        let base_port = self.cfg.network.port;
        if base_port == 0 {
            return Err(TunnelError::config_error(
                "server network port cannot be 0 (set network.port)",
            ));
        }
        let conn_count = self.cfg.transport.conn.max(1);
        let last_port = base_port as usize + conn_count - 1;
        if last_port > 65535 {
            return Err(TunnelError::config_error(format!(
                "server port range too large: base={} conn={} => last={} (max 65535)",
                base_port, conn_count, last_port
            )));
        }

        let mut listeners = Vec::with_capacity(conn_count);
        for i in 0..conn_count {
            let port = base_port + i as u16;
            let pconn = PacketConn::new(&self.cfg.network, port, &self.cfg.transport.kcp, &self.cancel)?;
            let listener = Arc::new(Listener::listen(pconn, &self.cfg.transport.kcp, &self.cancel)?);
            listeners.push(listener.clone());

            let server = self.clone_refs();
            self.tracker.spawn(async move { server.listen(listener).await });
        }

        if conn_count > 1 {
            info!(
                "Server started - listening for packets on :{}-{} ({} conns)",
                base_port, last_port, conn_count
            );
        } else {
            info!("Server started - listening for packets on :{}", base_port);
        }

        self.cancel.cancelled().await;
        for l in &listeners {
            l.close();
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!("Server shutdown completed");
        Ok(())
    }

    fn clone_refs(&self) -> ServerRefs {
        ServerRefs {
            admission: self.admission.clone(),
            header_timeout: self.header_timeout,
            tracker: self.tracker.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// 各 accept 任务共享的服务端状态
#[derive(Clone)]
pub(crate) struct ServerRefs {
    pub(crate) admission: Arc<Admission>,
    pub(crate) header_timeout: Duration,
    pub(crate) tracker: TaskTracker,
    pub(crate) cancel: CancellationToken,
}

impl ServerRefs {
    async fn listen(self, listener: Arc<Listener>) {
        let mut backoff = ACCEPT_BACKOFF_INITIAL;
        loop {
            let conn = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = listener.accept() => match r {
                    Ok(conn) => conn,
                    Err(e) => {
                        if self.cancel.is_cancelled() {
                            return;
                        }
                        warn!("failed to accept connection: {}", e);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                        continue;
                    }
                },
            };
            backoff = ACCEPT_BACKOFF_INITIAL;

            let Some(session_permit) = self.admission.try_session() else {
                warn!(
                    "dropping new connection from {}: max_sessions reached",
                    conn.peer_addr()
                );
                conn.close();
                continue;
            };
            diag::inc_sessions();
            info!(
                "accepted new connection from {} (local: {})",
                conn.peer_addr(),
                conn.local_addr()
            );

            let server = self.clone();
            let conn = Arc::new(conn);
            self.tracker.spawn(async move {
                server.handle_conn(conn.clone()).await;
                diag::dec_sessions();
                drop(session_permit);
                conn.close();
            });
        }
    }

}
