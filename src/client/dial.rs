/// 取一条新的多路复用流
///
/// 冷启动或重连窗口期内不立即报错：按轮询扫一遍隧道，
/// 扫不到就等 ready 信号，3 秒后放弃。
use super::Client;
use crate::tnet::Strm;
use crate::TunnelError;
use std::time::Duration;
use tracing::debug;

const DIAL_WAIT_DEADLINE: Duration = Duration::from_secs(3);

impl Client {
    pub(crate) async fn new_stream(&self) -> crate::Result<Strm> {
        if self.tunnels.is_empty() {
            return Err(TunnelError::NoTunnelConnections);
        }

        let deadline = tokio::time::Instant::now() + DIAL_WAIT_DEADLINE;
        let mut ready_rx = self.ready_tx.subscribe();
        let mut kicked = false;

        loop {
            if self.cancel.is_cancelled() {
                return Err(TunnelError::Io(crate::diag::context_canceled()));
            }

            // Try each tunnel connection once per attempt.
            for _ in 0..self.tunnels.len() {
                let Some(tc) = self.tunnels.next() else { continue };

                let Some(conn) = tc.get_conn().await else {
                    // Kick reconnects on the first sweep only, to avoid a
                    // thundering herd when everything is down.
                    if !kicked {
                        tc.kick_reconnect();
                    }
                    continue;
                };

                match conn.open_stream().await {
                    Ok(strm) => return Ok(strm),
                    Err(e) => {
                        debug!("failed to open stream, reconnecting in background: {}", e);
                        tc.mark_broken(&conn).await;
                    }
                }
            }
            kicked = true;

            if tokio::time::Instant::now() >= deadline {
                return Err(TunnelError::NoTunnelConnections);
            }

            // Wait for a connection to become ready instead of busy-polling.
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(TunnelError::Io(crate::diag::context_canceled()));
                }
                _ = ready_rx.changed() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}
