/// 服务端监听：按对端地址把入站报文分发到各会话
use super::conn::{Channel, MTU_LIMIT};
use super::session::SessionInput;
use crate::config::KcpConfig;
use crate::socket::PacketConn;
use crate::tnet::crypto::BlockCipher;
use crate::TunnelError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct Listener {
    pconn: Arc<PacketConn>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Channel>>,
    cancel: CancellationToken,
}

impl Listener {
    /// 在一个包传输上开始服务；每个新来源地址产生一条新通道
    pub fn listen(
        pconn: PacketConn,
        cfg: &KcpConfig,
        parent: &CancellationToken,
    ) -> crate::Result<Listener> {
        let cipher = Arc::new(BlockCipher::new(&cfg.block, &cfg.key)?);
        let pconn = Arc::new(pconn);
        let cancel = parent.child_token();
        let (accept_tx, accept_rx) = mpsc::channel::<Channel>(64);

        {
            let pconn = pconn.clone();
            let cfg = cfg.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                demux_loop(pconn, cfg, cipher, accept_tx, cancel).await;
            });
        }

        Ok(Listener {
            pconn,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            cancel,
        })
    }

    pub async fn accept(&self) -> crate::Result<Channel> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv().await.ok_or_else(|| {
            TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "listener closed",
            ))
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.pconn.local_addr()
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.pconn.close();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// 读循环：guard 已在 PacketConn 内剥掉，这里解密后路由。
/// 解密失败的报文静默丢弃；来自新地址的首包触发建会话。
async fn demux_loop(
    pconn: Arc<PacketConn>,
    cfg: KcpConfig,
    cipher: Arc<BlockCipher>,
    accept_tx: mpsc::Sender<Channel>,
    cancel: CancellationToken,
) {
    let mut sessions: HashMap<SocketAddr, SessionInput> = HashMap::new();
    let mut buf = vec![0u8; MTU_LIMIT];

    loop {
        let (n, addr) = tokio::select! {
            _ = cancel.cancelled() => return,
            r = pconn.read_from(&mut buf) => match r {
                Ok(v) => v,
                Err(e) => {
                    debug!("listener packet read ended: {}", e);
                    return;
                }
            },
        };

        let Some(plain) = cipher.open(&buf[..n]) else {
            continue;
        };

        if let Some(input) = sessions.get(&addr) {
            if input.input(&plain) {
                continue;
            }
            // Session died (keepalive/dead-link); fall through to replace it.
            sessions.remove(&addr);
        }

        sessions.retain(|_, input| !input.is_closed());

        let (channel, input) = Channel::new(
            pconn.clone(),
            addr,
            &cfg,
            cipher.clone(),
            yamux::Mode::Server,
            false,
            &cancel,
        );
        input.input(&plain);
        sessions.insert(addr, input);
        if accept_tx.send(channel).await.is_err() {
            return;
        }
    }
}
