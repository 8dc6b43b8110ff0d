/// KCP 通道的拨号与监听入口
mod conn;
mod listen;
mod session;

pub use conn::{Channel, PING_TIMEOUT};
pub use listen::Listener;

use crate::config::KcpConfig;
use crate::socket::PacketConn;
use crate::tnet::crypto::BlockCipher;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 客户端拨号：通道接管包传输的所有权并启动输入泵
pub fn dial(
    pconn: PacketConn,
    dst: SocketAddr,
    cfg: &KcpConfig,
    parent: &CancellationToken,
) -> crate::Result<Channel> {
    let cipher = Arc::new(BlockCipher::new(&cfg.block, &cfg.key)?);
    let pconn = Arc::new(pconn);
    dial_on(pconn, dst, cfg, cipher, true, parent)
}

/// 在已有的包传输上拨号（端口回退时第二次尝试复用同一个传输）
pub fn dial_on(
    pconn: Arc<PacketConn>,
    dst: SocketAddr,
    cfg: &KcpConfig,
    cipher: Arc<BlockCipher>,
    own_packet_conn: bool,
    parent: &CancellationToken,
) -> crate::Result<Channel> {
    let (channel, input) = Channel::new(
        pconn.clone(),
        dst,
        cfg,
        cipher.clone(),
        yamux::Mode::Client,
        own_packet_conn,
        parent,
    );

    // input pump：捕获 → 解密 → 会话。解密失败静默丢弃。
    // 泵的生命周期跟随通道：端口回退重拨时旧泵必须先停，
    // 否则两个泵会竞争同一个包传输的读取。
    let cancel = channel.cancel_token();
    tokio::spawn(async move {
        let mut buf = vec![0u8; conn::MTU_LIMIT];
        loop {
            let (n, _from) = tokio::select! {
                _ = cancel.cancelled() => return,
                r = pconn.read_from(&mut buf) => match r {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("tunnel packet read ended: {}", e);
                        return;
                    }
                },
            };
            if let Some(plain) = cipher.open(&buf[..n]) {
                if !input.input(&plain) {
                    return;
                }
            }
        }
    });

    Ok(channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::protocol::{Proto, PPING, PPONG};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn cfg() -> KcpConfig {
        let mut k = KcpConfig {
            key: "tunnel-secret".to_string(),
            ..Default::default()
        };
        k.set_defaults(Role::Client);
        k
    }

    fn addrs() -> (SocketAddr, SocketAddr) {
        ("192.0.2.1:4000".parse().unwrap(), "192.0.2.2:9000".parse().unwrap())
    }

    /// 一条完整的内存链路：guard + 加密 + KCP + yamux。
    /// Listener 必须存活到测试结束，否则服务端传输会被级联关闭。
    async fn linked_pair(cfg: &KcpConfig) -> (Channel, Channel, Listener) {
        let cancel = CancellationToken::new();
        let (client_addr, server_addr) = addrs();
        let (client_pc, server_pc) =
            PacketConn::memory_pair(Some(cfg), client_addr, server_addr, &cancel);

        let listener = Listener::listen(server_pc, cfg, &cancel).unwrap();
        let client = dial(client_pc, server_addr, cfg, &cancel).unwrap();

        // 客户端先发点东西让服务端看见新会话
        let accept = tokio::spawn(async move {
            let ch = listener.accept().await.unwrap();
            (ch, listener)
        });
        let mut strm = client.open_stream().await.unwrap();
        strm.write_all(b"hi").await.unwrap();
        let (server, listener) = tokio::time::timeout(Duration::from_secs(5), accept)
            .await
            .expect("accept timed out")
            .unwrap();
        let mut peer_strm = server.accept_stream().await.unwrap();
        let mut b = [0u8; 2];
        peer_strm.read_exact(&mut b).await.unwrap();
        assert_eq!(&b, b"hi");

        (client, server, listener)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dial_listen_stream_echo() {
        let cfg = cfg();
        let (client, server, _listener) = linked_pair(&cfg).await;

        let echo = tokio::spawn(async move {
            let mut strm = server.accept_stream().await.unwrap();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = strm.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                strm.write_all(&buf[..n]).await.unwrap();
            }
        });

        let mut strm = client.open_stream().await.unwrap();
        strm.write_all(b"yamux over kcp over raw frames").await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(5), strm.read(&mut buf))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(&buf[..n], b"yamux over kcp over raw frames");

        strm.shutdown().await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), echo).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ping_pong_round_trip() {
        let cfg = cfg();
        let (client, server, _listener) = linked_pair(&cfg).await;

        // 服务端应答 PING
        tokio::spawn(async move {
            loop {
                let Ok(mut strm) = server.accept_stream().await else { return };
                tokio::spawn(async move {
                    if let Ok(p) = Proto::read_from(&mut strm).await {
                        if p.typ == PPING {
                            let _ = Proto::new(PPONG).write_to(&mut strm).await;
                        }
                    }
                });
            }
        });

        client.ping(true).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_concurrent_streams() {
        let cfg = cfg();
        let (client, server, _listener) = linked_pair(&cfg).await;
        let client = Arc::new(client);

        tokio::spawn(async move {
            loop {
                let Ok(mut strm) = server.accept_stream().await else { return };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    loop {
                        let Ok(n) = strm.read(&mut buf).await else { return };
                        if n == 0 {
                            return;
                        }
                        if strm.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        let mut tasks = Vec::new();
        for i in 0..16u32 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let mut strm = client.open_stream().await.unwrap();
                let msg = format!("stream-{:02}", i);
                strm.write_all(msg.as_bytes()).await.unwrap();
                let mut buf = vec![0u8; 64];
                let n = tokio::time::timeout(Duration::from_secs(10), strm.read(&mut buf))
                    .await
                    .expect("read timed out")
                    .unwrap();
                assert_eq!(&buf[..n], msg.as_bytes());
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_open_stream_after_close_fails() {
        let cfg = cfg();
        let cancel = CancellationToken::new();
        let (client_addr, server_addr) = addrs();
        let (client_pc, _server_pc) =
            PacketConn::memory_pair(Some(&cfg), client_addr, server_addr, &cancel);
        let client = dial(client_pc, server_addr, &cfg, &cancel).unwrap();
        client.close();
        assert!(client.open_stream().await.is_err());
    }
}
