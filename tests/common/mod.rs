/// 集成测试公共设施：内存链路上的完整隧道
use paqet::config::{KcpConfig, Role};
use paqet::socket::PacketConn;
use paqet::tnet::kcp::{dial, Channel, Listener};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub fn kcp_cfg(key: &str) -> KcpConfig {
    let mut k = KcpConfig {
        key: key.to_string(),
        ..Default::default()
    };
    k.set_defaults(Role::Client);
    k
}

pub fn addrs() -> (SocketAddr, SocketAddr) {
    (
        "192.0.2.1:4000".parse().unwrap(),
        "192.0.2.2:9000".parse().unwrap(),
    )
}

/// 建一条贯通 guard + 加密 + KCP + yamux 的内存隧道。
/// 返回的 Listener 必须存活到测试结束。
pub async fn linked_pair(cfg: &KcpConfig, cancel: &CancellationToken) -> (Channel, Channel, Listener) {
    let (client_addr, server_addr) = addrs();
    let (client_pc, server_pc) = PacketConn::memory_pair(Some(cfg), client_addr, server_addr, cancel);

    let listener = Listener::listen(server_pc, cfg, cancel).unwrap();
    let client = dial(client_pc, server_addr, cfg, cancel).unwrap();

    let accept = tokio::spawn(async move {
        let ch = listener.accept().await.unwrap();
        (ch, listener)
    });

    // 第一包让服务端看见新会话
    let mut strm = client.open_stream().await.unwrap();
    strm.write_all(b"hi").await.unwrap();
    let (server, listener) = tokio::time::timeout(Duration::from_secs(5), accept)
        .await
        .expect("accept timed out")
        .unwrap();
    let mut first = server.accept_stream().await.unwrap();
    let mut b = [0u8; 2];
    first.read_exact(&mut b).await.unwrap();
    assert_eq!(&b, b"hi");

    (client, server, listener)
}
