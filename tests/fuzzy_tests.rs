/// 畸形输入与边界条件
mod common;

use paqet::config::AppConfig;
use paqet::protocol::{Proto, PPING, PTCP, PUDP};
use paqet::socket::{parse_ether_ip_tcp, PacketConn};
use paqet::tnet::Addr;
use std::io;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_protocol_decoder_survives_random_bytes() {
    // none of these may panic; they either parse or fail cleanly
    let mut seed: u64 = 0x9E3779B97F4A7C15;
    for _ in 0..500 {
        let len = (seed % 64) as usize;
        let mut data = Vec::with_capacity(len);
        for _ in 0..len {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            data.push((seed >> 33) as u8);
        }
        let _ = Proto::read_from(&mut io::Cursor::new(data)).await;
    }
}

#[tokio::test]
async fn test_protocol_rejects_oversized_host_length() {
    // flags say "address present", host length far beyond the cap
    let raw = vec![PTCP, 0x01, 0xFF, 0xFF];
    let err = Proto::read_from(&mut io::Cursor::new(raw)).await.unwrap_err();
    assert!(err.to_string().contains("exceeds max"));
}

#[tokio::test]
async fn test_protocol_truncated_tcpf_list() {
    // claims 4 entries but carries only one
    let raw = vec![PPING, 0x02, 4, 0x00, 0x12];
    let err = Proto::read_from(&mut io::Cursor::new(raw)).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
}

#[test]
fn test_frame_parser_survives_random_bytes() {
    let mut seed: u64 = 0xDEADBEEFCAFE;
    for _ in 0..2000 {
        let len = (seed % 128) as usize;
        let mut frame = Vec::with_capacity(len);
        for _ in 0..len {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            frame.push((seed >> 33) as u8);
        }
        let _ = parse_ether_ip_tcp(&frame);
    }
}

#[test]
fn test_addr_parse_garbage() {
    for s in ["", ":", "::", "host:", ":0x10", "[::1]", "[::1]443", "a:b:c"] {
        assert!(s.parse::<Addr>().is_err(), "accepted {:?}", s);
    }
}

#[test]
fn test_config_rejects_malformed_yaml() {
    assert!(AppConfig::load_from_str("role: [broken").is_err());
    assert!(AppConfig::load_from_str("role: pilot\nnetwork: {interface: eth0}").is_err());
}

#[test]
fn test_config_rejects_out_of_range_values() {
    let yaml = r#"
role: server
listen:
  addr: "0.0.0.0:9000"
network:
  interface: eth0
  port: 9000
  ipv4:
    addr: 192.0.2.1
    router: "aa:bb:cc:dd:ee:ff"
transport:
  protocol: kcp
  kcp:
    key: secret
    mtu: 40000
    guard_magic: "LONGMAGIC"
"#;
    let err = AppConfig::load_from_str(yaml).unwrap_err().to_string();
    assert!(err.contains("MTU"));
    assert!(err.contains("guard_magic"));
}

/// 裸流量打进 guard 开启的传输：全部拦下，读方只会等到超时
#[tokio::test]
async fn test_junk_packets_are_dropped_by_guard() {
    let cancel = CancellationToken::new();
    let cfg = common::kcp_cfg("fuzz-secret");
    let (a_addr, b_addr) = common::addrs();

    let (in_tx, in_rx) = tokio::sync::mpsc::channel(64);
    let (out_tx, _out_rx) = tokio::sync::mpsc::channel(64);
    let guarded = PacketConn::in_memory(
        b_addr,
        paqet::socket::GuardState::new(&cfg),
        in_rx,
        out_tx,
        &cancel,
    );
    for _ in 0..8 {
        in_tx
            .send((bytes::Bytes::from_static(b"garbage frame"), a_addr))
            .await
            .unwrap();
    }

    guarded.set_read_deadline(Some(std::time::Instant::now() + Duration::from_millis(100)));
    let mut buf = [0u8; 1500];
    let err = guarded.read_from(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
}

#[tokio::test]
async fn test_ping_unknown_type_response_is_error() {
    // a PONG must carry PPONG, anything else fails the connection test
    let cancel = CancellationToken::new();
    let cfg = common::kcp_cfg("fuzz-secret");
    let (client, server, _listener) = common::linked_pair(&cfg, &cancel).await;

    tokio::spawn(async move {
        loop {
            let Ok(mut strm) = server.accept_stream().await else { return };
            tokio::spawn(async move {
                if Proto::read_from(&mut strm).await.is_ok() {
                    // answer with the wrong type on purpose
                    let _ = Proto::new(PUDP).write_to(&mut strm).await;
                }
            });
        }
    });

    let err = client.ping(true).await.unwrap_err();
    assert!(err.to_string().contains("unexpected response type"));
    cancel.cancel();
}
