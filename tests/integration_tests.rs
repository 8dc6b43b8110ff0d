/// 端到端集成：内存链路上的完整隧道栈
mod common;

use paqet::protocol::{Proto, PPING, PPONG, PTCP};
use paqet::tnet::kcp::Channel;
use paqet::{diag, ShutdownWait};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// 模拟服务端的流分发：PING→PONG，PTCP→回显
fn spawn_dispatcher(server: Channel) {
    tokio::spawn(async move {
        loop {
            let Ok(mut strm) = server.accept_stream().await else { return };
            tokio::spawn(async move {
                let Ok(p) = Proto::read_from(&mut strm).await else { return };
                match p.typ {
                    PPING => {
                        let mut pong = p;
                        pong.typ = PPONG;
                        let _ = pong.write_to(&mut strm).await;
                    }
                    PTCP => {
                        let mut buf = vec![0u8; 4096];
                        loop {
                            let Ok(n) = strm.read(&mut buf).await else { return };
                            if n == 0 {
                                return;
                            }
                            if strm.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ => {}
                }
            });
        }
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ping_over_fresh_tunnel() {
    diag::enable(true);
    let before = diag::snapshot();

    let cancel = CancellationToken::new();
    let cfg = common::kcp_cfg("integration-secret");
    let (client, server, _listener) = common::linked_pair(&cfg, &cancel).await;
    spawn_dispatcher(server);

    // PING/PONG must land inside the 5s ping deadline
    tokio::time::timeout(Duration::from_secs(5), client.ping(true))
        .await
        .expect("ping deadline")
        .expect("ping failed");

    let after = diag::snapshot();
    assert!(after.raw_up_packets >= before.raw_up_packets + 2);
    assert_eq!(after.guard_drops, before.guard_drops);
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_stream_echo_through_tunnel() {
    let cancel = CancellationToken::new();
    let cfg = common::kcp_cfg("integration-secret");
    let (client, server, _listener) = common::linked_pair(&cfg, &cancel).await;
    spawn_dispatcher(server);

    let mut strm = client.open_stream().await.unwrap();
    Proto::with_addr(PTCP, "example.org:80".parse().unwrap())
        .write_to(&mut strm)
        .await
        .unwrap();

    let payload: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();
    strm.write_all(&payload).await.unwrap();

    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(10), strm.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(echoed, payload);
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_streams_share_one_channel() {
    let cancel = CancellationToken::new();
    let cfg = common::kcp_cfg("integration-secret");
    let (client, server, _listener) = common::linked_pair(&cfg, &cancel).await;
    spawn_dispatcher(server);

    let client = Arc::new(client);
    let mut tasks = Vec::new();
    for i in 0..8u32 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let mut strm = client.open_stream().await.unwrap();
            Proto::with_addr(PTCP, "example.org:80".parse().unwrap())
                .write_to(&mut strm)
                .await
                .unwrap();
            let msg = format!("flow-{:02}-payload", i);
            strm.write_all(msg.as_bytes()).await.unwrap();
            let mut buf = vec![0u8; msg.len()];
            tokio::time::timeout(Duration::from_secs(10), strm.read_exact(&mut buf))
                .await
                .expect("read timed out")
                .unwrap();
            assert_eq!(buf, msg.as_bytes());
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_shutdown_drains_copies() {
    let cancel = CancellationToken::new();
    let cfg = common::kcp_cfg("integration-secret");
    let (client, server, _listener) = common::linked_pair(&cfg, &cancel).await;
    spawn_dispatcher(server);

    // a long-lived echo flow
    let mut strm = client.open_stream().await.unwrap();
    Proto::with_addr(PTCP, "example.org:80".parse().unwrap())
        .write_to(&mut strm)
        .await
        .unwrap();
    strm.write_all(b"warm up").await.unwrap();
    let mut buf = [0u8; 7];
    strm.read_exact(&mut buf).await.unwrap();

    let tracker = TaskTracker::new();
    {
        let cancel = cancel.clone();
        tracker.spawn(async move {
            let (r, w) = tokio::io::split(strm);
            let mut r = r;
            let mut w = w;
            let (_, _) = diag::bidi_copy(
                &cancel,
                async {
                    let mut sink = tokio::io::sink();
                    let (_, res) = diag::copy_with_retry(&mut r, &mut sink).await;
                    res
                },
                async {
                    // hold the write side open until shutdown
                    std::future::pending::<()>().await;
                    let _ = w.shutdown().await;
                    Ok(())
                },
            )
            .await;
        });
    }

    // SIGTERM-equivalent: cancel, then both directions must drain within 5s
    // plus scheduling slack
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let drained = ShutdownWait::new(tracker).wait(Duration::from_secs(7)).await;
    assert!(drained, "copy tasks failed to drain after cancellation");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_streams_fail_cleanly_after_channel_close() {
    let cancel = CancellationToken::new();
    let cfg = common::kcp_cfg("integration-secret");
    let (client, server, _listener) = common::linked_pair(&cfg, &cancel).await;
    spawn_dispatcher(server);

    client.close();
    let err = client.open_stream().await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    cancel.cancel();
}
