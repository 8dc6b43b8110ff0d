/// 双向拷贝
///
/// 并发运行两个方向的拷贝，任一方向完成或上层取消后，
/// 给另一方向最多 5 秒排空时间；到期未退出则填入超时错误并放弃
/// （future 被丢弃即强制中断，端点的关闭仍由调用方负责）。
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 必须短于服务端 10s 的停机定时器，避免进程退出时遗留任务
const FORCE_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

fn shutdown_timeout_err() -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        "bidi copy timeout waiting for task shutdown",
    )
}

/// 返回 (f1 的结果, f2 的结果)。benign 错误的判定由调用方处理。
pub async fn bidi_copy<F1, F2>(
    cancel: &CancellationToken,
    f1: F1,
    f2: F2,
) -> (io::Result<()>, io::Result<()>)
where
    F1: Future<Output = io::Result<()>>,
    F2: Future<Output = io::Result<()>>,
{
    tokio::pin!(f1);
    tokio::pin!(f2);

    let mut r1: Option<io::Result<()>> = None;
    let mut r2: Option<io::Result<()>> = None;

    // 等第一个方向结束，或者收到停机请求
    tokio::select! {
        r = &mut f1 => r1 = Some(r),
        r = &mut f2 => r2 = Some(r),
        _ = cancel.cancelled() => {}
    }

    let deadline = tokio::time::Instant::now() + FORCE_CLOSE_TIMEOUT;
    while r1.is_none() || r2.is_none() {
        tokio::select! {
            r = &mut f1, if r1.is_none() => r1 = Some(r),
            r = &mut f2, if r2.is_none() => r2 = Some(r),
            _ = tokio::time::sleep_until(deadline) => {
                if r1.is_none() {
                    r1 = Some(Err(shutdown_timeout_err()));
                }
                if r2.is_none() {
                    r2 = Some(Err(shutdown_timeout_err()));
                }
            }
        }
    }

    (r1.unwrap(), r2.unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::copy_with_retry;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_both_directions_complete() {
        let cancel = CancellationToken::new();
        let (r1, r2) = bidi_copy(
            &cancel,
            async { Ok(()) },
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(())
            },
        )
        .await;
        assert!(r1.is_ok());
        assert!(r2.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_direction_times_out_after_five_seconds() {
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        let (r1, r2) = bidi_copy(&cancel, async { Ok(()) }, std::future::pending()).await;
        assert!(r1.is_ok());
        let err = r2.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_unblocks_both() {
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            c.cancel();
        });
        let (r1, r2) = bidi_copy(&cancel, std::future::pending(), std::future::pending()).await;
        assert_eq!(r1.unwrap_err().kind(), io::ErrorKind::TimedOut);
        assert_eq!(r2.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_real_copy_pair() {
        let cancel = CancellationToken::new();
        let (client, server) = tokio::io::duplex(4096);
        let (_cr, mut cw) = tokio::io::split(client);
        let (mut sr, mut sw) = tokio::io::split(server);

        tokio::spawn(async move {
            sw.write_all(b"response bytes").await.unwrap();
            sw.shutdown().await.unwrap();
        });

        let mut sink = Vec::new();
        let mut src = io::Cursor::new(b"request bytes".to_vec());
        let (up, down) = bidi_copy(
            &cancel,
            async {
                let (_, r) = copy_with_retry(&mut src, &mut cw).await;
                let _ = cw.shutdown().await;
                r
            },
            async {
                let (n, r) = copy_with_retry(&mut sr, &mut sink).await;
                // server side reads the request we pushed up
                assert_eq!(n, 13);
                r
            },
        )
        .await;
        assert!(up.is_ok());
        assert!(down.is_ok());
    }
}
