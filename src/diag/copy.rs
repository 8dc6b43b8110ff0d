/// 带持续重试的单向拷贝
///
/// 瞬时背压（ENOBUFS/ENOMEM/EAGAIN）分两段重试：
/// 阶段一快速指数退避（200µs→20ms，累计 500ms），
/// 阶段二固定 100ms 稳态重试；单次背压事件累计等待上限 30s。
/// 任何字节流动都会重置两个计数。
use super::benign::{is_no_buffer_or_no_mem, is_transient_backpressure};
use super::{add_enobufs_retry, add_enobufs_sustained, add_tcp_down, add_tcp_up, add_udp_down, add_udp_up};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BURST_BUDGET: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_millis(20);
const SUSTAINED_WAIT: Duration = Duration::from_millis(100);
const MAX_TOTAL_WAIT: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_micros(200);

// 128KB balances throughput (fewer read/write cycles) against memory on 4GB
// boxes: 500 concurrent streams x 2 directions = 128MB worst-case.
const COPY_BUF_SIZE: usize = 128 * 1024;

struct RetryState {
    backoff: Duration,
    total_slept: Duration,
}

impl RetryState {
    fn new() -> Self {
        Self {
            backoff: INITIAL_BACKOFF,
            total_slept: Duration::ZERO,
        }
    }

    fn reset(&mut self) {
        self.backoff = INITIAL_BACKOFF;
        self.total_slept = Duration::ZERO;
    }

    /// 按阶段退避一次；超出单事件上限时返回 false
    async fn sleep_transient(&mut self, err: &io::Error) -> bool {
        if is_no_buffer_or_no_mem(err) {
            add_enobufs_retry();
        }
        if self.total_slept >= MAX_TOTAL_WAIT {
            return false;
        }
        if self.total_slept >= BURST_BUDGET {
            if is_no_buffer_or_no_mem(err) {
                add_enobufs_sustained();
            }
            tokio::time::sleep(SUSTAINED_WAIT).await;
            self.total_slept += SUSTAINED_WAIT;
            return true;
        }
        tokio::time::sleep(self.backoff).await;
        self.total_slept += self.backoff;
        if self.backoff < MAX_BACKOFF {
            self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        }
        true
    }
}

/// 从 src 拷贝到 dst，返回 (已写字节数, 结果)
pub async fn copy_with_retry<R, W>(src: &mut R, dst: &mut W) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut state = RetryState::new();
    let mut written: u64 = 0;

    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => return (written, Ok(())),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return (written, Ok(())),
            Err(e) if is_transient_backpressure(&e) => {
                if !state.sleep_transient(&e).await {
                    return (written, Err(e));
                }
                continue;
            }
            Err(e) => return (written, Err(e)),
        };

        match write_full_with_retry(dst, &buf[..n], &mut state).await {
            Ok(w) => {
                written += w as u64;
                if w > 0 {
                    state.reset();
                }
            }
            Err((w, e)) => {
                written += w as u64;
                return (written, Err(e));
            }
        }
    }
}

/// 把整个切片写入 dst；瞬时背压按两段策略重试
async fn write_full_with_retry<W>(
    dst: &mut W,
    mut p: &[u8],
    state: &mut RetryState,
) -> Result<usize, (usize, io::Error)>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0usize;
    while !p.is_empty() {
        match dst.write(p).await {
            Ok(0) => {
                return Err((written, io::Error::new(io::ErrorKind::WriteZero, "write returned 0")))
            }
            Ok(n) => {
                written += n;
                p = &p[n..];
                state.reset();
            }
            Err(e) if is_transient_backpressure(&e) => {
                if !state.sleep_transient(&e).await {
                    return Err((written, e));
                }
            }
            Err(e) => return Err((written, e)),
        }
    }
    Ok(written)
}

pub async fn copy_tcp_up<R, W>(src: &mut R, dst: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let (n, res) = copy_with_retry(src, dst).await;
    add_tcp_up(n);
    res
}

pub async fn copy_tcp_down<R, W>(src: &mut R, dst: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let (n, res) = copy_with_retry(src, dst).await;
    add_tcp_down(n);
    res
}

pub async fn copy_udp_up<R, W>(src: &mut R, dst: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let (n, res) = copy_with_retry(src, dst).await;
    add_udp_up(n);
    res
}

pub async fn copy_udp_down<R, W>(src: &mut R, dst: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let (n, res) = copy_with_retry(src, dst).await;
    add_udp_down(n);
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::benign::enobufs;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};

    /// 前 fail_times 次写返回 ENOBUFS，之后成功
    struct FlakyWriter {
        fails_left: Arc<AtomicUsize>,
        written: Vec<u8>,
    }

    impl AsyncWrite for FlakyWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.fails_left.load(Ordering::Relaxed) > 0 {
                self.fails_left.fetch_sub(1, Ordering::Relaxed);
                return Poll::Ready(Err(enobufs()));
            }
            self.written.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_copy_plain() {
        let mut src = io::Cursor::new(b"hello copy".to_vec());
        let mut dst = Vec::new();
        let (n, res) = copy_with_retry(&mut src, &mut dst).await;
        res.unwrap();
        assert_eq!(n, 10);
        assert_eq!(dst, b"hello copy");
    }

    #[tokio::test]
    async fn test_copy_retries_through_enobufs_burst() {
        crate::diag::enable(true);
        let mut src = io::Cursor::new(b"pressure".to_vec());
        let mut dst = FlakyWriter {
            fails_left: Arc::new(AtomicUsize::new(5)),
            written: Vec::new(),
        };
        let (n, res) = copy_with_retry(&mut src, &mut dst).await;
        res.unwrap();
        assert_eq!(n, 8);
        assert_eq!(dst.written, b"pressure");
        assert!(crate::diag::snapshot().enobufs_retries >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_gives_up_after_total_cap() {
        struct AlwaysEnobufs;
        impl AsyncWrite for AlwaysEnobufs {
            fn poll_write(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &[u8],
            ) -> Poll<io::Result<usize>> {
                Poll::Ready(Err(enobufs()))
            }
            fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }
            fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }
        }

        let mut src = io::Cursor::new(b"never lands".to_vec());
        let mut dst = AlwaysEnobufs;
        let start = tokio::time::Instant::now();
        let (n, res) = copy_with_retry(&mut src, &mut dst).await;
        assert_eq!(n, 0);
        let err = res.unwrap_err();
        assert!(is_no_buffer_or_no_mem(&err));
        // cumulative sleep stops at the 30s per-episode cap
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30), "gave up too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(31), "overslept: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_progress_resets_retry_state() {
        crate::diag::enable(true);
        let fails = Arc::new(AtomicUsize::new(2));
        let mut src = io::Cursor::new(vec![0xAA; 4096]);
        let mut dst = FlakyWriter {
            fails_left: fails.clone(),
            written: Vec::new(),
        };
        let (n, res) = copy_with_retry(&mut src, &mut dst).await;
        res.unwrap();
        assert_eq!(n, 4096);
        assert_eq!(fails.load(Ordering::Relaxed), 0);
    }
}
