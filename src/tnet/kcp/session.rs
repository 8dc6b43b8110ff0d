/// KCP 会话
///
/// 一个 tokio 任务独占 KCP 控制块（run loop）：
/// - poll_write 把数据追加到共享的合并写缓冲（Mutex，O(1) memcpy），
///   缓冲从空变非空时唤醒 run loop —— N 次小写合并成每周期一次 kcp.send
/// - poll_read 从 unbounded channel 收数据 ← run loop 排空 kcp.recv()
/// - input() 经 unbounded channel 把线上报文送进 run loop 调 kcp.input()
///
/// 同时实现 tokio 与 futures 两套 AsyncRead/AsyncWrite，yamux 直接叠加。
use crate::config::{KcpConfig, KcpTuning};
use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;

/// 两端共享的会话标识；会话按对端地址区分
pub(crate) const KCP_CONV: u32 = 0x70_61_71_31; // "paq1"

/// 保活节奏：静默探测间隔 / 判死超时
pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);
pub(crate) const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(8);

struct KcpOutput {
    tx: tokio::sync::mpsc::UnboundedSender<Bytes>,
}

impl Write for KcpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.tx.send(Bytes::copy_from_slice(buf));
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct WriteBuffer {
    data: BytesMut,
    waker: Option<Waker>,
}

/// 向 run loop 投喂线上报文的句柄
#[derive(Clone)]
pub(crate) struct SessionInput {
    input_tx: tokio::sync::mpsc::UnboundedSender<Bytes>,
    closed: Arc<AtomicBool>,
}

impl SessionInput {
    /// 会话已死时返回 false
    pub(crate) fn input(&self, data: &[u8]) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.input_tx.send(Bytes::copy_from_slice(data)).is_ok()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

pub(crate) struct KcpSession {
    write_buf: Arc<Mutex<WriteBuffer>>,
    write_notify: Arc<Notify>,
    read_rx: tokio::sync::mpsc::UnboundedReceiver<Bytes>,
    closed: Arc<AtomicBool>,
    recv_buf: BytesMut,
    max_write_buf: usize,
}

impl KcpSession {
    /// out_tx 收到的是明文 KCP 报文；加密与落盘由 wire pump 负责
    pub(crate) fn new(
        cfg: &KcpConfig,
        mtu: usize,
        out_tx: tokio::sync::mpsc::UnboundedSender<Bytes>,
    ) -> (KcpSession, SessionInput) {
        // stream mode: smux-style byte streams, no per-message framing
        let mut kcp_cb = kcp::Kcp::new_stream(KCP_CONV, KcpOutput { tx: out_tx });
        let t: KcpTuning = cfg.tuning();
        kcp_cb.set_nodelay(t.nodelay, t.interval, t.resend, t.nocongestion);
        kcp_cb.set_wndsize(cfg.sndwnd, cfg.rcvwnd);
        let _ = kcp_cb.set_mtu(mtu);

        let write_buf = Arc::new(Mutex::new(WriteBuffer {
            data: BytesMut::with_capacity(8192),
            waker: None,
        }));
        let write_notify = Arc::new(Notify::new());
        let (read_tx, read_rx) = tokio::sync::mpsc::unbounded_channel::<Bytes>();
        let (input_tx, input_rx) = tokio::sync::mpsc::unbounded_channel::<Bytes>();
        let closed = Arc::new(AtomicBool::new(false));

        {
            let wb = write_buf.clone();
            let wn = write_notify.clone();
            let closed = closed.clone();
            tokio::spawn(run_loop(kcp_cb, t, wb, wn, read_tx, input_rx, closed));
        }

        let session = KcpSession {
            write_buf,
            write_notify,
            read_rx,
            closed: closed.clone(),
            recv_buf: BytesMut::new(),
            max_write_buf: cfg.streambuf.max(8 * 1024),
        };
        (session, SessionInput { input_tx, closed })
    }

    pub(crate) fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

fn do_write(
    write_buf: &Mutex<WriteBuffer>,
    write_notify: &Notify,
    closed: &AtomicBool,
    max_write_buf: usize,
    cx: &mut Context<'_>,
    buf: &[u8],
) -> Poll<io::Result<usize>> {
    if closed.load(Ordering::Relaxed) {
        return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed")));
    }
    let mut wb = write_buf.lock().unwrap();
    if wb.data.len() >= max_write_buf {
        wb.waker = Some(cx.waker().clone());
        return Poll::Pending;
    }
    let was_empty = wb.data.is_empty();
    wb.data.extend_from_slice(buf);
    drop(wb);
    if was_empty {
        write_notify.notify_one();
    }
    Poll::Ready(Ok(buf.len()))
}

fn do_flush(write_notify: &Notify) -> Poll<io::Result<()>> {
    write_notify.notify_one();
    Poll::Ready(Ok(()))
}

fn do_close(closed: &AtomicBool) -> Poll<io::Result<()>> {
    closed.store(true, Ordering::Relaxed);
    Poll::Ready(Ok(()))
}

fn do_read(
    recv_buf: &mut BytesMut,
    read_rx: &mut tokio::sync::mpsc::UnboundedReceiver<Bytes>,
    cx: &mut Context<'_>,
    buf: &mut [u8],
) -> Poll<io::Result<usize>> {
    if !recv_buf.is_empty() {
        let n = std::cmp::min(buf.len(), recv_buf.len());
        buf[..n].copy_from_slice(&recv_buf[..n]);
        recv_buf.advance(n);
        return Poll::Ready(Ok(n));
    }
    match read_rx.poll_recv(cx) {
        Poll::Ready(Some(data)) => {
            let n = std::cmp::min(buf.len(), data.len());
            buf[..n].copy_from_slice(&data[..n]);
            if n < data.len() {
                recv_buf.extend_from_slice(&data[n..]);
            }
            Poll::Ready(Ok(n))
        }
        Poll::Ready(None) => Poll::Ready(Ok(0)),
        Poll::Pending => Poll::Pending,
    }
}

impl AsyncRead for KcpSession {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        let slice = buf.initialize_unfilled();
        match do_read(&mut me.recv_buf, &mut me.read_rx, cx, slice) {
            Poll::Ready(Ok(n)) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for KcpSession {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        do_write(&self.write_buf, &self.write_notify, &self.closed, self.max_write_buf, cx, buf)
    }
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        do_flush(&self.write_notify)
    }
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        do_close(&self.closed)
    }
}

impl futures::io::AsyncRead for KcpSession {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let me = &mut *self;
        do_read(&mut me.recv_buf, &mut me.read_rx, cx, buf)
    }
}

impl futures::io::AsyncWrite for KcpSession {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        do_write(&self.write_buf, &self.write_notify, &self.closed, self.max_write_buf, cx, buf)
    }
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        do_flush(&self.write_notify)
    }
    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        do_close(&self.closed)
    }
}

impl Unpin for KcpSession {}

/// run loop：独占 KCP 控制块，排空合并写缓冲与输入队列，
/// 把 kcp.recv() 的数据转发给读 channel。
async fn run_loop(
    mut kcp_cb: kcp::Kcp<KcpOutput>,
    tuning: KcpTuning,
    write_buf: Arc<Mutex<WriteBuffer>>,
    write_notify: Arc<Notify>,
    read_tx: tokio::sync::mpsc::UnboundedSender<Bytes>,
    mut input_rx: tokio::sync::mpsc::UnboundedReceiver<Bytes>,
    closed: Arc<AtomicBool>,
) {
    let start = Instant::now();
    let now_ms = || start.elapsed().as_millis() as u32;
    let _ = kcp_cb.update(now_ms());

    let mut last_recv = Instant::now();
    let mut last_probe = Instant::now();

    loop {
        if closed.load(Ordering::Relaxed) {
            return;
        }

        let now = now_ms();
        let check = kcp_cb.check(now);
        let delay = if check <= now { 1 } else { (check - now).min(50) };

        tokio::select! {
            biased;

            _ = write_notify.notified() => {
                drain_write_buf(&write_buf, &mut kcp_cb);
                if !tuning.wdelay {
                    let _ = kcp_cb.flush();
                }
                drain_recv(&mut kcp_cb, &read_tx);
            }

            recv = input_rx.recv() => {
                let Some(data) = recv else { closed.store(true, Ordering::Relaxed); return; };
                last_recv = Instant::now();
                let _ = kcp_cb.input(&data);
                while let Ok(more) = input_rx.try_recv() {
                    let _ = kcp_cb.input(&more);
                }
                drain_write_buf(&write_buf, &mut kcp_cb);
                if tuning.acknodelay {
                    let _ = kcp_cb.flush();
                }
                drain_recv(&mut kcp_cb, &read_tx);
            }

            _ = tokio::time::sleep(Duration::from_millis(delay as u64)) => {
                drain_write_buf(&write_buf, &mut kcp_cb);
                let _ = kcp_cb.update(now_ms());
                drain_recv(&mut kcp_cb, &read_tx);
            }
        }

        // Dead-peer detection: unacked data plus prolonged input silence, or
        // the control block giving up on retransmits.
        if last_probe.elapsed() >= KEEPALIVE_INTERVAL {
            last_probe = Instant::now();
            if kcp_cb.is_dead_link()
                || (kcp_cb.wait_snd() > 0 && last_recv.elapsed() > KEEPALIVE_TIMEOUT)
            {
                closed.store(true, Ordering::Relaxed);
                return;
            }
        }
    }
}

/// 把合并写缓冲灌进 KCP 发送队列。
/// 按 8KB 分段发送，接收端可以增量收取而不是等待一个巨型消息重组。
fn drain_write_buf(write_buf: &Mutex<WriteBuffer>, kcp_cb: &mut kcp::Kcp<KcpOutput>) {
    let mut wb = write_buf.lock().unwrap();
    if wb.data.is_empty() {
        return;
    }
    let data = wb.data.split();
    let waker = wb.waker.take();
    drop(wb);
    for chunk in data.chunks(8192) {
        let _ = kcp_cb.send(chunk);
    }
    if let Some(w) = waker {
        w.wake();
    }
}

fn drain_recv(kcp_cb: &mut kcp::Kcp<KcpOutput>, read_tx: &tokio::sync::mpsc::UnboundedSender<Bytes>) {
    loop {
        match kcp_cb.peeksize() {
            Ok(n) if n > 0 => {
                let mut buf = BytesMut::zeroed(n);
                match kcp_cb.recv(&mut buf) {
                    Ok(sz) => {
                        buf.truncate(sz);
                        if read_tx.send(buf.freeze()).is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
            _ => return,
        }
    }
}

#[cfg(test)]
pub(crate) fn session_pair(cfg: &KcpConfig) -> (KcpSession, KcpSession) {
    let (a_out_tx, mut a_out_rx) = tokio::sync::mpsc::unbounded_channel::<Bytes>();
    let (b_out_tx, mut b_out_rx) = tokio::sync::mpsc::unbounded_channel::<Bytes>();

    let (a, a_input) = KcpSession::new(cfg, cfg.mtu, a_out_tx);
    let (b, b_input) = KcpSession::new(cfg, cfg.mtu, b_out_tx);

    tokio::spawn(async move {
        while let Some(pkt) = a_out_rx.recv().await {
            if !b_input.input(&pkt) {
                return;
            }
        }
    });
    tokio::spawn(async move {
        while let Some(pkt) = b_out_rx.recv().await {
            if !a_input.input(&pkt) {
                return;
            }
        }
    });

    (a, b)
}
