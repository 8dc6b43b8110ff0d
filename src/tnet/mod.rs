/// 可靠传输层：KCP 会话 + yamux 流多路复用
mod addr;
pub mod crypto;
pub mod kcp;

pub use addr::Addr;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};

/// 一条多路复用流
///
/// 包装 yamux::Stream，附带流 ID 与对端地址；实现 tokio 的
/// AsyncRead/AsyncWrite，供协议头编解码和拷贝层直接使用。
#[derive(Debug)]
pub struct Strm {
    inner: Compat<yamux::Stream>,
    sid: u64,
    peer: SocketAddr,
}

impl Strm {
    pub(crate) fn new(stream: yamux::Stream, sid: u64, peer: SocketAddr) -> Strm {
        Strm {
            inner: stream.compat(),
            sid,
            peer,
        }
    }

    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl AsyncRead for Strm {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Strm {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
