/// 入站捕获线程
///
/// 独占一个抓包接收端，阻塞读帧、解析、按本端端口过滤
/// （等价于 BPF 的 `tcp and dst port N`），把 TCP 负载拷贝成
/// 稳定的 Bytes 后交给异步侧。捕获超时不是错误，只表示暂时无帧。
use super::parse::parse_ether_ip_tcp;
use bytes::Bytes;
use pnet::datalink::DataLinkReceiver;
use std::io;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub(crate) const RECV_QUEUE_DEPTH: usize = 1024;

pub(crate) fn spawn_capture(
    mut rx: Box<dyn DataLinkReceiver>,
    local_port: u16,
    tx: tokio::sync::mpsc::Sender<(Bytes, SocketAddr)>,
    cancel: CancellationToken,
) {
    std::thread::Builder::new()
        .name("paqet-capture".to_string())
        .spawn(move || {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let frame = match rx.next() {
                    Ok(frame) => frame,
                    Err(e) if is_capture_timeout(&e) => continue,
                    Err(e) => {
                        // Handle loss is fatal for this transport; dropping tx
                        // surfaces the error to the next read_from call.
                        error!("packet capture failed fatally: {}", e);
                        return;
                    }
                };

                let parsed = match parse_ether_ip_tcp(frame) {
                    Some(p) => p,
                    None => continue,
                };
                if parsed.dst_port != local_port || parsed.payload.is_empty() {
                    continue;
                }

                // Capture buffers are reused by the kernel ring; copy out
                // before handing the payload to the async side.
                let payload = Bytes::copy_from_slice(parsed.payload);
                let addr = SocketAddr::new(parsed.src_ip, parsed.src_port);
                if tx.blocking_send((payload, addr)).is_err() {
                    debug!("capture queue closed, stopping capture thread");
                    return;
                }
            }
        })
        .expect("failed to spawn capture thread");
}

/// 有限超时下 libpcap/AF_PACKET 会周期性返回超时伪错误
fn is_capture_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
