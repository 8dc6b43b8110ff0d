/// 错误分类
///
/// benign = 正常关闭/取消/超时，不应以 error 级别记录；
/// transient backpressure = 内核缓冲压力，重试而不是拆流。
use std::io;

/// ENOBUFS / ENOMEM，或 libpcap 风格的等价文本错误
pub fn is_no_buffer_or_no_mem(err: &io::Error) -> bool {
    if let Some(code) = err.raw_os_error() {
        // ENOBUFS=105, ENOMEM=12 (Linux); also matched portably below.
        if code == libc_enobufs() || code == libc_enomem() {
            return true;
        }
    }
    if err.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }
    let msg = err.to_string();
    msg.contains("No buffer space available") || msg.contains("Cannot allocate memory")
}

#[cfg(target_os = "linux")]
fn libc_enobufs() -> i32 {
    105
}
#[cfg(target_os = "linux")]
fn libc_enomem() -> i32 {
    12
}
#[cfg(not(target_os = "linux"))]
fn libc_enobufs() -> i32 {
    55
}
#[cfg(not(target_os = "linux"))]
fn libc_enomem() -> i32 {
    12
}

/// 是否为可重试的瞬时背压错误
///
/// 大流量下 splice/sendfile 路径会冒出 EAGAIN/EWOULDBLOCK，
/// 与 ENOBUFS/ENOMEM 一样按临时背压处理，短退避后重试而不是拆流。
pub fn is_transient_backpressure(err: &io::Error) -> bool {
    if is_no_buffer_or_no_mem(err) {
        return true;
    }
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    err.to_string().contains("Resource temporarily unavailable")
}

/// 是否为正常关闭/停机过程中预期出现的错误
pub fn is_benign_stream_err(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted => true,
        _ => {
            let msg = err.to_string();
            msg.contains("use of closed network connection")
                || msg.contains("context canceled")
                || msg.contains("connection is closed")
                || is_no_buffer_or_no_mem(err)
        }
    }
}

/// 构造 "deadline exceeded" 形状的错误
pub fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
}

/// 构造 "context canceled" 形状的错误
pub fn context_canceled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "context canceled")
}

/// 构造 ENOBUFS 形状的错误（测试和注入路径使用）
pub fn enobufs() -> io::Error {
    io::Error::from_raw_os_error(libc_enobufs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enobufs_detected_by_errno() {
        assert!(is_no_buffer_or_no_mem(&enobufs()));
        assert!(is_transient_backpressure(&enobufs()));
    }

    #[test]
    fn test_enobufs_detected_by_text() {
        let err = io::Error::new(io::ErrorKind::Other, "send: No buffer space available");
        assert!(is_no_buffer_or_no_mem(&err));
        let err = io::Error::new(io::ErrorKind::Other, "Cannot allocate memory");
        assert!(is_no_buffer_or_no_mem(&err));
    }

    #[test]
    fn test_eagain_is_transient_not_enobufs() {
        let err = io::Error::new(io::ErrorKind::WouldBlock, "try again");
        assert!(is_transient_backpressure(&err));
        assert!(!is_no_buffer_or_no_mem(&err));
    }

    #[test]
    fn test_benign_classification() {
        assert!(is_benign_stream_err(&deadline_exceeded()));
        assert!(is_benign_stream_err(&context_canceled()));
        assert!(is_benign_stream_err(&io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "early eof"
        )));
        assert!(!is_benign_stream_err(&io::Error::new(
            io::ErrorKind::PermissionDenied,
            "nope"
        )));
    }
}
