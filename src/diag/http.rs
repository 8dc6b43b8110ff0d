/// 诊断 HTTP 端点
///
/// 仅绑定环回地址。极简的 HTTP/1.1 实现：读一次请求、按路径分发、
/// 写一个带 Content-Length 的响应。
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const HEALTHZ_PATH: &str = "/debug/paqet/healthz";
pub const STATUS_PATH: &str = "/debug/paqet/status";
pub const TEXT_PATH: &str = "/debug/paqet/text";

/// 启动诊断 HTTP 服务，直到 cancel 触发
pub async fn serve(addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    if !addr.ip().is_loopback() {
        anyhow::bail!("diagnostics endpoint must bind a loopback address, got {}", addr);
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind diagnostics endpoint on {}", addr))?;
    info!("diagnostics endpoints listening on http://{}", addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                match accepted {
                    Ok((mut stream, peer)) => {
                        tokio::spawn(async move {
                            if let Err(e) = handle_request(&mut stream).await {
                                debug!("diag request from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept diagnostics connection: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_request(stream: &mut tokio::net::TcpStream) -> Result<()> {
    let mut buffer = vec![0u8; 4096];
    let n = stream.read(&mut buffer).await?;

    let request = String::from_utf8_lossy(&buffer[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let response = match path {
        HEALTHZ_PATH => http_response("200 OK", "text/plain", "ok"),
        STATUS_PATH => {
            let json = serde_json::to_string_pretty(&super::snapshot()).unwrap_or_default();
            http_response("200 OK", "application/json", &json)
        }
        TEXT_PATH => {
            let text = super::format_text(&super::snapshot());
            http_response("200 OK", "text/plain; charset=utf-8", &text)
        }
        _ => http_response("404 Not Found", "text/plain", "404 Not Found"),
    };

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

/// `paqet status` 使用的最小 HTTP GET（仅限环回调试端点）
pub async fn fetch(addr: SocketAddr, path: &str, timeout: std::time::Duration) -> Result<String> {
    let body = tokio::time::timeout(timeout, async {
        let mut stream = tokio::net::TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to reach http://{}{}", addr, path))?;
        let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", path, addr);
        stream.write_all(request.as_bytes()).await?;
        let mut response = String::new();
        stream.read_to_string(&mut response).await?;
        Ok::<String, anyhow::Error>(response)
    })
    .await
    .with_context(|| format!("timed out reaching http://{}{}", addr, path))??;

    let (head, body) = body
        .split_once("\r\n\r\n")
        .context("malformed HTTP response")?;
    let status_line = head.lines().next().unwrap_or_default();
    if !status_line.contains("200") {
        anyhow::bail!("debug endpoint returned {}: {}", status_line, body);
    }
    Ok(body.to_string())
}
