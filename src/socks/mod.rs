/// SOCKS5 前端（仅客户端角色）
///
/// 只支持 NO AUTH。CONNECT 走隧道 TCP 流；UDP ASSOCIATE 在本地
/// 开一个中继端口，数据报按 5 元组复用隧道 UDP 流。
use crate::client::Client;
use crate::diag;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

const SOCKS_VER: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;

const UDP_RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(8);

pub struct SocksServer {
    client: Arc<Client>,
    listen_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl SocksServer {
    pub fn new(
        client: Arc<Client>,
        listen_addr: SocketAddr,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> SocksServer {
        SocksServer {
            client,
            listen_addr,
            cancel,
            tracker,
        }
    }

    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await.inspect_err(|e| {
            error!("failed to bind SOCKS5 listener on {}: {}", self.listen_addr, e);
        })?;
        info!("SOCKS5 proxy listening on {}", self.listen_addr);

        loop {
            let (conn, peer) = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                r = listener.accept() => match r {
                    Ok(v) => v,
                    Err(e) => {
                        error!("failed to accept SOCKS5 connection: {}", e);
                        continue;
                    }
                },
            };

            let server = self.clone();
            self.tracker.spawn(async move {
                if let Err(e) = server.handle_conn(conn, peer).await {
                    if !diag::is_benign_stream_err(&e) {
                        debug!("SOCKS5 connection from {} failed: {}", peer, e);
                    }
                }
            });
        }
    }

    async fn handle_conn(&self, mut conn: TcpStream, peer: SocketAddr) -> io::Result<()> {
        // greeting: VER NMETHODS METHODS...
        let mut hdr = [0u8; 2];
        conn.read_exact(&mut hdr).await?;
        if hdr[0] != SOCKS_VER {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not SOCKS5"));
        }
        let mut methods = vec![0u8; hdr[1] as usize];
        conn.read_exact(&mut methods).await?;
        conn.write_all(&[SOCKS_VER, METHOD_NONE]).await?;

        // request: VER CMD RSV ATYP ...
        let mut req = [0u8; 4];
        conn.read_exact(&mut req).await?;
        let target = read_socks_addr(&mut conn, req[3]).await?;

        match req[1] {
            CMD_CONNECT => {
                debug!("SOCKS5 CONNECT from {} to {}", peer, target);
                self.handle_connect(conn, peer, &target).await
            }
            CMD_UDP_ASSOCIATE => {
                debug!("SOCKS5 UDP_ASSOCIATE from {}", peer);
                self.handle_udp_associate(conn, peer).await
            }
            cmd => {
                debug!("unsupported SOCKS5 command {} from {}", cmd, peer);
                write_reply(&mut conn, REP_CMD_NOT_SUPPORTED, self.listen_addr).await?;
                Ok(())
            }
        }
    }

    async fn handle_connect(
        &self,
        mut conn: TcpStream,
        peer: SocketAddr,
        target: &str,
    ) -> io::Result<()> {
        let local = conn.local_addr()?;
        write_reply(&mut conn, REP_SUCCESS, local).await?;

        let strm = self
            .client
            .tcp(target)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string()))
            .inspect_err(|e| {
                error!(
                    "SOCKS5 failed to establish stream for {} -> {}: {}",
                    peer, target, e
                );
            })?;
        let sid = strm.sid();
        debug!("SOCKS5 stream {} established for {} -> {}", sid, peer, target);

        let (mut cr, mut cw) = conn.into_split();
        let (mut sr, mut sw) = tokio::io::split(strm);
        let (err_up, err_down) = diag::bidi_copy(
            &self.cancel,
            async { diag::copy_tcp_up(&mut cr, &mut sw).await },
            async { diag::copy_tcp_down(&mut sr, &mut cw).await },
        )
        .await;

        if self.cancel.is_cancelled() {
            debug!("SOCKS5 connection {} -> {} closed due to shutdown", peer, target);
            return Ok(());
        }
        for (dir, result) in [("up", err_up), ("down", err_down)] {
            if let Err(e) = result {
                if !diag::is_benign_stream_err(&e) {
                    error!(
                        "SOCKS5 stream {} failed for {} -> {} ({}): {}",
                        sid, peer, target, dir, e
                    );
                }
            }
        }
        debug!("SOCKS5 connection {} -> {} closed", peer, target);
        Ok(())
    }

    /// UDP 中继：本地开一个 UDP 端口，客户端的封装数据报按目标
    /// 地址拆封后走池化的隧道 UDP 流
    async fn handle_udp_associate(&self, mut conn: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let bind_ip = conn.local_addr()?.ip();
        let relay = Arc::new(UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?);
        let relay_addr = relay.local_addr()?;
        write_reply(&mut conn, REP_SUCCESS, relay_addr).await?;
        debug!("SOCKS5 UDP relay for {} on {}", peer, relay_addr);

        let relay_loop = {
            let server_client = self.client.clone();
            let relay = relay.clone();
            let cancel = self.cancel.clone();
            let tracker = self.tracker.clone();
            async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let (n, from) = tokio::select! {
                        _ = cancel.cancelled() => return,
                        r = relay.recv_from(&mut buf) => match r {
                            Ok(v) => v,
                            Err(_) => return,
                        },
                    };

                    // RSV(2) FRAG(1) ATYP ADDR PORT DATA；不支持分片
                    let Some((target, data)) = parse_udp_request(&buf[..n]) else {
                        continue;
                    };
                    let Ok((strm, is_new, key)) =
                        server_client.udp(&from.to_string(), &target).await
                    else {
                        continue;
                    };
                    if strm.write_all(data).await.is_err() {
                        server_client.close_udp(key).await;
                        continue;
                    }
                    diag::add_udp_up(data.len() as u64);

                    if is_new {
                        let relay = relay.clone();
                        let client = server_client.clone();
                        let cancel = cancel.clone();
                        let target = target.clone();
                        tracker.spawn(async move {
                            pump_socks_replies(client, key, strm, relay, from, target, cancel).await;
                        });
                    }
                }
            }
        };

        // The association lives as long as the TCP control connection.
        let mut probe = [0u8; 1];
        tokio::select! {
            _ = relay_loop => {}
            _ = conn.read(&mut probe) => {}
            _ = self.cancel.cancelled() => {}
        }
        debug!("SOCKS5 UDP association for {} ended", peer);
        Ok(())
    }
}

/// 回程：隧道流 → SOCKS 封装 → 应用
async fn pump_socks_replies(
    client: Arc<Client>,
    key: u64,
    strm: Arc<crate::client::TrackedStream>,
    relay: Arc<UdpSocket>,
    peer: SocketAddr,
    target: String,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            r = strm.read_timeout(&mut buf, UDP_RELAY_IDLE_TIMEOUT) => match r {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            },
        };
        let Ok(taddr) = target.parse::<crate::tnet::Addr>() else { break };
        let packet = encode_udp_reply(&taddr, &buf[..n]);
        if relay.send_to(&packet, peer).await.is_err() {
            break;
        }
        diag::add_udp_down(n as u64);
    }
    client.close_udp(key).await;
}

async fn read_socks_addr(conn: &mut TcpStream, atyp: u8) -> io::Result<String> {
    match atyp {
        ATYP_IPV4 => {
            let mut b = [0u8; 6];
            conn.read_exact(&mut b).await?;
            let ip = IpAddr::from([b[0], b[1], b[2], b[3]]);
            Ok(format!("{}:{}", ip, u16::from_be_bytes([b[4], b[5]])))
        }
        ATYP_IPV6 => {
            let mut b = [0u8; 18];
            conn.read_exact(&mut b).await?;
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&b[..16]);
            Ok(format!(
                "[{}]:{}",
                IpAddr::from(ip),
                u16::from_be_bytes([b[16], b[17]])
            ))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await?;
            let mut host = vec![0u8; len[0] as usize];
            conn.read_exact(&mut host).await?;
            let mut port = [0u8; 2];
            conn.read_exact(&mut port).await?;
            let host = String::from_utf8(host)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad domain"))?;
            Ok(format!("{}:{}", host, u16::from_be_bytes(port)))
        }
        _ => Err(io::Error::new(io::ErrorKind::InvalidData, "bad ATYP")),
    }
}

async fn write_reply(conn: &mut TcpStream, rep: u8, bind: SocketAddr) -> io::Result<()> {
    let mut reply = Vec::with_capacity(4 + 16 + 2);
    reply.extend_from_slice(&[SOCKS_VER, rep, 0x00]);
    match bind.ip() {
        IpAddr::V4(ip) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&ip.octets());
        }
    }
    reply.extend_from_slice(&bind.port().to_be_bytes());
    conn.write_all(&reply).await
}

/// 解析 SOCKS5 UDP 请求封装，返回 (目标地址, 数据)
fn parse_udp_request(packet: &[u8]) -> Option<(String, &[u8])> {
    if packet.len() < 4 || packet[2] != 0 {
        // fragmented datagrams are not supported
        return None;
    }
    let atyp = packet[3];
    match atyp {
        ATYP_IPV4 => {
            if packet.len() < 10 {
                return None;
            }
            let ip = IpAddr::from([packet[4], packet[5], packet[6], packet[7]]);
            let port = u16::from_be_bytes([packet[8], packet[9]]);
            Some((format!("{}:{}", ip, port), &packet[10..]))
        }
        ATYP_IPV6 => {
            if packet.len() < 22 {
                return None;
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&packet[4..20]);
            let port = u16::from_be_bytes([packet[20], packet[21]]);
            Some((format!("[{}]:{}", IpAddr::from(ip), port), &packet[22..]))
        }
        ATYP_DOMAIN => {
            let len = *packet.get(4)? as usize;
            if packet.len() < 5 + len + 2 {
                return None;
            }
            let host = std::str::from_utf8(&packet[5..5 + len]).ok()?;
            let port = u16::from_be_bytes([packet[5 + len], packet[5 + len + 1]]);
            Some((format!("{}:{}", host, port), &packet[5 + len + 2..]))
        }
        _ => None,
    }
}

/// 把回程数据报包回 SOCKS5 UDP 封装
fn encode_udp_reply(target: &crate::tnet::Addr, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(22 + data.len());
    out.extend_from_slice(&[0, 0, 0]);
    match target.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            out.push(ATYP_DOMAIN);
            out.push(target.host.len() as u8);
            out.extend_from_slice(target.host.as_bytes());
        }
    }
    out.extend_from_slice(&target.port.to_be_bytes());
    out.extend_from_slice(data);
    out
}
