/// 每条流的首帧协议头
///
/// 线上格式（全部大端）：
///
/// ```text
/// [1 byte]  type   (PING=0x01 PONG=0x02 TCPF=0x03 TCP=0x04 UDP=0x05)
/// [1 byte]  flags  (bit 0 = 带地址, bit 1 = 带 TCP 标志序列)
/// --- 带地址 ---
/// [2 bytes] host 长度 N
/// [N bytes] host (UTF-8)
/// [2 bytes] port
/// --- 带标志序列 ---
/// [1 byte]  条目数 (最多 255)
/// 每条:
///   [2 bytes] 标志位掩码 (FIN=0x01 SYN=0x02 RST=0x04 PSH=0x08 ACK=0x10
///                         URG=0x20 ECE=0x40 CWR=0x80 NS=0x100)
/// ```
use crate::config::TcpFlags;
use crate::tnet::Addr;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub type ProtoType = u8;

pub const PPING: ProtoType = 0x01;
pub const PPONG: ProtoType = 0x02;
pub const PTCPF: ProtoType = 0x03;
pub const PTCP: ProtoType = 0x04;
pub const PUDP: ProtoType = 0x05;

/// 防止畸形输入导致的 OOM
const MAX_PROTO_SIZE: u16 = 16 * 1024;

/// 可写主机名上限（DNS 名字上限 253 字节）
const MAX_HOST_LEN: usize = 253;

const FLAG_ADDR: u8 = 0x01;
const FLAG_TCPF: u8 = 0x02;

/// 编码缓冲上限：type(1) + flags(1) + 最大地址(2+253+2) + 最大标志序列(1+2*255)
const MAX_ENCODED_LEN: usize = 1 + 1 + 2 + MAX_HOST_LEN + 2 + 1 + 2 * 255;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proto {
    pub typ: ProtoType,
    pub addr: Option<Addr>,
    pub tcpf: Vec<TcpFlags>,
}

impl Proto {
    pub fn new(typ: ProtoType) -> Self {
        Proto {
            typ,
            addr: None,
            tcpf: Vec::new(),
        }
    }

    pub fn with_addr(typ: ProtoType, addr: Addr) -> Self {
        Proto {
            typ,
            addr: Some(addr),
            tcpf: Vec::new(),
        }
    }

    pub fn with_tcpf(typ: ProtoType, tcpf: Vec<TcpFlags>) -> Self {
        Proto {
            typ,
            addr: None,
            tcpf,
        }
    }

    /// 单次 write 编码整个头
    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = [0u8; MAX_ENCODED_LEN];
        let mut n = 0usize;

        buf[n] = self.typ;
        n += 1;

        let mut flags = 0u8;
        if self.addr.is_some() {
            flags |= FLAG_ADDR;
        }
        if !self.tcpf.is_empty() {
            flags |= FLAG_TCPF;
        }
        buf[n] = flags;
        n += 1;

        if let Some(addr) = &self.addr {
            let host = addr.host.as_bytes();
            if host.len() > MAX_HOST_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("proto: host too long ({} bytes)", host.len()),
                ));
            }
            buf[n..n + 2].copy_from_slice(&(host.len() as u16).to_be_bytes());
            n += 2;
            buf[n..n + host.len()].copy_from_slice(host);
            n += host.len();
            buf[n..n + 2].copy_from_slice(&addr.port.to_be_bytes());
            n += 2;
        }

        if !self.tcpf.is_empty() {
            if self.tcpf.len() > 255 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("proto: too many TCPF entries ({})", self.tcpf.len()),
                ));
            }
            buf[n] = self.tcpf.len() as u8;
            n += 1;
            for f in &self.tcpf {
                buf[n..n + 2].copy_from_slice(&f.bits().to_be_bytes());
                n += 2;
            }
        }

        w.write_all(&buf[..n]).await?;
        w.flush().await
    }

    /// 读取并解析一个头；任何短读都是流错误
    pub async fn read_from<R>(r: &mut R) -> io::Result<Proto>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut hdr = [0u8; 2];
        r.read_exact(&mut hdr).await?;
        let mut p = Proto::new(hdr[0]);
        let flags = hdr[1];

        if flags & FLAG_ADDR != 0 {
            let mut lb = [0u8; 2];
            r.read_exact(&mut lb).await?;
            let host_len = u16::from_be_bytes(lb);
            if host_len > MAX_PROTO_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("proto: host length {} exceeds max", host_len),
                ));
            }
            let mut host = vec![0u8; host_len as usize];
            r.read_exact(&mut host).await?;
            let mut pb = [0u8; 2];
            r.read_exact(&mut pb).await?;
            let host = String::from_utf8(host).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "proto: host is not UTF-8")
            })?;
            p.addr = Some(Addr::new(host, u16::from_be_bytes(pb)));
        }

        if flags & FLAG_TCPF != 0 {
            let mut cb = [0u8; 1];
            r.read_exact(&mut cb).await?;
            let count = cb[0] as usize;
            p.tcpf = Vec::with_capacity(count);
            for _ in 0..count {
                let mut fb = [0u8; 2];
                r.read_exact(&mut fb).await?;
                p.tcpf.push(TcpFlags::from_bits(u16::from_be_bytes(fb)));
            }
        }

        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(p: &Proto) -> Proto {
        let mut buf = Vec::new();
        p.write_to(&mut buf).await.unwrap();
        Proto::read_from(&mut io::Cursor::new(buf)).await.unwrap()
    }

    #[tokio::test]
    async fn test_ping_pong_round_trip() {
        for typ in [PPING, PPONG, PTCPF, PTCP, PUDP] {
            let p = Proto::new(typ);
            let got = round_trip(&p).await;
            assert_eq!(got, p);
        }
    }

    #[tokio::test]
    async fn test_addr_round_trip() {
        let p = Proto::with_addr(PTCP, Addr::new("example.com".to_string(), 443));
        let got = round_trip(&p).await;
        assert_eq!(got.addr.unwrap().to_string(), "example.com:443");
    }

    #[tokio::test]
    async fn test_addr_port_extremes() {
        for port in [0u16, 1, 65535] {
            let p = Proto::with_addr(PUDP, Addr::new("h".to_string(), port));
            assert_eq!(round_trip(&p).await.addr.unwrap().port, port);
        }
    }

    #[tokio::test]
    async fn test_max_host_len_writable() {
        let host = "a".repeat(253);
        let p = Proto::with_addr(PTCP, Addr::new(host.clone(), 80));
        assert_eq!(round_trip(&p).await.addr.unwrap().host, host);

        let too_long = Proto::with_addr(PTCP, Addr::new("a".repeat(254), 80));
        let mut buf = Vec::new();
        assert!(too_long.write_to(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_tcpf_round_trip() {
        let p = Proto::with_tcpf(
            PTCPF,
            vec![
                TcpFlags::from_bits(0x1FF),
                TcpFlags::PSH_ACK,
                TcpFlags::from_bits(0x02),
            ],
        );
        let got = round_trip(&p).await;
        assert_eq!(got.tcpf.len(), 3);
        assert_eq!(got.tcpf[0].bits(), 0x1FF);
        assert_eq!(got.tcpf[1], TcpFlags::PSH_ACK);
        assert!(got.tcpf[2].syn);
    }

    #[tokio::test]
    async fn test_max_tcpf_entries() {
        let p = Proto::with_tcpf(PTCPF, vec![TcpFlags::ACK; 255]);
        assert_eq!(round_trip(&p).await.tcpf.len(), 255);
    }

    #[tokio::test]
    async fn test_worst_case_header_fits_encoder() {
        // 最长地址 + 满员标志序列同时出现
        let p = Proto {
            typ: PTCP,
            addr: Some(Addr::new("a".repeat(253), 65535)),
            tcpf: vec![TcpFlags::from_bits(0x1FF); 255],
        };
        let mut buf = Vec::new();
        p.write_to(&mut buf).await.unwrap();
        assert_eq!(buf.len(), 1 + 1 + 2 + 253 + 2 + 1 + 2 * 255);
        let got = Proto::read_from(&mut io::Cursor::new(buf)).await.unwrap();
        assert_eq!(got, p);
    }

    #[tokio::test]
    async fn test_too_many_tcpf_entries_rejected() {
        let p = Proto::with_tcpf(PTCPF, vec![TcpFlags::ACK; 256]);
        let mut buf = Vec::new();
        let err = p.write_to(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("too many TCPF entries"));
    }

    #[tokio::test]
    async fn test_decoder_rejects_oversized_host_len() {
        // type=PTCP, flags=addr, hostLen=0x7FFF > 16384
        let raw = vec![PTCP, FLAG_ADDR, 0x7F, 0xFF];
        let err = Proto::read_from(&mut io::Cursor::new(raw)).await.unwrap_err();
        assert!(err.to_string().contains("host length"));
        assert!(err.to_string().contains("exceeds max"));
    }

    #[tokio::test]
    async fn test_decoder_rejects_truncated_header() {
        let full = {
            let mut buf = Vec::new();
            Proto::with_addr(PTCP, Addr::new("example.com".to_string(), 443))
                .write_to(&mut buf)
                .await
                .unwrap();
            buf
        };
        // every strict prefix must fail with an EOF-class error
        for cut in 1..full.len() {
            let err = Proto::read_from(&mut io::Cursor::new(full[..cut].to_vec()))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof, "cut at {}", cut);
        }
    }
}
