/// KCP 报文级块加密
///
/// 每个 KCP 报文独立封装：nonce(12) ‖ AES-256-GCM(密文+tag)。
/// 密钥用 PBKDF2-HMAC-SHA256 从共享密钥派生（盐 "paqet_block"）。
/// `none`/`null` 直通。解密失败静默丢弃——guard 之后这里是第二道闸。
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use sha2::Sha256;

const BLOCK_KDF_SALT: &[u8] = b"paqet_block";
const BLOCK_KDF_ROUNDS: u32 = 4096;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub enum BlockCipher {
    Plain,
    AesGcm(Box<Aes256Gcm>),
}

impl BlockCipher {
    pub fn new(block: &str, key: &str) -> crate::Result<BlockCipher> {
        match block {
            "none" | "null" => Ok(BlockCipher::Plain),
            "aes" | "aes-gcm" => {
                if key.is_empty() {
                    return Err(crate::TunnelError::config_error(
                        "KCP encryption key is required",
                    ));
                }
                let mut dk = [0u8; 32];
                pbkdf2::pbkdf2_hmac::<Sha256>(key.as_bytes(), BLOCK_KDF_SALT, BLOCK_KDF_ROUNDS, &mut dk);
                Ok(BlockCipher::AesGcm(Box::new(
                    Aes256Gcm::new_from_slice(&dk).expect("derived key is 32 bytes"),
                )))
            }
            other => Err(crate::TunnelError::config_error(format!(
                "unknown encryption block '{}'",
                other
            ))),
        }
    }

    /// 每报文的封装开销
    pub fn overhead(&self) -> usize {
        match self {
            BlockCipher::Plain => 0,
            BlockCipher::AesGcm(_) => NONCE_LEN + TAG_LEN,
        }
    }

    pub fn seal(&self, plain: &[u8]) -> Vec<u8> {
        match self {
            BlockCipher::Plain => plain.to_vec(),
            BlockCipher::AesGcm(cipher) => {
                let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
                let ct = cipher.encrypt(&nonce, plain).expect("aes-gcm seal");
                let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ct);
                out
            }
        }
    }

    pub fn open(&self, packet: &[u8]) -> Option<Vec<u8>> {
        match self {
            BlockCipher::Plain => Some(packet.to_vec()),
            BlockCipher::AesGcm(cipher) => {
                if packet.len() < NONCE_LEN + TAG_LEN {
                    return None;
                }
                let (nonce, ct) = packet.split_at(NONCE_LEN);
                cipher.decrypt(Nonce::from_slice(nonce), ct).ok()
            }
        }
    }
}
