/// 前置过滤头（guard）
///
/// 在 KCP 解密之前用 12 字节头（magic(4) + cookie(8)）廉价地丢弃
/// 打到端口上的垃圾流量。cookie 按时间窗轮换：
///
///   cookie(win) = HMAC-SHA256(guard_key, magic ‖ be64(win))[..8]
///   guard_key   = PBKDF2-HMAC-SHA256(key, "paqet_guard", 100000, 32)
///
/// 接收方同时接受当前窗口和最近 skew 个历史窗口的 cookie。
use crate::config::KcpConfig;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub const GUARD_HEADER_LEN: usize = 12;

const GUARD_KDF_SALT: &[u8] = b"paqet_guard";
const GUARD_KDF_ROUNDS: u32 = 100_000;

type HmacSha256 = Hmac<Sha256>;

/// 常数时间比较，guard 校验全部走这里
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// 某个时间窗内有效的 cookie 集合，cookies[0] 是当前窗口
#[derive(Debug)]
pub struct GuardCookies {
    pub win: u64,
    pub cookies: Vec<[u8; 8]>,
}

impl GuardCookies {
    pub fn matches(&self, cookie: &[u8]) -> bool {
        self.cookies.iter().any(|c| ct_eq(c, cookie))
    }
}

pub struct GuardState {
    magic: [u8; 4],
    window_seconds: u64,
    skew: u32,
    key: [u8; 32],
    cached: RwLock<Option<Arc<GuardCookies>>>,
}

impl GuardState {
    /// guard 未启用或参数不完整时返回 None
    pub fn new(k: &KcpConfig) -> Option<Arc<GuardState>> {
        if !k.guard_enabled() {
            return None;
        }
        if k.guard_magic.len() != 4 || k.guard_window == 0 || k.key.is_empty() {
            return None;
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(k.guard_magic.as_bytes());

        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(k.key.as_bytes(), GUARD_KDF_SALT, GUARD_KDF_ROUNDS, &mut key);

        let st = Arc::new(GuardState {
            magic,
            window_seconds: k.guard_window,
            skew: k.guard_skew,
            key,
            cached: RwLock::new(None),
        });
        // Warm the cache so the first packet doesn't pay the HMAC cost.
        st.cookies();
        Some(st)
    }

    pub fn magic(&self) -> &[u8; 4] {
        &self.magic
    }

    fn now_window(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        now / self.window_seconds
    }

    /// 当前窗口的 cookie 集合（按窗口缓存）
    pub fn cookies(&self) -> Arc<GuardCookies> {
        let win = self.now_window();
        if let Some(c) = self.cached.read().unwrap().as_ref() {
            if c.win == win {
                return c.clone();
            }
        }
        let fresh = Arc::new(self.cookies_for_window(win));
        *self.cached.write().unwrap() = Some(fresh.clone());
        fresh
    }

    pub fn cookies_for_window(&self, win: u64) -> GuardCookies {
        let cookies = (0..=self.skew as u64)
            .map(|i| self.cookie(win.wrapping_sub(i)))
            .collect();
        GuardCookies { win, cookies }
    }

    pub fn cookie(&self, win: u64) -> [u8; 8] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(&self.magic);
        mac.update(&win.to_be_bytes());
        let sum = mac.finalize().into_bytes();
        let mut out = [0u8; 8];
        out.copy_from_slice(&sum[..8]);
        out
    }

    /// 12 字节发送头：magic + 当前窗口 cookie
    pub fn header(&self) -> [u8; GUARD_HEADER_LEN] {
        let cookies = self.cookies();
        let mut hdr = [0u8; GUARD_HEADER_LEN];
        hdr[..4].copy_from_slice(&self.magic);
        hdr[4..].copy_from_slice(&cookies.cookies[0]);
        hdr
    }

    /// 校验 payload 在 pos 处是否携带有效 guard 头
    pub fn verify_at(&self, payload: &[u8], pos: usize, cookies: &GuardCookies) -> bool {
        if payload.len() < pos + GUARD_HEADER_LEN {
            return false;
        }
        ct_eq(&payload[pos..pos + 4], &self.magic) && cookies.matches(&payload[pos + 4..pos + 12])
    }

    /// 在 payload[start..] 中寻找下一个有效的 guard 头位置
    ///
    /// 对重复出现的 magic 字节逐个位置推进，避免死循环。
    pub fn find_next_guard(&self, payload: &[u8], start: usize, cookies: &GuardCookies) -> Option<usize> {
        if payload.len() < GUARD_HEADER_LEN || start >= payload.len() {
            return None;
        }
        let mut i = start;
        while i + GUARD_HEADER_LEN <= payload.len() {
            match payload[i..].windows(4).position(|w| w == self.magic) {
                Some(j) => {
                    let pos = i + j;
                    if pos + GUARD_HEADER_LEN > payload.len() {
                        return None;
                    }
                    if cookies.matches(&payload[pos + 4..pos + 12]) {
                        return Some(pos);
                    }
                    i = pos + 1;
                }
                None => return None,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;

    fn guard_config(magic: &str) -> KcpConfig {
        let mut k = KcpConfig {
            key: "test-secret".to_string(),
            guard_magic: magic.to_string(),
            ..Default::default()
        };
        k.set_defaults(Role::Client);
        k
    }

    #[test]
    fn test_disabled_guard_returns_none() {
        let mut k = guard_config("PQT1");
        k.guard = Some(false);
        assert!(GuardState::new(&k).is_none());
    }

    #[test]
    fn test_cookie_is_deterministic_per_window() {
        let g = GuardState::new(&guard_config("PQT1")).unwrap();
        assert_eq!(g.cookie(100), g.cookie(100));
        assert_ne!(g.cookie(100), g.cookie(101));
    }

    #[test]
    fn test_different_keys_give_different_cookies() {
        let a = GuardState::new(&guard_config("PQT1")).unwrap();
        let mut cfg = guard_config("PQT1");
        cfg.key = "other-secret".to_string();
        let b = GuardState::new(&cfg).unwrap();
        assert_ne!(a.cookie(42), b.cookie(42));
    }

    #[test]
    fn test_skew_accepts_previous_window_only() {
        let g = GuardState::new(&guard_config("PQT1")).unwrap();
        let cookies = g.cookies_for_window(1000);
        assert!(cookies.matches(&g.cookie(1000)));
        assert!(cookies.matches(&g.cookie(999)));
        assert!(!cookies.matches(&g.cookie(998)));
        assert!(!cookies.matches(&g.cookie(1001)));
    }

    #[test]
    fn test_header_verifies() {
        let g = GuardState::new(&guard_config("PQT1")).unwrap();
        let mut payload = g.header().to_vec();
        payload.extend_from_slice(b"kcp bytes");
        let cookies = g.cookies();
        assert!(g.verify_at(&payload, 0, &cookies));
    }

    #[test]
    fn test_magic_mismatch_rejected() {
        let sender = GuardState::new(&guard_config("PQT2")).unwrap();
        let receiver = GuardState::new(&guard_config("PQT1")).unwrap();
        let payload = sender.header().to_vec();
        let cookies = receiver.cookies();
        assert!(!receiver.verify_at(&payload, 0, &cookies));
    }

    #[test]
    fn test_find_next_guard_skips_fake_magic() {
        let g = GuardState::new(&guard_config("PQT1")).unwrap();
        let cookies = g.cookies();
        let mut payload = Vec::new();
        payload.extend_from_slice(&g.header());
        payload.extend_from_slice(b"data1");
        // a stray magic with a junk cookie must not match
        payload.extend_from_slice(b"PQT1JUNKCOOK");
        let second = payload.len();
        payload.extend_from_slice(&g.header());
        payload.extend_from_slice(b"data2");

        assert_eq!(g.find_next_guard(&payload, GUARD_HEADER_LEN, &cookies), Some(second));
    }

    #[test]
    fn test_find_next_guard_none_when_absent() {
        let g = GuardState::new(&guard_config("PQT1")).unwrap();
        let cookies = g.cookies();
        let mut payload = g.header().to_vec();
        payload.extend_from_slice(b"just one record");
        assert_eq!(g.find_next_guard(&payload, GUARD_HEADER_LEN, &cookies), None);
    }
}
