/// UDP 流池
///
/// 按 (来源, 目标) 指纹复用隧道流。活跃时间戳的更新做了节流：
/// 距上次更新不足 5s 就跳过，换取高 QPS UDP（如 DNS）下的低开销。
use crate::tnet::Strm;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) const UDP_POOL_MAX_ENTRIES_DEFAULT: usize = 4096;
pub(crate) const UDP_POOL_IDLE_TIMEOUT_DEFAULT: Duration = Duration::from_secs(60);
const UDP_POOL_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const UDP_POOL_TOUCH_INTERVAL: Duration = Duration::from_secs(5);
const UDP_POOL_SWEEP_SCAN_LIMIT: usize = 512;
const UDP_POOL_INSERT_SCAN_LIMIT: usize = 32;

#[cfg(test)]
pub(crate) fn test_now_nanos() -> i64 {
    unix_nanos()
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// 池化的 UDP 隧道流：读写分离 + 节流的活跃时间戳
pub struct TrackedStream {
    sid: u64,
    read_half: tokio::sync::Mutex<ReadHalf<Box<dyn Halves>>>,
    write_half: tokio::sync::Mutex<WriteHalf<Box<dyn Halves>>>,
    last_used: AtomicI64,
}

/// 可拆分读写的流
pub trait Halves: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> Halves for T {}

impl TrackedStream {
    pub(crate) fn new(strm: Strm) -> Arc<TrackedStream> {
        let sid = strm.sid();
        Self::from_io(sid, Box::new(strm))
    }

    pub(crate) fn from_io(sid: u64, io: Box<dyn Halves>) -> Arc<TrackedStream> {
        let (r, w) = tokio::io::split(io);
        Arc::new(TrackedStream {
            sid,
            read_half: tokio::sync::Mutex::new(r),
            write_half: tokio::sync::Mutex::new(w),
            last_used: AtomicI64::new(unix_nanos()),
        })
    }

    pub fn sid(&self) -> u64 {
        self.sid
    }

    fn touch(&self) {
        let now = unix_nanos();
        let last = self.last_used.load(Ordering::Relaxed);
        if last != 0 && now - last < UDP_POOL_TOUCH_INTERVAL.as_nanos() as i64 {
            return;
        }
        self.last_used.store(now, Ordering::Relaxed);
    }

    pub(crate) fn last_used(&self) -> i64 {
        self.last_used.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn set_last_used(&self, nanos: i64) {
        self.last_used.store(nanos, Ordering::Relaxed);
    }

    pub async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.read_half.lock().await.read(buf).await?;
        if n > 0 {
            self.touch();
        }
        Ok(n)
    }

    /// 带超时的读：UDP 回程靠读超时回收流
    pub async fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        match tokio::time::timeout(timeout, self.read(buf)).await {
            Ok(r) => r,
            Err(_) => Err(crate::diag::deadline_exceeded()),
        }
    }

    pub async fn write_all(&self, buf: &[u8]) -> std::io::Result<()> {
        let mut w = self.write_half.lock().await;
        w.write_all(buf).await?;
        w.flush().await?;
        drop(w);
        self.touch();
        Ok(())
    }

    pub async fn close(&self) {
        let _ = self.write_half.lock().await.shutdown().await;
    }
}

pub(crate) struct UdpPool {
    strms: RwLock<HashMap<u64, Arc<TrackedStream>>>,
    max_entries: usize,
    idle_timeout: Duration,
}

impl UdpPool {
    pub(crate) fn new() -> UdpPool {
        UdpPool {
            strms: RwLock::new(HashMap::new()),
            max_entries: UDP_POOL_MAX_ENTRIES_DEFAULT,
            idle_timeout: UDP_POOL_IDLE_TIMEOUT_DEFAULT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_limits(max_entries: usize, idle_timeout: Duration) -> UdpPool {
        UdpPool {
            strms: RwLock::new(HashMap::new()),
            max_entries,
            idle_timeout,
        }
    }

    pub(crate) fn get(&self, key: u64) -> Option<Arc<TrackedStream>> {
        self.strms.read().unwrap().get(&key).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.strms.read().unwrap().len()
    }

    /// 插入新流；容量吃紧时顺带做有界清理
    pub(crate) async fn insert(&self, key: u64, strm: Arc<TrackedStream>) {
        let to_close = {
            let mut strms = self.strms.write().unwrap();
            let mut evicted = self.evict_for_insert_locked(&mut strms);
            if let Some(old) = strms.insert(key, strm) {
                evicted.push(old);
            }
            evicted
        };
        close_all(to_close).await;
    }

    /// 幂等删除并关闭
    pub(crate) async fn delete(&self, key: u64) {
        let strm = self.strms.write().unwrap().remove(&key);
        if let Some(strm) = strm {
            debug!("closing UDP session stream {}", strm.sid());
            strm.close().await;
        }
    }

    /// 周期清理；context 取消时清空整个池
    pub(crate) async fn sweep(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(UDP_POOL_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.close_all().await;
                    return;
                }
                _ = ticker.tick() => self.evict(unix_nanos()).await,
            }
        }
    }

    pub(crate) async fn close_all(&self) {
        let to_close: Vec<_> = {
            let mut strms = self.strms.write().unwrap();
            strms.drain().map(|(_, s)| s).collect()
        };
        close_all(to_close).await;
    }

    pub(crate) async fn evict(&self, now_nanos: i64) {
        let to_close = {
            let mut strms = self.strms.write().unwrap();
            let mut out = self.evict_idle_locked(&mut strms, now_nanos, UDP_POOL_SWEEP_SCAN_LIMIT);
            if self.max_entries > 0 && strms.len() > self.max_entries {
                let overflow = strms.len() - self.max_entries;
                out.extend(evict_overflow_locked(&mut strms, overflow));
            }
            out
        };
        close_all(to_close).await;
    }

    /// 插入路径的开销保持 O(overflow)，避免写锁下全表扫描
    fn evict_for_insert_locked(
        &self,
        strms: &mut HashMap<u64, Arc<TrackedStream>>,
    ) -> Vec<Arc<TrackedStream>> {
        if self.max_entries == 0 {
            return Vec::new();
        }
        if strms.len() >= self.max_entries {
            let overflow = strms.len() - self.max_entries + 1;
            return evict_overflow_locked(strms, overflow);
        }
        // Opportunistic bounded idle cleanup when close to capacity.
        self.evict_idle_locked(strms, unix_nanos(), UDP_POOL_INSERT_SCAN_LIMIT)
    }

    fn evict_idle_locked(
        &self,
        strms: &mut HashMap<u64, Arc<TrackedStream>>,
        now_nanos: i64,
        max_scan: usize,
    ) -> Vec<Arc<TrackedStream>> {
        if self.idle_timeout.is_zero() {
            return Vec::new();
        }
        let cutoff = now_nanos - self.idle_timeout.as_nanos() as i64;
        let mut stale = Vec::new();
        for (k, s) in strms.iter().take(max_scan.max(1)) {
            if s.last_used() < cutoff {
                stale.push(*k);
            }
        }
        stale
            .into_iter()
            .filter_map(|k| {
                let s = strms.remove(&k);
                if let Some(s) = &s {
                    debug!("evicting idle UDP stream {}", s.sid());
                }
                s
            })
            .collect()
    }
}

fn evict_overflow_locked(
    strms: &mut HashMap<u64, Arc<TrackedStream>>,
    overflow: usize,
) -> Vec<Arc<TrackedStream>> {
    // HashMap iteration order is effectively randomized; take arbitrary keys.
    let victims: Vec<u64> = strms.keys().take(overflow).copied().collect();
    victims
        .into_iter()
        .filter_map(|k| {
            let s = strms.remove(&k);
            if let Some(s) = &s {
                debug!("evicting UDP stream {} (pool full)", s.sid());
            }
            s
        })
        .collect()
}

async fn close_all(strms: Vec<Arc<TrackedStream>>) {
    for s in strms {
        s.close().await;
    }
}
