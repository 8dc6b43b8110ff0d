/// 进程级监督
///
/// SIGINT/SIGTERM 触发全局 CancellationToken；长驻任务挂在
/// TaskTracker 上，停机时 cancel → 各循环排空 → wait 返回。
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

/// 把停机信号接到 cancel 上
pub fn install_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, initiating graceful shutdown...");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// 带超时的排空等待
pub struct ShutdownWait {
    tracker: TaskTracker,
}

impl ShutdownWait {
    pub fn new(tracker: TaskTracker) -> ShutdownWait {
        ShutdownWait { tracker }
    }

    /// 等所有已跟踪任务退出；timeout 为零表示无限等。
    /// 返回是否在期限内完成排空。
    pub async fn wait(&self, timeout: Duration) -> bool {
        self.tracker.close();
        if timeout.is_zero() {
            self.tracker.wait().await;
            return true;
        }
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_true_after_drain() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        for _ in 0..4 {
            let c = cancel.clone();
            tracker.spawn(async move { c.cancelled().await });
        }
        let wait = ShutdownWait::new(tracker);
        cancel.cancel();
        assert!(wait.wait(Duration::from_secs(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_on_stuck_task() {
        let tracker = TaskTracker::new();
        tracker.spawn(std::future::pending::<()>());
        let wait = ShutdownWait::new(tracker);
        assert!(!wait.wait(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn test_zero_timeout_waits_forever() {
        let tracker = TaskTracker::new();
        tracker.spawn(async {});
        let wait = ShutdownWait::new(tracker);
        assert!(wait.wait(Duration::ZERO).await);
    }
}
