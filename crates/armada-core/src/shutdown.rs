//! 优雅停机
//!
//! 所有后台任务共享同一个根 [`CancellationToken`]，收到 SIGINT/SIGTERM 后统一取消。

use std::future::Future;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Operation was cancelled")]
    Cancelled,
}

/// 优雅停机管理器
#[derive(Debug, Clone, Default)]
pub struct GracefulShutdown {
    pub token: CancellationToken,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// 等待停机信号（SIGINT, SIGTERM），随后取消根令牌
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            biased;
            _ = ctrl_c => info!("Received Ctrl+C signal"),
            _ = terminate => info!("Received SIGTERM signal"),
            _ = self.token.cancelled() => {}
        }

        info!("Initiating graceful shutdown...");
        self.token.cancel();
    }

    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// 手动触发停机（测试或内部致命错误时使用）
    pub fn trigger(&self) {
        self.token.cancel();
    }
}

/// 在令牌取消前等待 future 完成
pub async fn with_cancellation<T>(
    future: impl Future<Output = T>,
    cancel_token: CancellationToken,
) -> Result<T, ExecutionError> {
    tokio::select! {
        result = future => Ok(result),
        _ = cancel_token.cancelled() => Err(ExecutionError::Cancelled),
    }
}

/// 等待多个任务完成；超时后中止剩余任务。全部按时结束时返回 true
pub async fn wait_for_tasks_with_timeout(
    handles: Vec<tokio::task::JoinHandle<()>>,
    timeout: Duration,
) -> bool {
    info!(
        tasks = handles.len(),
        timeout_ms = timeout.as_millis() as u64,
        "Waiting for tasks to complete"
    );

    let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

    let result = tokio::time::timeout(timeout, async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;

    if result.is_err() {
        let remaining = abort_handles.iter().filter(|h| !h.is_finished()).count();
        warn!(remaining, "Timeout waiting for tasks to complete, aborting remaining");
        for h in abort_handles {
            h.abort();
        }
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_cancellation_completes() {
        let token = CancellationToken::new();
        let out = with_cancellation(async { 7 }, token).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn test_with_cancellation_cancelled() {
        let shutdown = GracefulShutdown::new();
        let child = shutdown.child_token();
        shutdown.trigger();
        let res = with_cancellation(std::future::pending::<()>(), child).await;
        assert!(matches!(res, Err(ExecutionError::Cancelled)));
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_tasks_with_timeout_aborts_stragglers() {
        let fast = tokio::spawn(async {});
        let slow = tokio::spawn(std::future::pending::<()>());
        let finished = wait_for_tasks_with_timeout(vec![fast], Duration::from_secs(1)).await;
        assert!(finished);

        let slow_abort = slow.abort_handle();
        let finished = wait_for_tasks_with_timeout(vec![slow], Duration::from_secs(1)).await;
        assert!(!finished);
        tokio::task::yield_now().await;
        assert!(slow_abort.is_finished());
    }
}
