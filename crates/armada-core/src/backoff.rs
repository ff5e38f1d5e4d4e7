//! 指数退避重试策略

use backoff::{Error as BackoffError, ExponentialBackoff, future::retry};
use std::sync::Arc;
use std::time::Duration;

use crate::error::CoreError;

/// 乐观并发冲突重试：间隔短、窗口小
pub fn conflict_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(5),
        max_interval: Duration::from_millis(200),
        multiplier: 2.0,
        max_elapsed_time: Some(Duration::from_secs(5)),
        randomization_factor: 0.3,
        ..Default::default()
    }
}

pub fn network_publish_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_millis(2000),
        multiplier: 2.0,
        max_elapsed_time: Some(Duration::from_secs(30)),
        randomization_factor: 0.15,
        ..Default::default()
    }
}

pub fn network_connect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(200),
        max_interval: Duration::from_millis(5000),
        multiplier: 2.0,
        max_elapsed_time: Some(Duration::from_secs(30)),
        randomization_factor: 0.2,
        ..Default::default()
    }
}

/// 仅对被判定为"瞬态"的错误重试，其余立即失败
pub async fn execute_with_backoff_selective<F, Fut, T, E>(
    mut operation: F,
    backoff: ExponentialBackoff,
    is_transient: Arc<dyn Fn(&E) -> bool + Send + Sync + 'static>,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display + Send + 'static,
{
    let wrapped_operation = move || {
        let fut = operation();
        let classify = is_transient.clone();
        async move {
            match fut.await {
                Ok(v) => Ok(v),
                Err(e) if classify(&e) => Err(BackoffError::transient(e)),
                Err(e) => Err(BackoffError::permanent(e)),
            }
        }
    };

    retry(backoff, wrapped_operation).await
}

/// 对 `CoreError::is_retriable()` 的错误按 [`conflict_backoff`] 重试
pub async fn retry_retriable<F, Fut, T>(operation: F) -> crate::error::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::error::Result<T>>,
{
    execute_with_backoff_selective(
        operation,
        conflict_backoff(),
        Arc::new(|e: &CoreError| e.is_retriable()),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_retriable_retries_conflicts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let out = retry_retriable(|| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(CoreError::Conflict {
                        entity: "agent".into(),
                        expected: n as u64,
                        actual: n as u64 + 1,
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_retriable_stops_on_permanent_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let res: crate::error::Result<()> = retry_retriable(|| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::agent_not_found("a1"))
            }
        })
        .await;
        assert!(matches!(res, Err(CoreError::AgentNotFound { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
