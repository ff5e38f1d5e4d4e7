use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::SubscriptionOptions;
use super::source::{Receiver, Source};

/// 将 `src` 的消息原样转发到 `dst`
pub fn relay<T, D>(
    token: CancellationToken,
    src: &Source<T>,
    dst: D,
    opts: SubscriptionOptions,
) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
    D: Receiver<T> + 'static,
{
    relay_with_filter(token, src, Some, dst, opts)
}

/// 对每条消息应用 `filter`，仅转发返回 `Some` 的结果
///
/// 订阅在返回前完成，调用方随后发送的消息不会丢失。令牌取消后任务退出，
/// 正在处理的消息可能被丢弃。
pub fn relay_with_filter<T, R, F, D>(
    token: CancellationToken,
    src: &Source<T>,
    filter: F,
    dst: D,
    opts: SubscriptionOptions,
) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(T) -> Option<R> + Send + Sync + 'static,
    D: Receiver<R> + 'static,
{
    let mut subscription = src.subscribe(opts);
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                msg = subscription.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let Some(out) = filter(msg) else {
                continue;
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = dst.send(out) => {}
            }
        }
        trace!("relay stopped");
    })
}

/// 合并转发：累计到 `max_events` 条或距首条未刷新消息超过 `max_latency` 时刷新
///
/// `merge(acc, next)` 返回 false 表示 `next` 无法并入 `acc`：先刷新 `acc`，
/// 再以 `next` 开始新批次。上游关闭时刷新剩余批次；令牌取消时直接丢弃。
pub fn relay_with_merge<T, M, D>(
    token: CancellationToken,
    src: &Source<T>,
    merge: M,
    dst: D,
    max_latency: Duration,
    max_events: usize,
    opts: SubscriptionOptions,
) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
    M: Fn(&mut T, &T) -> bool + Send + Sync + 'static,
    D: Receiver<T> + 'static,
{
    let max_events = max_events.max(1);
    let mut subscription = src.subscribe(opts);
    tokio::spawn(async move {
        let mut batch = Batch::default();
        let timer = tokio::time::sleep(max_latency);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = &mut timer, if batch.is_open() => {
                    batch.flush(&dst).await;
                }
                msg = subscription.recv() => {
                    let Some(msg) = msg else {
                        batch.flush(&dst).await;
                        break;
                    };
                    let merged = match batch.pending.as_mut() {
                        Some(acc) => merge(acc, &msg),
                        None => false,
                    };
                    if merged {
                        batch.count += 1;
                    } else {
                        batch.flush(&dst).await;
                        batch.pending = Some(msg);
                        batch.count = 1;
                        timer.as_mut().reset(Instant::now() + max_latency);
                    }
                    if batch.count >= max_events {
                        batch.flush(&dst).await;
                    }
                }
            }
        }
        trace!("merge relay stopped");
    })
}

struct Batch<T> {
    pending: Option<T>,
    count: usize,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self {
            pending: None,
            count: 0,
        }
    }
}

impl<T: Send + 'static> Batch<T> {
    fn is_open(&self) -> bool {
        self.pending.is_some()
    }

    async fn flush<D: Receiver<T>>(&mut self, dst: &D) {
        if let Some(acc) = self.pending.take() {
            trace!(events = self.count, "flushing merged batch");
            self.count = 0;
            dst.send(acc).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next<T>(sub: &mut crate::eventbus::Subscription<T>) -> Option<T> {
        tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_relay_with_filter_forwards_matching() {
        let token = CancellationToken::new();
        let src: Source<u32> = Source::new();
        let dst: Source<String> = Source::new();
        let mut out = dst.subscribe(SubscriptionOptions::default());

        let _handle = relay_with_filter(
            token.clone(),
            &src,
            |n| (n % 2 == 1).then(|| format!("odd-{}", n)),
            dst.clone(),
            SubscriptionOptions::default(),
        );
        for i in 1..=5 {
            src.send(i).await;
        }

        assert_eq!(next(&mut out).await.as_deref(), Some("odd-1"));
        assert_eq!(next(&mut out).await.as_deref(), Some("odd-3"));
        assert_eq!(next(&mut out).await.as_deref(), Some("odd-5"));
        token.cancel();
    }

    #[tokio::test]
    async fn test_relay_stops_on_cancel() {
        let token = CancellationToken::new();
        let src: Source<u32> = Source::new();
        let dst: Source<u32> = Source::new();
        let handle = relay(token.clone(), &src, dst, SubscriptionOptions::default());
        assert_eq!(src.subscriber_count(), 1);

        token.cancel();
        handle.await.unwrap();
        assert_eq!(src.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_flushes_on_max_events() {
        let token = CancellationToken::new();
        let src: Source<Vec<u32>> = Source::new();
        let dst: Source<Vec<u32>> = Source::new();
        let mut out = dst.subscribe(SubscriptionOptions::unbounded());

        let _handle = relay_with_merge(
            token.clone(),
            &src,
            |acc: &mut Vec<u32>, next: &Vec<u32>| {
                acc.extend_from_slice(next);
                true
            },
            dst.clone(),
            Duration::from_secs(1),
            3,
            SubscriptionOptions::unbounded(),
        );

        for i in 0..7 {
            src.send(vec![i]).await;
        }

        assert_eq!(next(&mut out).await, Some(vec![0, 1, 2]));
        assert_eq!(next(&mut out).await, Some(vec![3, 4, 5]));
        // 剩余一条由定时器刷新
        assert_eq!(next(&mut out).await, Some(vec![6]));
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_flushes_on_latency() {
        let token = CancellationToken::new();
        let src: Source<u32> = Source::new();
        let dst: Source<u32> = Source::new();
        let mut out = dst.subscribe(SubscriptionOptions::default());

        let _handle = relay_with_merge(
            token.clone(),
            &src,
            |acc: &mut u32, next: &u32| {
                *acc += *next;
                true
            },
            dst.clone(),
            Duration::from_millis(100),
            100,
            SubscriptionOptions::default(),
        );

        let start = Instant::now();
        src.send(1).await;
        src.send(2).await;
        assert_eq!(next(&mut out).await, Some(3));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_rejection_starts_new_batch() {
        let token = CancellationToken::new();
        let src: Source<(char, u32)> = Source::new();
        let dst: Source<(char, u32)> = Source::new();
        let mut out = dst.subscribe(SubscriptionOptions::default());

        let _handle = relay_with_merge(
            token.clone(),
            &src,
            |acc: &mut (char, u32), next: &(char, u32)| {
                if acc.0 != next.0 {
                    return false;
                }
                acc.1 += next.1;
                true
            },
            dst.clone(),
            Duration::from_millis(50),
            10,
            SubscriptionOptions::default(),
        );

        src.send(('a', 1)).await;
        src.send(('a', 2)).await;
        src.send(('b', 5)).await;

        assert_eq!(next(&mut out).await, Some(('a', 3)));
        assert_eq!(next(&mut out).await, Some(('b', 5)));
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_batches_are_bounded() {
        let token = CancellationToken::new();
        let src: Source<Vec<u32>> = Source::new();
        let dst: Source<Vec<u32>> = Source::new();
        let mut out = dst.subscribe(SubscriptionOptions::unbounded());
        let max_events = 4;
        let total = 18u32;

        let _handle = relay_with_merge(
            token.clone(),
            &src,
            |acc: &mut Vec<u32>, next: &Vec<u32>| {
                acc.extend_from_slice(next);
                true
            },
            dst.clone(),
            Duration::from_millis(20),
            max_events,
            SubscriptionOptions::unbounded(),
        );

        for i in 0..total {
            src.send(vec![i]).await;
        }

        let mut seen = Vec::new();
        let mut flushes = 0;
        while seen.len() < total as usize {
            let batch = next(&mut out).await.expect("batch arrives");
            assert!(batch.len() <= max_events);
            flushes += 1;
            seen.extend(batch);
        }
        assert!(flushes >= (total as usize).div_ceil(max_events));
        assert_eq!(seen, (0..total).collect::<Vec<_>>());
        token.cancel();
    }

    #[tokio::test]
    async fn test_merge_flushes_when_source_closes() {
        let token = CancellationToken::new();
        let src: Source<u32> = Source::new();
        let dst: Source<u32> = Source::new();
        let mut out = dst.subscribe(SubscriptionOptions::default());

        let handle = relay_with_merge(
            token,
            &src,
            |acc: &mut u32, next: &u32| {
                *acc = (*acc).max(*next);
                true
            },
            dst.clone(),
            Duration::from_secs(3600),
            100,
            SubscriptionOptions::default(),
        );
        src.send(4).await;
        src.send(9).await;
        drop(src);

        handle.await.unwrap();
        assert_eq!(next(&mut out).await, Some(9));
    }
}
