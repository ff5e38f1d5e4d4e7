use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::SubscriptionOptions;
use super::subscription::{Subscription, SubscriptionReceiver};

/// 只写能力：持有者只能发送，不能订阅自己的总线
#[async_trait]
pub trait Receiver<T>: Send + Sync {
    async fn send(&self, msg: T);
}

#[async_trait]
impl<T, R> Receiver<T> for Arc<R>
where
    T: Send + 'static,
    R: Receiver<T> + ?Sized,
{
    async fn send(&self, msg: T) {
        (**self).send(msg).await
    }
}

pub(super) type MessageFilter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

#[derive(Clone)]
pub(super) enum SubscriberSender<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> SubscriberSender<T> {
    /// 投递一条消息；返回 false 表示订阅端已关闭
    async fn deliver(&self, msg: T) -> bool {
        match self {
            Self::Bounded(tx) => tx.send(msg).await.is_ok(),
            Self::Unbounded(tx) => tx.send(msg).is_ok(),
        }
    }

    async fn closed(&self) {
        match self {
            Self::Bounded(tx) => tx.closed().await,
            Self::Unbounded(tx) => tx.closed().await,
        }
    }
}

#[derive(Clone)]
struct Subscriber<T> {
    sender: SubscriberSender<T>,
    filter: Option<MessageFilter<T>>,
}

pub(super) struct SourceInner<T> {
    subscribers: DashMap<u64, Subscriber<T>>,
    next_id: AtomicU64,
}

impl<T> SourceInner<T> {
    pub(super) fn remove(&self, id: u64) {
        self.subscribers.remove(&id);
    }
}

/// 多订阅者消息源，每次 `send` 会到达发送时刻所有已订阅的通道
pub struct Source<T> {
    inner: Arc<SourceInner<T>>,
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Source<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(SourceInner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

impl<T> std::fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("subscribers", &self.inner.subscribers.len())
            .finish()
    }
}

impl<T> Source<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, opts: SubscriptionOptions) -> Subscription<T> {
        self.register(opts, None).0
    }

    /// 只接收满足谓词的消息
    pub fn subscribe_with_filter<F>(&self, filter: F, opts: SubscriptionOptions) -> Subscription<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.register(opts, Some(Arc::new(filter))).0
    }

    /// 令牌取消时自动退订；订阅端读完缓冲后收到 `None`
    pub fn subscribe_until(
        &self,
        token: CancellationToken,
        opts: SubscriptionOptions,
    ) -> Subscription<T> {
        let (subscription, sender) = self.register(opts, None);
        let id = subscription.id();
        let source = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Some(inner) = source.upgrade() {
                        inner.remove(id);
                    }
                }
                _ = sender.closed() => {}
            }
        });
        subscription
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// 发送给所有订阅者。有界订阅者已满时等待；已关闭的订阅者被移除
    pub async fn send(&self, msg: T) {
        // 先复制订阅者快照，避免跨 await 持有分片锁
        let snapshot: Vec<(u64, Subscriber<T>)> = self
            .inner
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (id, subscriber) in snapshot {
            if let Some(filter) = &subscriber.filter {
                if !filter(&msg) {
                    continue;
                }
            }
            if !subscriber.sender.deliver(msg.clone()).await {
                self.inner.remove(id);
            }
        }
    }

    fn register(
        &self,
        opts: SubscriptionOptions,
        filter: Option<MessageFilter<T>>,
    ) -> (Subscription<T>, SubscriberSender<T>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = if opts.unbounded {
            let (tx, rx) = mpsc::unbounded_channel();
            (SubscriberSender::Unbounded(tx), SubscriptionReceiver::Unbounded(rx))
        } else {
            let (tx, rx) = mpsc::channel(opts.capacity.max(1));
            (SubscriberSender::Bounded(tx), SubscriptionReceiver::Bounded(rx))
        };
        self.inner.subscribers.insert(
            id,
            Subscriber {
                sender: sender.clone(),
                filter,
            },
        );
        (
            Subscription::new(id, receiver, Arc::downgrade(&self.inner)),
            sender,
        )
    }
}

#[async_trait]
impl<T> Receiver<T> for Source<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn send(&self, msg: T) {
        Source::send(self, msg).await
    }
}
