use futures::Stream;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use super::source::SourceInner;

pub(super) enum SubscriptionReceiver<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

/// 订阅端；drop 即退订
pub struct Subscription<T> {
    id: u64,
    rx: SubscriptionReceiver<T>,
    source: Weak<SourceInner<T>>,
}

impl<T> Subscription<T> {
    pub(super) fn new(id: u64, rx: SubscriptionReceiver<T>, source: Weak<SourceInner<T>>) -> Self {
        Self { id, rx, source }
    }

    pub(super) fn id(&self) -> u64 {
        self.id
    }

    /// 等待下一条消息；消息源被丢弃或已退订时返回 `None`
    pub async fn recv(&mut self) -> Option<T> {
        match &mut self.rx {
            SubscriptionReceiver::Bounded(rx) => rx.recv().await,
            SubscriptionReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        match &mut self.rx {
            SubscriptionReceiver::Bounded(rx) => rx.try_recv().ok(),
            SubscriptionReceiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    /// 显式退订。返回后不会再收到任何消息
    pub fn unsubscribe(self) {
        drop(self);
    }

    fn detach(&mut self) {
        match &mut self.rx {
            SubscriptionReceiver::Bounded(rx) => rx.close(),
            SubscriptionReceiver::Unbounded(rx) => rx.close(),
        }
        if let Some(source) = self.source.upgrade() {
            source.remove(self.id);
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        match &mut self.get_mut().rx {
            SubscriptionReceiver::Bounded(rx) => rx.poll_recv(cx),
            SubscriptionReceiver::Unbounded(rx) => rx.poll_recv(cx),
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
