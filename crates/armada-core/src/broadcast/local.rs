use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::attributes::MessageAttributes;
use super::options::BroadcastOptions;
use super::pipeline::{Pipeline, RoutedSubscription};
use super::Broadcast;
use crate::core_types::NodeId;
use crate::error::Result;
use crate::eventbus::{Receiver, Source};

/// 单节点广播：发送直接写入内部缓冲，经转发链到达消费端
pub struct LocalBroadcast<T> {
    inner: Arc<LocalInner<T>>,
}

struct LocalInner<T> {
    name: String,
    pipeline: Pipeline<T>,
}

impl<T> Clone for LocalBroadcast<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> LocalBroadcast<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// 转发任务的生命周期与 `token` 绑定
    pub fn new(
        name: impl Into<String>,
        node_id: NodeId,
        options: BroadcastOptions<T>,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                name: name.into(),
                pipeline: Pipeline::new(node_id, options, token),
            }),
        }
    }

    pub fn options(&self) -> &BroadcastOptions<T> {
        self.inner.pipeline.options()
    }

    pub fn running_tasks(&self) -> usize {
        self.inner.pipeline.task_count()
    }
}

#[async_trait]
impl<T> Receiver<T> for LocalBroadcast<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn send(&self, msg: T) {
        let pipeline = &self.inner.pipeline;
        let env = pipeline.envelope(msg);
        if !pipeline.has_route(&env) {
            trace!(broadcast = %self.inner.name, "no route for message, dropping");
            return;
        }
        pipeline.buffer().send(env).await;
    }
}

impl<T> Broadcast<T> for LocalBroadcast<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn producer(&self) -> Arc<dyn Receiver<T>> {
        Arc::new(self.clone())
    }

    fn consumer(&self) -> Source<T> {
        self.inner.pipeline.consumer()
    }

    fn subscribe_routed(&self, attrs: &MessageAttributes) -> Result<RoutedSubscription<T>> {
        self.inner.pipeline.subscribe_routed(attrs)
    }

    fn parse_to(&self, data: &[u8]) -> Result<T> {
        self.inner.pipeline.options().parse_to(data)
    }
}
