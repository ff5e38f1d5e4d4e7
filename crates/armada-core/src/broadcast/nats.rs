use async_nats::Client;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::attributes::MessageAttributes;
use super::options::BroadcastOptions;
use super::pipeline::{Envelope, Pipeline, RoutedSubscription};
use super::Broadcast;
use crate::backoff::{execute_with_backoff_selective, network_publish_backoff};
use crate::constants::broadcast_subject;
use crate::core_types::NodeId;
use crate::error::{CoreError, Result};
use crate::eventbus::{Receiver, Source};
use crate::shutdown::with_cancellation;

/// NATS 上传输的消息格式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct WireEnvelope {
    pub attributes: MessageAttributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
    pub data: Vec<u8>,
}

/// 基于 NATS core pub/sub 的分布式广播
///
/// 发送端把消息发布到 `<prefix>.<name>`，每个节点（包括发送节点自己）的订阅任务
/// 解析后写入本地转发链。投递为 at-most-once。
pub struct NatsBroadcast<T> {
    inner: Arc<NatsInner<T>>,
}

struct NatsInner<T> {
    name: String,
    subject: String,
    client: Client,
    pipeline: Pipeline<T>,
    token: CancellationToken,
}

impl<T> Clone for NatsBroadcast<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> NatsBroadcast<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    /// 订阅主题并启动接收任务。必须配置解析函数
    pub async fn new(
        client: Client,
        subject_prefix: &str,
        name: impl Into<String>,
        node_id: NodeId,
        options: BroadcastOptions<T>,
        token: CancellationToken,
    ) -> Result<Self> {
        if !options.has_parse_func() {
            return Err(CoreError::NoParseFunc);
        }
        let name = name.into();
        let subject = broadcast_subject(subject_prefix, &name);
        let subscriber = client.subscribe(subject.clone()).await?;

        let inner = Arc::new(NatsInner {
            name,
            subject,
            client,
            pipeline: Pipeline::new(node_id, options, token.clone()),
            token: token.clone(),
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut subscriber = subscriber;
            loop {
                let message = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    message = subscriber.next() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match inner.decode(&message.payload) {
                    Ok(env) => inner.pipeline.buffer().send(env).await,
                    Err(e) => warn!(broadcast = %inner.name, error = %e, "dropping undecodable broadcast message"),
                }
            }
            if let Err(e) = subscriber.unsubscribe().await {
                debug!(error = %e, "broadcast unsubscribe failed");
            }
        });

        Ok(Self { inner })
    }

    pub fn subject(&self) -> &str {
        &self.inner.subject
    }
}

impl<T> NatsInner<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    fn encode(&self, env: &Envelope<T>) -> Result<Bytes> {
        let wire = WireEnvelope {
            attributes: env.attributes.clone(),
            ordering_key: env.ordering_key.clone(),
            data: serde_json::to_vec(&env.message)?,
        };
        Ok(Bytes::from(serde_json::to_vec(&wire)?))
    }

    /// 发布到主题；客户端暂时不可用时按退避重试，广播关闭后放弃
    async fn publish(&self, payload: Bytes) -> Result<()> {
        let attempt = execute_with_backoff_selective(
            || {
                let payload = payload.clone();
                async move {
                    self.client
                        .publish(self.subject.clone(), payload)
                        .await
                        .map_err(CoreError::from)
                }
            },
            network_publish_backoff(),
            Arc::new(|e: &CoreError| e.is_retriable()),
        );
        with_cancellation(attempt, self.token.clone())
            .await
            .map_err(|e| CoreError::broadcast(e.to_string()))?
    }

    fn decode(&self, payload: &[u8]) -> Result<Envelope<T>> {
        let wire: WireEnvelope = serde_json::from_slice(payload)?;
        let message = self.pipeline.options().parse_to(&wire.data)?;
        Ok(Envelope {
            message,
            attributes: wire.attributes,
            ordering_key: wire.ordering_key,
        })
    }
}

#[async_trait]
impl<T> Receiver<T> for NatsBroadcast<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    async fn send(&self, msg: T) {
        let inner = &self.inner;
        let env = inner.pipeline.envelope(msg);
        let payload = match inner.encode(&env) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(broadcast = %inner.name, error = %e, "failed to encode broadcast message");
                return;
            }
        };
        if let Err(e) = inner.publish(payload).await {
            warn!(broadcast = %inner.name, error = %e, "failed to publish broadcast message");
        }
    }
}

impl<T> Broadcast<T> for NatsBroadcast<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
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
