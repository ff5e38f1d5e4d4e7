//! 生产端到消费端的转发链，本地与 NATS 实现共用

use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::attributes::MessageAttributes;
use super::options::BroadcastOptions;
use super::routing::{RouteGuard, RoutingRegistry};
use crate::constants::{ATTR_ORIGIN, ATTR_ROUTING_KEY};
use crate::core_types::NodeId;
use crate::error::{CoreError, Result};
use crate::eventbus::{Source, Subscription, relay_with_filter, relay_with_merge};

/// 带属性的广播消息
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub message: T,
    pub attributes: MessageAttributes,
    pub ordering_key: Option<String>,
}

/// 组装转发链：有合并配置时 `src → merge → filter → dst`，否则 `src → filter → dst`
///
/// 合并只发生在属性与排序键都相同的相邻消息之间。
pub fn relay_producer<T, F>(
    token: CancellationToken,
    src: &Source<Envelope<T>>,
    filter: F,
    dst: Source<Envelope<T>>,
    options: &BroadcastOptions<T>,
) -> Vec<JoinHandle<()>>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(Envelope<T>) -> Option<Envelope<T>> + Send + Sync + 'static,
{
    let opts = options.subscription_options();
    let Ok(merge) = options.merge_options() else {
        return vec![relay_with_filter(token, src, filter, dst, opts)];
    };

    let merged = Source::new();
    let merge_fn = merge.merge.clone();
    let filter_handle = relay_with_filter(token.clone(), &merged, filter, dst, opts);
    let merge_handle = relay_with_merge(
        token,
        src,
        move |acc: &mut Envelope<T>, next: &Envelope<T>| {
            acc.attributes == next.attributes
                && acc.ordering_key == next.ordering_key
                && merge_fn(&mut acc.message, &next.message)
        },
        merged,
        merge.max_latency,
        merge.max_events,
        opts,
    );
    vec![merge_handle, filter_handle]
}

pub(crate) struct Pipeline<T> {
    node_id: NodeId,
    options: BroadcastOptions<T>,
    routes: Arc<RoutingRegistry>,
    /// 生产端写入的缓冲
    buffer: Source<Envelope<T>>,
    /// 通过过滤后的消息（带属性）
    delivered: Source<Envelope<T>>,
    consumer: Source<T>,
    handles: Vec<JoinHandle<()>>,
}

impl<T> Pipeline<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(node_id: NodeId, options: BroadcastOptions<T>, token: CancellationToken) -> Self {
        let routes = RoutingRegistry::new();
        let buffer = Source::new();
        let delivered = Source::new();
        let consumer = Source::new();

        let filter = {
            let options = options.clone();
            let routes = routes.clone();
            move |env: Envelope<T>| accepts(&options, &routes, &env).then_some(env)
        };
        let mut handles = relay_producer(token.clone(), &buffer, filter, delivered.clone(), &options);
        handles.push(relay_with_filter(
            token,
            &delivered,
            |env: Envelope<T>| Some(env.message),
            consumer.clone(),
            options.subscription_options(),
        ));

        Self {
            node_id,
            options,
            routes,
            buffer,
            delivered,
            consumer,
            handles,
        }
    }

    pub(crate) fn options(&self) -> &BroadcastOptions<T> {
        &self.options
    }

    pub(crate) fn buffer(&self) -> &Source<Envelope<T>> {
        &self.buffer
    }

    pub(crate) fn consumer(&self) -> Source<T> {
        self.consumer.clone()
    }

    /// 为待发送消息生成属性与排序键
    pub(crate) fn envelope(&self, message: T) -> Envelope<T> {
        let mut attributes = MessageAttributes::new();
        self.options.add_attributes(&message, &mut attributes);
        attributes.insert(ATTR_ORIGIN, self.node_id.as_str());
        if let Some(key) = self.options.routing_key(&message) {
            attributes.insert(ATTR_ROUTING_KEY, key);
        }
        let ordering_key = self.options.ordering_key(&message);
        Envelope {
            message,
            attributes,
            ordering_key,
        }
    }

    /// 配置了路由时，只有本地存在对应订阅者才需要投递
    pub(crate) fn has_route(&self, env: &Envelope<T>) -> bool {
        route_open(&self.options, &self.routes, env)
    }

    pub(crate) fn subscribe_routed(&self, attrs: &MessageAttributes) -> Result<RoutedSubscription<T>> {
        let opts = self.options.subscription_options();
        if !self.options.has_routing() {
            return Ok(RoutedSubscription {
                inner: self.delivered.subscribe(opts),
                route: None,
            });
        }
        let key = self
            .options
            .subscription_key(attrs)
            .ok_or_else(|| CoreError::broadcast("no subscription key for subscriber attributes"))?;
        let guard = self.routes.register(key.clone());
        let inner = self.delivered.subscribe_with_filter(
            move |env: &Envelope<T>| env.attributes.routing_key() == Some(key.as_str()),
            opts,
        );
        Ok(RoutedSubscription {
            inner,
            route: Some(guard),
        })
    }

    pub(crate) fn task_count(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }
}

fn route_open<T>(options: &BroadcastOptions<T>, routes: &RoutingRegistry, env: &Envelope<T>) -> bool {
    if !options.has_routing() {
        return true;
    }
    env.attributes
        .routing_key()
        .is_some_and(|key| routes.has_route(key))
}

/// 消费端重新校验属性与路由，单节点与多节点行为保持一致
fn accepts<T>(options: &BroadcastOptions<T>, routes: &RoutingRegistry, env: &Envelope<T>) -> bool {
    options.accepts(&env.attributes) && route_open(options, routes, env)
}

/// 按订阅者路由键过滤的订阅；丢弃时撤销路由兴趣
pub struct RoutedSubscription<T> {
    inner: Subscription<Envelope<T>>,
    route: Option<RouteGuard>,
}

impl<T> RoutedSubscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.inner.recv().await.map(|env| env.message)
    }

    pub async fn recv_envelope(&mut self) -> Option<Envelope<T>> {
        self.inner.recv().await
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.route.as_ref().map(RouteGuard::key)
    }
}

impl<T> Stream for RoutedSubscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_next(cx)
            .map(|item| item.map(|env| env.message))
    }
}
