//! 广播层
//!
//! 在事件总线之上增加属性过滤、路由键分区、排序键与合并窗口。
//! [`LocalBroadcast`] 在进程内直接连通生产端与消费端；[`NatsBroadcast`]
//! 经由 NATS 把消息送达每个节点的消费端，两者对调用方行为一致。

mod attributes;
mod local;
mod nats;
mod options;
mod pipeline;
mod routing;

use std::sync::Arc;

pub use attributes::MessageAttributes;
pub use local::LocalBroadcast;
pub use nats::NatsBroadcast;
pub use options::{
    AttributeProcessor, BroadcastOptions, MergeOptions, ParseFn, RoutingOptions,
};
pub use pipeline::{Envelope, RoutedSubscription, relay_producer};
pub use routing::{RouteGuard, RoutingRegistry};

use crate::error::Result;
use crate::eventbus::{Receiver, Source};

/// 一类消息的广播
pub trait Broadcast<T>: Send + Sync {
    fn name(&self) -> &str;

    /// 只写端
    fn producer(&self) -> Arc<dyn Receiver<T>>;

    /// 本节点的消费端
    fn consumer(&self) -> Source<T>;

    /// 按订阅者属性推导的路由键订阅；未配置路由时等同于订阅全部消息
    fn subscribe_routed(&self, attrs: &MessageAttributes) -> Result<RoutedSubscription<T>>;

    /// 解析外部传输送达的字节
    fn parse_to(&self, data: &[u8]) -> Result<T>;
}
