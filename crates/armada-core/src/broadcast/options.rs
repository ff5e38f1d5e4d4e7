use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use super::attributes::MessageAttributes;
use crate::error::{CoreError, Result};
use crate::eventbus::SubscriptionOptions;

pub type KeyFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;
pub type SubscriptionKeyFn = Arc<dyn Fn(&MessageAttributes) -> Option<String> + Send + Sync>;
pub type AddAttributesFn<T> = Arc<dyn Fn(&T, &mut MessageAttributes) + Send + Sync>;
pub type AttributeFilterFn = Arc<dyn Fn(&MessageAttributes) -> bool + Send + Sync>;
pub type MergeFn<T> = Arc<dyn Fn(&mut T, &T) -> bool + Send + Sync>;
pub type ParseFn<T> = Arc<dyn Fn(&[u8]) -> Result<T> + Send + Sync>;

pub struct RoutingOptions<T> {
    pub routing_key: KeyFn<T>,
    /// 从订阅者属性推导其关心的路由键
    pub subscription_key: SubscriptionKeyFn,
}

pub struct AttributeProcessor<T> {
    pub add_attributes: AddAttributesFn<T>,
    pub filter: AttributeFilterFn,
}

pub struct MergeOptions<T> {
    /// 返回 false 时不得修改累加值
    pub merge: MergeFn<T>,
    pub max_latency: Duration,
    pub max_events: usize,
}

/// 广播配置。构造后不可变，各 `with_*` 方法返回新的配置
pub struct BroadcastOptions<T> {
    routing: Option<RoutingOptions<T>>,
    ordering_key: Option<KeyFn<T>>,
    attribute_processor: Option<AttributeProcessor<T>>,
    merge: Option<MergeOptions<T>>,
    parse: Option<ParseFn<T>>,
    subscription: SubscriptionOptions,
}

impl<T> Default for BroadcastOptions<T> {
    fn default() -> Self {
        Self {
            routing: None,
            ordering_key: None,
            attribute_processor: None,
            merge: None,
            parse: None,
            subscription: SubscriptionOptions::default(),
        }
    }
}

impl<T> Clone for RoutingOptions<T> {
    fn clone(&self) -> Self {
        Self {
            routing_key: self.routing_key.clone(),
            subscription_key: self.subscription_key.clone(),
        }
    }
}

impl<T> Clone for AttributeProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            add_attributes: self.add_attributes.clone(),
            filter: self.filter.clone(),
        }
    }
}

impl<T> Clone for MergeOptions<T> {
    fn clone(&self) -> Self {
        Self {
            merge: self.merge.clone(),
            max_latency: self.max_latency,
            max_events: self.max_events,
        }
    }
}

impl<T> Clone for BroadcastOptions<T> {
    fn clone(&self) -> Self {
        Self {
            routing: self.routing.clone(),
            ordering_key: self.ordering_key.clone(),
            attribute_processor: self.attribute_processor.clone(),
            merge: self.merge.clone(),
            parse: self.parse.clone(),
            subscription: self.subscription,
        }
    }
}

impl<T> std::fmt::Debug for BroadcastOptions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastOptions")
            .field("routing", &self.routing.is_some())
            .field("ordering_key", &self.ordering_key.is_some())
            .field("attribute_processor", &self.attribute_processor.is_some())
            .field("merge", &self.merge.as_ref().map(|m| (m.max_latency, m.max_events)))
            .field("parse", &self.parse.is_some())
            .field("subscription", &self.subscription)
            .finish()
    }
}

impl<T> BroadcastOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按消息计算路由键；路由键同时写入 `_routing_key` 属性
    pub fn with_routing<R, S>(mut self, routing_key: R, subscription_key: S) -> Self
    where
        R: Fn(&T) -> String + Send + Sync + 'static,
        S: Fn(&MessageAttributes) -> Option<String> + Send + Sync + 'static,
    {
        self.routing = Some(RoutingOptions {
            routing_key: Arc::new(routing_key),
            subscription_key: Arc::new(subscription_key),
        });
        self
    }

    pub fn with_ordering_key<F>(mut self, ordering_key: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        self.ordering_key = Some(Arc::new(ordering_key));
        self
    }

    pub fn with_attribute_processor<A, F>(mut self, add_attributes: A, filter: F) -> Self
    where
        A: Fn(&T, &mut MessageAttributes) + Send + Sync + 'static,
        F: Fn(&MessageAttributes) -> bool + Send + Sync + 'static,
    {
        self.attribute_processor = Some(AttributeProcessor {
            add_attributes: Arc::new(add_attributes),
            filter: Arc::new(filter),
        });
        self
    }

    pub fn with_merge<M>(mut self, merge: M, max_latency: Duration, max_events: usize) -> Self
    where
        M: Fn(&mut T, &T) -> bool + Send + Sync + 'static,
    {
        self.merge = Some(MergeOptions {
            merge: Arc::new(merge),
            max_latency,
            max_events: max_events.max(1),
        });
        self
    }

    pub fn with_parse_func<P>(mut self, parse: P) -> Self
    where
        P: Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
    {
        self.parse = Some(Arc::new(parse));
        self
    }

    /// 以 JSON 反序列化外部传输送达的消息
    pub fn with_json_parse(self) -> Self
    where
        T: DeserializeOwned + 'static,
    {
        self.with_parse_func(|data: &[u8]| Ok(serde_json::from_slice(data)?))
    }

    pub fn with_unbounded_channel(mut self) -> Self {
        self.subscription = SubscriptionOptions::unbounded();
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.subscription = SubscriptionOptions::bounded(capacity);
        self
    }

    pub fn subscription_options(&self) -> SubscriptionOptions {
        self.subscription
    }

    pub fn has_routing(&self) -> bool {
        self.routing.is_some()
    }

    pub fn merge_options(&self) -> Result<&MergeOptions<T>> {
        self.merge
            .as_ref()
            .ok_or_else(|| CoreError::broadcast("no merge config specified"))
    }

    pub fn parse_to(&self, data: &[u8]) -> Result<T> {
        let parse = self.parse.as_ref().ok_or(CoreError::NoParseFunc)?;
        parse(data)
    }

    pub fn has_parse_func(&self) -> bool {
        self.parse.is_some()
    }

    pub fn routing_key(&self, msg: &T) -> Option<String> {
        self.routing.as_ref().map(|r| (r.routing_key)(msg))
    }

    /// 未设置时回退到路由键
    pub fn ordering_key(&self, msg: &T) -> Option<String> {
        match &self.ordering_key {
            Some(f) => Some(f(msg)),
            None => self.routing_key(msg),
        }
    }

    pub fn subscription_key(&self, attrs: &MessageAttributes) -> Option<String> {
        self.routing.as_ref().and_then(|r| (r.subscription_key)(attrs))
    }

    pub fn add_attributes(&self, msg: &T, attrs: &mut MessageAttributes) {
        if let Some(processor) = &self.attribute_processor {
            (processor.add_attributes)(msg, attrs);
        }
    }

    pub fn accepts(&self, attrs: &MessageAttributes) -> bool {
        self.attribute_processor
            .as_ref()
            .map_or(true, |processor| (processor.filter)(attrs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_key_falls_back_to_routing_key() {
        let opts = BroadcastOptions::<String>::new().with_routing(|m| format!("r-{}", m), |_| None);
        assert_eq!(opts.ordering_key(&"x".to_string()).as_deref(), Some("r-x"));

        let opts = opts.with_ordering_key(|m| format!("o-{}", m));
        assert_eq!(opts.ordering_key(&"x".to_string()).as_deref(), Some("o-x"));
        assert_eq!(opts.routing_key(&"x".to_string()).as_deref(), Some("r-x"));

        assert_eq!(BroadcastOptions::<String>::new().ordering_key(&"x".to_string()), None);
    }

    #[test]
    fn test_parse_to_requires_parse_func() {
        let opts = BroadcastOptions::<u32>::new();
        assert_eq!(opts.parse_to(b"1"), Err(CoreError::NoParseFunc));
        assert_eq!(
            CoreError::NoParseFunc.to_string(),
            "no parse func specified"
        );

        let opts = opts.with_json_parse();
        assert_eq!(opts.parse_to(b"42"), Ok(42));
        assert!(matches!(
            opts.parse_to(b"nope"),
            Err(CoreError::Serialization { .. })
        ));
    }

    #[test]
    fn test_merge_options_missing_is_error() {
        let opts = BroadcastOptions::<u32>::new();
        assert!(opts.merge_options().is_err());
        let opts = opts.with_merge(|a, b| {
            *a += *b;
            true
        }, Duration::from_millis(10), 0);
        assert_eq!(opts.merge_options().unwrap().max_events, 1);
    }

    #[test]
    fn test_attribute_processor_defaults_to_accept() {
        let opts = BroadcastOptions::<u32>::new();
        assert!(opts.accepts(&MessageAttributes::new()));

        let opts = opts.with_attribute_processor(
            |n, attrs| attrs.insert("_type", if n % 2 == 0 { "even" } else { "odd" }),
            |attrs| attrs.message_type() == Some("even"),
        );
        let mut attrs = MessageAttributes::new();
        opts.add_attributes(&3, &mut attrs);
        assert!(!opts.accepts(&attrs));
    }
}
