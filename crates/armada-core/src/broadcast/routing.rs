use dashmap::DashMap;
use std::sync::Arc;

/// 本节点订阅者对各路由键的兴趣计数
#[derive(Debug, Default)]
pub struct RoutingRegistry {
    interest: DashMap<String, usize>,
}

impl RoutingRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 登记兴趣，返回的守卫被丢弃时撤销
    pub fn register(self: &Arc<Self>, key: impl Into<String>) -> RouteGuard {
        let key = key.into();
        *self.interest.entry(key.clone()).or_insert(0) += 1;
        RouteGuard {
            registry: Arc::clone(self),
            key,
        }
    }

    pub fn has_route(&self, key: &str) -> bool {
        self.interest.get(key).is_some_and(|count| *count > 0)
    }

    pub fn route_count(&self) -> usize {
        self.interest.len()
    }

    fn release(&self, key: &str) {
        self.interest.remove_if_mut(key, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}

#[derive(Debug)]
pub struct RouteGuard {
    registry: Arc<RoutingRegistry>,
    key: String,
}

impl RouteGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}
