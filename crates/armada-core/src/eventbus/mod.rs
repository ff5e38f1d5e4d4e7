//! 进程内事件总线
//!
//! 泛型的多订阅者扇出原语：[`Source`] 负责分发，[`Subscription`] 是订阅端，
//! [`Receiver`] 是只写能力，`relay_*` 在两者之间搭建后台转发任务。
//! 投递语义为进程内 at-most-once，不持久化、不重投。

mod relay;
mod source;
mod subscription;

pub use relay::{relay, relay_with_filter, relay_with_merge};
pub use source::{Receiver, Source};
pub use subscription::Subscription;

use crate::constants::DEFAULT_CHANNEL_CAPACITY;

/// 订阅通道选项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// 有界通道容量；`unbounded` 为 true 时忽略
    pub capacity: usize,
    /// 无界通道：发送端永不阻塞，代价是慢订阅者会使内存持续增长
    pub unbounded: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CHANNEL_CAPACITY,
            unbounded: false,
        }
    }
}

impl SubscriptionOptions {
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            unbounded: false,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            capacity: DEFAULT_CHANNEL_CAPACITY,
            unbounded: true,
        }
    }
}
