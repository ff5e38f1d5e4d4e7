// 广播消息保留属性键（分布式传输下需保持线上稳定）
pub const ATTR_ORIGIN: &str = "_origin";
pub const ATTR_TYPE: &str = "_type";
pub const ATTR_ACCOUNT_ID: &str = "_account_id";
pub const ATTR_ROUTING_KEY: &str = "_routing_key";

// NATS 广播主题（最终形如：armada.broadcast.<name>）
pub const BROADCAST_SUBJECT_PREFIX: &str = "armada.broadcast";

// 广播名称
pub const BROADCAST_AGENT_MESSAGES: &str = "agent-messages";
pub const BROADCAST_STORE_UPDATES: &str = "store-updates";

// 订阅通道默认容量
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

// 合并窗口默认值
pub const DEFAULT_MERGE_MAX_LATENCY_MS: u64 = 100;
pub const DEFAULT_MERGE_MAX_EVENTS: usize = 100;

// 灰度调度间隔（毫秒）
pub const DEFAULT_ROLLOUT_INTERVAL_MS: u64 = 10_000;

/// 生成广播主题
pub fn broadcast_subject(prefix: &str, name: &str) -> String {
    format!("{}.{}", prefix, name)
}
