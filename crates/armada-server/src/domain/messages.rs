use serde::{Deserialize, Serialize};

use armada_core::broadcast::{BroadcastOptions, MessageAttributes};
use armada_core::config::BroadcastConfig;
use armada_core::constants::ATTR_TYPE;
use armada_core::core_types::AgentId;

/// 需要推送给某个已连接 Agent 的消息，经广播送达持有该连接的节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub agent_id: AgentId,
    pub message_type: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl AgentMessage {
    pub fn new(agent_id: AgentId, message_type: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            agent_id,
            message_type: message_type.into(),
            body,
        }
    }

    /// Agent 消息广播的选项：消息类型写入 `_type`，跨节点以 JSON 传输
    pub fn broadcast_options(config: &BroadcastConfig) -> BroadcastOptions<AgentMessage> {
        BroadcastOptions::new()
            .with_attribute_processor(
                |msg: &AgentMessage, attrs: &mut MessageAttributes| {
                    attrs.insert(ATTR_TYPE, msg.message_type.clone())
                },
                |_: &MessageAttributes| true,
            )
            .with_json_parse()
            .with_channel_capacity(config.channel_capacity)
    }
}
