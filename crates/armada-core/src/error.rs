//! 统一错误处理系统

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 核心错误类型 - 统一的错误处理
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CoreError {
    // === 序列化错误 ===
    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    // === 配置错误 ===
    #[error("Config error: {message}")]
    Config { message: String },

    // === 广播层错误 ===
    #[error("Broadcast error: {message}")]
    Broadcast { message: String },

    #[error("no parse func specified")]
    NoParseFunc,

    // === Agent / 配置相关错误 ===
    #[error("Agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    #[error("Configuration not found: {name}")]
    ConfigurationNotFound { name: String },

    /// 乐观锁冲突，调用方可重试
    #[error("Version conflict on {entity}: expected {expected}, found {actual}")]
    Conflict {
        entity: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid rollout transition: {reason}")]
    InvalidRollout { reason: String },

    // === 协议与网络错误 ===
    #[error("Protocol {protocol} error: {message}")]
    Protocol { protocol: String, message: String },

    #[error("NATS error: {message}")]
    Nats { message: String },

    // === 系统错误 ===
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Service unavailable: {service}")]
    ServiceUnavailable { service: String },
}

impl CoreError {
    /// 判断错误是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CoreError::Conflict { .. } | CoreError::Nats { .. } | CoreError::ServiceUnavailable { .. }
        )
    }

    pub fn agent_not_found(agent_id: impl Into<String>) -> Self {
        CoreError::AgentNotFound {
            agent_id: agent_id.into(),
        }
    }

    pub fn configuration_not_found(name: impl Into<String>) -> Self {
        CoreError::ConfigurationNotFound { name: name.into() }
    }

    pub fn invalid_rollout(reason: impl Into<String>) -> Self {
        CoreError::InvalidRollout {
            reason: reason.into(),
        }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        CoreError::Config {
            message: message.into(),
        }
    }

    pub fn broadcast(message: impl Into<String>) -> Self {
        CoreError::Broadcast {
            message: message.into(),
        }
    }

    pub fn protocol(protocol: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Protocol {
            protocol: protocol.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CoreError::Internal {
            message: message.into(),
        }
    }
}

/// Core 操作的 Result 类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<async_nats::Error> for CoreError {
    fn from(err: async_nats::Error) -> Self {
        CoreError::Nats {
            message: err.to_string(),
        }
    }
}

impl From<async_nats::ConnectError> for CoreError {
    fn from(err: async_nats::ConnectError) -> Self {
        CoreError::ServiceUnavailable {
            service: format!("nats: {}", err),
        }
    }
}

impl From<async_nats::SubscribeError> for CoreError {
    fn from(err: async_nats::SubscribeError) -> Self {
        CoreError::Nats {
            message: err.to_string(),
        }
    }
}

impl From<async_nats::PublishError> for CoreError {
    fn from(err: async_nats::PublishError) -> Self {
        CoreError::Nats {
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Internal {
            message: err.to_string(),
        }
    }
}
