//! Armada Server - Agent 舰队控制面
//!
//! 分层遵循 DDD：`domain` 为变更事件与消息，`application` 为端口、Manager
//! 与灰度调度器，`infrastructure` 为内存 Store、后台监控与生命周期管理。

pub mod application;
pub mod bootstrap;
pub mod domain;
pub mod infrastructure;

// 重新导出核心类型
pub use armada_core::*;
