use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use armada_core::agent_types::Agent;
use armada_core::core_types::AgentId;
use armada_core::error::Result;

/// 请求 Agent 上报的内容
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSpec {
    /// 上报当前运行的配置
    #[serde(default)]
    pub configuration: bool,
    #[serde(default)]
    pub snapshot: Option<SnapshotSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSpec {
    pub pipeline_type: String,
    pub max_items: usize,
}

/// 与 Agent 通信的传输协议，每种线协议一个实现
#[async_trait]
pub trait Protocol: Send + Sync {
    fn name(&self) -> &str;

    async fn connected_agent_ids(&self) -> Result<Vec<AgentId>>;

    async fn request_report(&self, agent_id: &AgentId, spec: &ReportSpec) -> Result<()>;

    async fn send_heartbeat(&self, agent_id: &AgentId) -> Result<()>;

    /// 推送 Agent 的最新期望状态（例如新的 pending 配置）
    async fn update_agent(&self, agent: &Agent) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}
