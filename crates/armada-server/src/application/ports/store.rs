use async_trait::async_trait;

use armada_core::agent_types::Agent;
use armada_core::configuration_types::Configuration;
use armada_core::core_types::AgentId;
use armada_core::error::Result;
use armada_core::eventbus::Source;
use armada_core::rollout_types::{Rollout, RolloutOptions};
use armada_core::selector::Selector;

use crate::domain::events::StoreUpdates;

/// Agent 读-改-写函数；冲突重试时可能被调用多次
pub type AgentUpdater<'a> = &'a (dyn Fn(&mut Agent) + Send + Sync);

pub type RolloutUpdater<'a> = &'a (dyn Fn(&mut Rollout) -> Result<()> + Send + Sync);

/// 持久化接口
///
/// 实现必须保证单个 Agent 与单个配置的更新是原子的（读-改-写不丢失并发修改），
/// 并且对同一配置的发布更新串行化。
#[async_trait]
pub trait Store: Send + Sync {
    async fn agent(&self, id: &AgentId) -> Result<Option<Agent>>;

    async fn agents(&self) -> Result<Vec<Agent>>;

    /// 不存在时以 `Agent::new(id)` 为初值
    async fn upsert_agent(&self, id: &AgentId, updater: AgentUpdater<'_>) -> Result<Agent>;

    /// 仅修改已存在的 Agent，不存在时返回 AgentNotFound
    async fn update_agent(&self, id: &AgentId, updater: AgentUpdater<'_>) -> Result<Agent>;

    /// 标记为 Deleted 并通知订阅者后移除，返回被删除的 Agent
    async fn delete_agents(&self, ids: &[AgentId]) -> Result<Vec<Agent>>;

    /// 配置的最新版本
    async fn configuration(&self, name: &str) -> Result<Option<Configuration>>;

    async fn configurations(&self) -> Result<Vec<Configuration>>;

    /// 选择器或内容变化时生成新版本，取代上一版本未结束的发布；否则返回当前版本
    async fn apply_configuration(
        &self,
        name: &str,
        selector: Selector,
        content: &str,
        options: RolloutOptions,
    ) -> Result<Configuration>;

    /// 原子地修改最新版本的发布状态
    async fn update_rollout(&self, name: &str, updater: RolloutUpdater<'_>) -> Result<Configuration>;

    /// 为所有进行中的发布重新统计进度并推进，返回本次新标记为 pending 的 Agent 数
    async fn update_all_rollouts(&self) -> Result<usize>;

    /// Store 变更事件源
    fn updates(&self) -> Source<StoreUpdates>;
}
