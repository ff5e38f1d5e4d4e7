use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use armada_core::agent_types::{Agent, AgentStatus};
use armada_core::backoff::retry_retriable;
use armada_core::broadcast::{Broadcast, BroadcastOptions, LocalBroadcast};
use armada_core::config::BroadcastConfig;
use armada_core::configuration_types::Configuration;
use armada_core::constants::BROADCAST_STORE_UPDATES;
use armada_core::core_types::{AgentId, NodeId};
use armada_core::error::{CoreError, Result};
use armada_core::eventbus::{Receiver, Source};
use armada_core::rollout_types::{Rollout, RolloutOptions, RolloutProgress, RolloutStatus};
use armada_core::selector::Selector;

use crate::application::ports::store::{AgentUpdater, RolloutUpdater, Store};
use crate::domain::events::{ChangeKind, StoreUpdates};

/// 内存 Store：DashMap + 每条记录的修订号做乐观并发控制
pub struct MemoryStore {
    agents: DashMap<AgentId, Agent>,
    /// 配置名 -> 按版本升序的全部版本
    configurations: DashMap<String, Vec<Configuration>>,
    updates: LocalBroadcast<StoreUpdates>,
    /// 串行化 update_all_rollouts
    rollout_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new(node_id: NodeId, config: &BroadcastConfig, token: CancellationToken) -> Self {
        let options = BroadcastOptions::new()
            .with_merge(
                |acc: &mut StoreUpdates, next: &StoreUpdates| acc.merge(next),
                Duration::from_millis(config.merge_max_latency_ms),
                config.merge_max_events,
            )
            .with_channel_capacity(config.channel_capacity);
        Self {
            agents: DashMap::new(),
            configurations: DashMap::new(),
            updates: LocalBroadcast::new(BROADCAST_STORE_UPDATES, node_id, options, token),
            rollout_lock: Mutex::new(()),
        }
    }

    async fn publish(&self, updates: StoreUpdates) {
        if !updates.is_empty() {
            self.updates.send(updates).await;
        }
    }

    fn try_upsert_agent(
        &self,
        id: &AgentId,
        updater: AgentUpdater<'_>,
    ) -> Result<(Agent, ChangeKind, Option<String>)> {
        let current = self.agents.get(id).map(|entry| entry.value().clone());
        let expected = current.as_ref().map(|agent| agent.revision);
        let previous_pending = current
            .as_ref()
            .and_then(|agent| agent.pending_configuration().map(str::to_string));
        let kind = if current.is_some() {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };

        let mut agent = current.unwrap_or_else(|| Agent::new(id.clone()));
        updater(&mut agent);
        agent.id = id.clone();
        let agent = self.swap_agent(agent, expected)?;
        Ok((agent, kind, previous_pending))
    }

    fn try_update_agent(&self, id: &AgentId, updater: AgentUpdater<'_>) -> Result<(Agent, Option<String>)> {
        let mut agent = self
            .agents
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::agent_not_found(id.to_string()))?;
        let expected = agent.revision;
        let previous_pending = agent.pending_configuration().map(str::to_string);
        updater(&mut agent);
        agent.id = id.clone();
        // 读取后被删除时 swap 返回 Conflict，重试后得到 AgentNotFound
        let agent = self.swap_agent(agent, Some(expected))?;
        Ok((agent, previous_pending))
    }

    /// 修订号与 `expected` 一致时写入，否则返回 Conflict
    fn swap_agent(&self, mut agent: Agent, expected: Option<u64>) -> Result<Agent> {
        match self.agents.entry(agent.id.clone()) {
            Entry::Occupied(mut entry) => {
                let actual = entry.get().revision;
                if expected != Some(actual) {
                    return Err(CoreError::Conflict {
                        entity: format!("agent {}", agent.id),
                        expected: expected.unwrap_or(0),
                        actual,
                    });
                }
                agent.revision = actual + 1;
                entry.insert(agent.clone());
                Ok(agent)
            }
            Entry::Vacant(entry) => {
                if let Some(expected) = expected {
                    return Err(CoreError::Conflict {
                        entity: format!("agent {}", agent.id),
                        expected,
                        actual: 0,
                    });
                }
                agent.revision = 1;
                entry.insert(agent.clone());
                Ok(agent)
            }
        }
    }

    fn latest(&self, name: &str) -> Option<Configuration> {
        self.configurations
            .get(name)
            .and_then(|versions| versions.last().cloned())
    }

    fn try_update_rollout(&self, name: &str, updater: RolloutUpdater<'_>) -> Result<Configuration> {
        let current = self
            .latest(name)
            .ok_or_else(|| CoreError::configuration_not_found(name))?;
        let mut rollout = current.rollout.clone();
        updater(&mut rollout)?;
        self.swap_rollout(name, current.version, current.revision, rollout)
    }

    /// 仅当最新版本仍是 `version` 且修订号未变时写入
    fn swap_rollout(
        &self,
        name: &str,
        version: u32,
        expected: u64,
        rollout: Rollout,
    ) -> Result<Configuration> {
        let mut versions = self
            .configurations
            .get_mut(name)
            .ok_or_else(|| CoreError::configuration_not_found(name))?;
        let latest = versions
            .last_mut()
            .ok_or_else(|| CoreError::configuration_not_found(name))?;
        if latest.version != version || latest.revision != expected {
            return Err(CoreError::Conflict {
                entity: format!("configuration {}", name),
                expected,
                actual: latest.revision,
            });
        }
        latest.rollout = rollout;
        latest.revision += 1;
        Ok(latest.clone())
    }

    /// 写入新版本，返回 (新版本, 被取代的上一版本)
    fn insert_version(
        &self,
        name: &str,
        selector: Selector,
        content: &str,
        options: RolloutOptions,
    ) -> (Configuration, Option<Configuration>, bool) {
        let mut versions = self.configurations.entry(name.to_string()).or_default();
        let Some(latest) = versions.last_mut() else {
            let mut configuration = Configuration::new(name, selector, content, options);
            configuration.revision = 1;
            versions.push(configuration.clone());
            return (configuration, None, true);
        };
        if latest.selector == selector && latest.content == content {
            return (latest.clone(), None, false);
        }

        let mut next = latest.new_version(selector, content, options);
        next.revision = 1;
        let replaced = if latest.rollout.is_in_flight() && latest.rollout.replace() {
            latest.revision += 1;
            Some(latest.clone())
        } else {
            None
        };
        versions.push(next.clone());
        (next, replaced, true)
    }

    /// 为进行中的发布分配下一阶段的 Agent
    async fn advance_rollout(&self, configuration: &Configuration, agents: &[Agent]) -> Result<usize> {
        let nv = configuration.name_and_version();
        let targeted: Vec<&Agent> = agents
            .iter()
            .filter(|agent| agent.status != AgentStatus::Deleted && configuration.matches(&agent.labels))
            .collect();
        let progress = rollout_progress(&nv, &targeted);

        let mut rollout = configuration.rollout.clone();
        let new_pending = rollout.update_status(progress);
        let updated = match self.swap_rollout(
            &configuration.name,
            configuration.version,
            configuration.revision,
            rollout,
        ) {
            Ok(updated) => updated,
            Err(e) if e.is_retriable() => {
                debug!(configuration = %nv, error = %e, "Rollout changed concurrently, skipping this tick");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        if updated.rollout != configuration.rollout {
            self.publish(StoreUpdates::configuration(ChangeKind::Update, updated.clone()))
                .await;
        }

        if updated.rollout.status == RolloutStatus::Error {
            if configuration.rollout.status != RolloutStatus::Error {
                warn!(
                    configuration = %nv,
                    errors = updated.rollout.progress.errors,
                    max_errors = updated.rollout.options.max_errors,
                    "Rollout exceeded error threshold"
                );
                if updated.rollout.options.rollback_on_failure {
                    self.rollback(&nv, &targeted).await?;
                }
            }
            return Ok(0);
        }

        if new_pending == 0 {
            return Ok(0);
        }

        let mut waiting: Vec<&Agent> = targeted
            .into_iter()
            .filter(|agent| {
                agent.current_configuration() != Some(nv.as_str())
                    && agent.pending_configuration() != Some(nv.as_str())
            })
            .collect();
        // 已排队的 future 优先，其次是在线的 Agent
        waiting.sort_by(|a, b| {
            let rank = |agent: &Agent| {
                (
                    agent.future_configuration() != Some(nv.as_str()),
                    !agent.is_connected(),
                )
            };
            rank(a).cmp(&rank(b)).then_with(|| a.id.cmp(&b.id))
        });

        let mut assigned = 0;
        for agent in waiting.into_iter().take(new_pending as usize) {
            match self
                .update_agent(&agent.id, &|agent: &mut Agent| {
                    agent.set_pending_configuration(Some(&nv))
                })
                .await
            {
                Ok(_) => assigned += 1,
                Err(CoreError::AgentNotFound { .. }) => {
                    debug!(agent_id = %agent.id, "Agent deleted before assignment");
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            configuration = %nv,
            phase = updated.rollout.phase,
            targeted = updated.rollout.progress.total(),
            assigned,
            "Rollout advanced"
        );
        Ok(assigned)
    }

    /// 撤销该版本仍处于 pending 的分配
    async fn rollback(&self, nv: &str, targeted: &[&Agent]) -> Result<()> {
        for agent in targeted
            .iter()
            .filter(|agent| agent.pending_configuration() == Some(nv))
        {
            let reverted = self
                .update_agent(&agent.id, &|agent: &mut Agent| {
                    if agent.pending_configuration() == Some(nv) {
                        agent.configuration_status.pending = None;
                    }
                })
                .await;
            match reverted {
                Ok(_) | Err(CoreError::AgentNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        info!(configuration = %nv, "Rolled back pending assignments");
        Ok(())
    }
}

/// 由 Agent 当前状态统计发布进度
fn rollout_progress(nv: &str, agents: &[&Agent]) -> RolloutProgress {
    let mut progress = RolloutProgress::default();
    for agent in agents {
        if agent.current_configuration() == Some(nv) {
            progress.completed += 1;
        } else if agent.pending_configuration() == Some(nv) {
            if agent.status == AgentStatus::Error {
                progress.errors += 1;
            } else {
                progress.pending += 1;
            }
        } else {
            progress.waiting += 1;
        }
    }
    progress
}

#[async_trait]
impl Store for MemoryStore {
    async fn agent(&self, id: &AgentId) -> Result<Option<Agent>> {
        Ok(self.agents.get(id).map(|entry| entry.value().clone()))
    }

    async fn agents(&self) -> Result<Vec<Agent>> {
        let mut agents: Vec<Agent> = self.agents.iter().map(|entry| entry.value().clone()).collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn upsert_agent(&self, id: &AgentId, updater: AgentUpdater<'_>) -> Result<Agent> {
        let (agent, kind, previous_pending) =
            retry_retriable(|| std::future::ready(self.try_upsert_agent(id, updater))).await?;
        self.publish(StoreUpdates::agent(kind, agent.clone(), previous_pending))
            .await;
        Ok(agent)
    }

    async fn update_agent(&self, id: &AgentId, updater: AgentUpdater<'_>) -> Result<Agent> {
        let (agent, previous_pending) =
            retry_retriable(|| std::future::ready(self.try_update_agent(id, updater))).await?;
        self.publish(StoreUpdates::agent(ChangeKind::Update, agent.clone(), previous_pending))
            .await;
        Ok(agent)
    }

    async fn delete_agents(&self, ids: &[AgentId]) -> Result<Vec<Agent>> {
        let mut deleted = Vec::with_capacity(ids.len());
        let mut updates = StoreUpdates::default();
        for id in ids {
            if let Some((_, mut agent)) = self.agents.remove(id) {
                let previous_pending = agent.pending_configuration().map(str::to_string);
                agent.status = AgentStatus::Deleted;
                updates.merge(&StoreUpdates::agent(
                    ChangeKind::Remove,
                    agent.clone(),
                    previous_pending,
                ));
                deleted.push(agent);
            }
        }
        self.publish(updates).await;
        Ok(deleted)
    }

    async fn configuration(&self, name: &str) -> Result<Option<Configuration>> {
        Ok(self.latest(name))
    }

    async fn configurations(&self) -> Result<Vec<Configuration>> {
        let mut configurations: Vec<Configuration> = self
            .configurations
            .iter()
            .filter_map(|entry| entry.value().last().cloned())
            .collect();
        configurations.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(configurations)
    }

    async fn apply_configuration(
        &self,
        name: &str,
        selector: Selector,
        content: &str,
        options: RolloutOptions,
    ) -> Result<Configuration> {
        options.validate()?;
        let (configuration, replaced, created) = self.insert_version(name, selector, content, options);
        if !created {
            return Ok(configuration);
        }

        let nv = configuration.name_and_version();
        info!(configuration = %nv, status = configuration.rollout.status.as_str(), "Configuration version created");

        let mut updates = StoreUpdates::configuration(ChangeKind::Insert, configuration.clone());
        if let Some(previous) = replaced {
            info!(configuration = %previous.name_and_version(), "Rollout replaced by newer version");
            updates.merge(&StoreUpdates::configuration(ChangeKind::Update, previous));
        }
        self.publish(updates).await;

        let matching: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|entry| entry.status != AgentStatus::Deleted && configuration.matches(&entry.labels))
            .map(|entry| entry.key().clone())
            .collect();
        for id in matching {
            let queued = self
                .update_agent(&id, &|agent: &mut Agent| {
                    agent.set_future_configuration(Some(&nv))
                })
                .await;
            match queued {
                Ok(_) | Err(CoreError::AgentNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(configuration)
    }

    async fn update_rollout(&self, name: &str, updater: RolloutUpdater<'_>) -> Result<Configuration> {
        let configuration =
            retry_retriable(|| std::future::ready(self.try_update_rollout(name, updater))).await?;
        self.publish(StoreUpdates::configuration(ChangeKind::Update, configuration.clone()))
            .await;
        Ok(configuration)
    }

    async fn update_all_rollouts(&self) -> Result<usize> {
        let _guard = self.rollout_lock.lock().await;
        let agents = self.agents().await?;
        let mut total = 0;
        for configuration in self.configurations().await? {
            if !configuration.rollout.status.is_active() {
                continue;
            }
            total += self.advance_rollout(&configuration, &agents).await?;
        }
        Ok(total)
    }

    fn updates(&self) -> Source<StoreUpdates> {
        self.updates.consumer()
    }
}
