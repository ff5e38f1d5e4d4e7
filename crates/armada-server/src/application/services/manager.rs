//! 控制面入口
//!
//! Manager 持有 Store、全部 Protocol、Agent 消息广播与灰度调度器，
//! 把协议层上报的事件写入 Store，并把 Store 的变化推回协议层。

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use armada_core::agent_types::{Agent, AgentStatus};
use armada_core::broadcast::Broadcast;
use armada_core::config::ArmadaConfig;
use armada_core::configuration_types::Configuration;
use armada_core::core_types::AgentId;
use armada_core::error::{CoreError, Result};
use armada_core::eventbus::{Receiver, Source, SubscriptionOptions, relay_with_filter};
use armada_core::rollout_types::{Rollout, RolloutOptions};
use armada_core::selector::{Labels, Selector};
use armada_core::shutdown::wait_for_tasks_with_timeout;

use crate::application::ports::{Protocol, ReportSpec, Store};
use crate::application::services::scheduler::{RolloutScheduler, SchedulerError};
use crate::domain::events::StoreUpdates;
use crate::domain::messages::AgentMessage;
use crate::infrastructure::monitor::CleanupMonitor;

/// Manager 的运行参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerOptions {
    pub rollout_interval: Duration,
    pub cleanup_interval: Duration,
    /// `None` 时不清理断线 Agent
    pub disconnected_ttl: Option<Duration>,
    pub channel_capacity: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from(&ArmadaConfig::default())
    }
}

impl From<&ArmadaConfig> for ManagerOptions {
    fn from(config: &ArmadaConfig) -> Self {
        let ttl = config.cleanup.disconnected_ttl_sec;
        Self {
            rollout_interval: Duration::from_millis(config.scheduler.rollout_interval_ms),
            cleanup_interval: Duration::from_secs(config.cleanup.interval_sec),
            disconnected_ttl: (ttl > 0).then(|| Duration::from_secs(ttl)),
            channel_capacity: config.broadcast.channel_capacity,
        }
    }
}

pub struct Manager {
    store: Arc<dyn Store>,
    protocols: Vec<Arc<dyn Protocol>>,
    agent_messages: Arc<dyn Broadcast<AgentMessage>>,
    scheduler: RolloutScheduler,
    options: ManagerOptions,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    /// 后台任务的生命周期与 `token` 绑定
    pub fn new(
        store: Arc<dyn Store>,
        protocols: Vec<Arc<dyn Protocol>>,
        agent_messages: Arc<dyn Broadcast<AgentMessage>>,
        options: ManagerOptions,
        token: CancellationToken,
    ) -> Self {
        let scheduler = RolloutScheduler::new(store.clone(), options.rollout_interval);
        Self {
            store,
            protocols,
            agent_messages,
            scheduler,
            options,
            token,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn protocols(&self) -> &[Arc<dyn Protocol>] {
        &self.protocols
    }

    /// 启动灰度调度器与后台服务
    pub async fn start(&self) -> std::result::Result<(), SchedulerError> {
        self.scheduler.start(&self.token).await?;

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_pending_notifier());
        tasks.push(self.spawn_message_logger());
        if let Some(ttl) = self.options.disconnected_ttl {
            let monitor = CleanupMonitor::new(
                self.store.clone(),
                self.options.cleanup_interval,
                ttl,
                self.token.child_token(),
            );
            tasks.push(monitor.spawn());
        }

        info!(
            protocols = self.protocols.len(),
            background_tasks = tasks.len(),
            "Manager started"
        );
        Ok(())
    }

    /// 停止调度器与后台任务，随后关闭所有协议
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down manager");
        match self.scheduler.stop(timeout).await {
            Ok(()) | Err(SchedulerError::NotStarted) => {}
            Err(e) => warn!(error = %e, "Rollout scheduler did not stop cleanly"),
        }

        self.token.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        if !wait_for_tasks_with_timeout(tasks, timeout).await {
            warn!("Some manager tasks were aborted");
        }

        let results = join_all(self.protocols.iter().map(|protocol| async move {
            (protocol.name().to_string(), protocol.shutdown().await)
        }))
        .await;
        for (name, result) in results {
            if let Err(e) = result {
                warn!(protocol = %name, error = %e, "Protocol shutdown failed");
            }
        }
        info!("Manager shut down");
        Ok(())
    }

    // === Agent 上报 ===

    /// Agent 建立连接或重新上报身份
    pub async fn agent_connected(&self, id: &AgentId, version: &str, labels: Labels) -> Result<Agent> {
        let agent = self
            .store
            .upsert_agent(id, &|agent: &mut Agent| {
                agent.connect(version);
                agent.labels = labels.clone();
                if agent.status == AgentStatus::Disconnected {
                    agent.status = AgentStatus::Connected;
                }
            })
            .await?;
        info!(agent_id = %id, version, "Agent connected");
        Ok(agent)
    }

    pub async fn agent_disconnected(&self, id: &AgentId) -> Result<Agent> {
        let agent = self
            .store
            .update_agent(id, &|agent: &mut Agent| agent.disconnect())
            .await?;
        info!(agent_id = %id, "Agent disconnected");
        Ok(agent)
    }

    /// Agent 上报配置应用结果；失败时保留 pending 并记为错误
    pub async fn agent_reported_configuration(
        &self,
        id: &AgentId,
        name_and_version: &str,
        error: Option<&str>,
    ) -> Result<Agent> {
        let agent = self
            .store
            .update_agent(id, &|agent: &mut Agent| match error {
                Some(message) => agent.set_error(message),
                None => agent.configuration_applied(name_and_version),
            })
            .await?;
        match error {
            Some(message) => warn!(agent_id = %id, configuration = name_and_version, error = message, "Agent failed to apply configuration"),
            None => debug!(agent_id = %id, configuration = name_and_version, "Agent applied configuration"),
        }
        Ok(agent)
    }

    pub async fn agent_upgrade_started(
        &self,
        id: &AgentId,
        version: &str,
        packages_hash: &str,
    ) -> Result<Agent> {
        self.store
            .update_agent(id, &|agent: &mut Agent| agent.upgrade_started(version, packages_hash))
            .await
    }

    /// `error` 为空表示升级成功
    pub async fn agent_upgrade_complete(&self, id: &AgentId, version: &str, error: &str) -> Result<Agent> {
        let agent = self
            .store
            .update_agent(id, &|agent: &mut Agent| agent.upgrade_complete(version, error))
            .await?;
        if error.is_empty() {
            info!(agent_id = %id, version, "Agent upgrade complete");
        } else {
            warn!(agent_id = %id, version, error, "Agent upgrade failed");
        }
        Ok(agent)
    }

    // === 运维操作 ===

    /// 请求 Agent 升级到指定版本并通知协议层
    pub async fn upgrade_agent(&self, id: &AgentId, version: &str) -> Result<Agent> {
        let current = self.require_agent(id).await?;
        if !current.supports_upgrade() {
            return Err(CoreError::protocol(
                "upgrade",
                format!("agent {} version '{}' does not support upgrade", id, current.version),
            ));
        }
        let agent = self
            .store
            .update_agent(id, &|agent: &mut Agent| agent.upgrade_to(version))
            .await?;
        self.notify_protocols(&agent).await;
        Ok(agent)
    }

    pub async fn delete_agents(&self, ids: &[AgentId]) -> Result<Vec<Agent>> {
        let deleted = self.store.delete_agents(ids).await?;
        info!(requested = ids.len(), deleted = deleted.len(), "Agents deleted");
        Ok(deleted)
    }

    pub async fn apply_configuration(
        &self,
        name: &str,
        selector: Selector,
        content: &str,
        options: RolloutOptions,
    ) -> Result<Configuration> {
        self.store
            .apply_configuration(name, selector, content, options)
            .await
    }

    pub async fn start_rollout(&self, name: &str) -> Result<Configuration> {
        self.transition_rollout(name, "start", &|rollout: &mut Rollout| rollout.start())
            .await
    }

    pub async fn pause_rollout(&self, name: &str) -> Result<Configuration> {
        self.transition_rollout(name, "pause", &|rollout: &mut Rollout| rollout.pause())
            .await
    }

    pub async fn resume_rollout(&self, name: &str) -> Result<Configuration> {
        self.transition_rollout(name, "resume", &|rollout: &mut Rollout| rollout.resume())
            .await
    }

    // === 协议扇出 ===

    /// 向所有协议请求上报；仅当全部协议失败时返回错误
    pub async fn request_report(&self, id: &AgentId, spec: &ReportSpec) -> Result<()> {
        let results = join_all(
            self.protocols
                .iter()
                .map(|protocol| protocol.request_report(id, spec)),
        )
        .await;
        self.collect_fanout("request_report", results)
    }

    pub async fn send_heartbeat(&self, id: &AgentId) -> Result<()> {
        let results = join_all(
            self.protocols
                .iter()
                .map(|protocol| protocol.send_heartbeat(id)),
        )
        .await;
        self.collect_fanout("send_heartbeat", results)
    }

    /// 所有协议上已连接 Agent 的并集
    pub async fn connected_agent_ids(&self) -> Result<Vec<AgentId>> {
        let results = join_all(
            self.protocols
                .iter()
                .map(|protocol| protocol.connected_agent_ids()),
        )
        .await;
        let mut ids = BTreeSet::new();
        for (protocol, result) in self.protocols.iter().zip(results) {
            match result {
                Ok(found) => ids.extend(found),
                Err(e) => warn!(protocol = protocol.name(), error = %e, "Failed to list connected agents"),
            }
        }
        Ok(ids.into_iter().collect())
    }

    // === Agent 消息 ===

    pub async fn send_agent_message(&self, msg: AgentMessage) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(CoreError::ServiceUnavailable {
                service: "manager".to_string(),
            });
        }
        self.agent_messages.producer().send(msg).await;
        Ok(())
    }

    /// 协议层订阅此源，把消息推送给各自持有连接的 Agent
    pub fn agent_messages(&self) -> Source<AgentMessage> {
        self.agent_messages.consumer()
    }

    // === 内部 ===

    async fn require_agent(&self, id: &AgentId) -> Result<Agent> {
        self.store
            .agent(id)
            .await?
            .ok_or_else(|| CoreError::agent_not_found(id.as_str()))
    }

    async fn transition_rollout(
        &self,
        name: &str,
        action: &str,
        updater: &(dyn Fn(&mut Rollout) -> Result<()> + Send + Sync),
    ) -> Result<Configuration> {
        let configuration = self.store.update_rollout(name, updater).await?;
        info!(
            configuration = %configuration.name_and_version(),
            action,
            status = configuration.rollout.status.as_str(),
            "Rollout status changed"
        );
        Ok(configuration)
    }

    async fn notify_protocols(&self, agent: &Agent) {
        notify_all(&self.protocols, agent).await;
    }

    fn collect_fanout(&self, operation: &str, results: Vec<Result<()>>) -> Result<()> {
        let mut first_error = None;
        let mut succeeded = results.is_empty();
        for (protocol, result) in self.protocols.iter().zip(results) {
            match result {
                Ok(()) => succeeded = true,
                Err(e) => {
                    debug!(protocol = protocol.name(), operation, error = %e, "Protocol request failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) if !succeeded => Err(e),
            _ => Ok(()),
        }
    }

    /// Store 中新分配 pending 配置的 Agent 推送给协议层
    fn spawn_pending_notifier(&self) -> JoinHandle<()> {
        let notifier = ProtocolNotifier {
            protocols: self.protocols.clone(),
        };
        relay_with_filter(
            self.token.child_token(),
            &self.store.updates(),
            newly_pending,
            notifier,
            SubscriptionOptions::bounded(self.options.channel_capacity),
        )
    }

    fn spawn_message_logger(&self) -> JoinHandle<()> {
        let mut messages = self
            .agent_messages
            .consumer()
            .subscribe_until(self.token.child_token(), SubscriptionOptions::bounded(self.options.channel_capacity));
        let broadcast = self.agent_messages.name().to_string();
        tokio::spawn(async move {
            while let Some(msg) = messages.recv().await {
                debug!(
                    broadcast = %broadcast,
                    agent_id = %msg.agent_id,
                    message_type = %msg.message_type,
                    "Agent message"
                );
            }
        })
    }
}

/// 批量变更中新分配了 pending 配置的 Agent
fn newly_pending(updates: StoreUpdates) -> Option<Vec<Agent>> {
    let agents: Vec<Agent> = updates
        .agents
        .into_iter()
        .filter(|change| change.pending_assigned().is_some())
        .map(|change| change.agent)
        .collect();
    (!agents.is_empty()).then_some(agents)
}

async fn notify_all(protocols: &[Arc<dyn Protocol>], agent: &Agent) {
    let results = join_all(protocols.iter().map(|protocol| protocol.update_agent(agent))).await;
    for (protocol, result) in protocols.iter().zip(results) {
        if let Err(e) = result {
            warn!(protocol = protocol.name(), agent_id = %agent.id, error = %e, "Failed to push agent update");
        }
    }
}

struct ProtocolNotifier {
    protocols: Vec<Arc<dyn Protocol>>,
}

#[async_trait]
impl Receiver<Vec<Agent>> for ProtocolNotifier {
    async fn send(&self, agents: Vec<Agent>) {
        for agent in &agents {
            notify_all(&self.protocols, agent).await;
        }
    }
}
