use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::application::ports::Store;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("rollout scheduler already started")]
    AlreadyStarted,
    #[error("rollout scheduler not started")]
    NotStarted,
    #[error("rollout scheduler did not stop within {0:?}")]
    StopTimeout(Duration),
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 灰度调度器 - 按固定间隔驱动 `Store::update_all_rollouts`
pub struct RolloutScheduler {
    store: Arc<dyn Store>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl RolloutScheduler {
    pub fn new(store: Arc<dyn Store>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// 启动调度循环；`parent` 取消时循环同样退出
    pub async fn start(&self, parent: &CancellationToken) -> Result<(), SchedulerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let token = parent.child_token();
        let handle = tokio::spawn(run(self.store.clone(), self.interval, token.clone()));
        *running = Some(Running { token, handle });
        Ok(())
    }

    /// 取消调度循环并等待其退出，最多等待 `timeout`
    pub async fn stop(&self, timeout: Duration) -> Result<(), SchedulerError> {
        let Some(Running { token, handle }) = self.running.lock().await.take() else {
            return Err(SchedulerError::NotStarted);
        };
        token.cancel();

        let abort = handle.abort_handle();
        match tokio::time::timeout(timeout, handle).await {
            Ok(_) => Ok(()),
            Err(_) => {
                abort.abort();
                Err(SchedulerError::StopTimeout(timeout))
            }
        }
    }
}

async fn run(store: Arc<dyn Store>, period: Duration, token: CancellationToken) {
    info!(interval_ms = period.as_millis() as u64, "RolloutScheduler started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                match store.update_all_rollouts().await {
                    Ok(0) => {}
                    Ok(assigned) => debug!(assigned, "Rollout tick assigned pending configurations"),
                    // 单次失败不影响后续调度
                    Err(e) => error!(error = %e, "Error updating rollouts"),
                }
            }
        }
    }

    info!("RolloutScheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use armada_core::agent_types::Agent;
    use armada_core::config::BroadcastConfig;
    use armada_core::configuration_types::Configuration;
    use armada_core::core_types::{AgentId, NodeId};
    use armada_core::error::{CoreError, Result};
    use armada_core::eventbus::Source;
    use armada_core::rollout_types::{PhaseAgentCount, RolloutOptions};
    use armada_core::selector::Selector;

    use crate::application::ports::store::{AgentUpdater, RolloutUpdater};
    use crate::domain::events::StoreUpdates;
    use crate::infrastructure::persistence::MemoryStore;

    /// 前 `failures` 次 update_all_rollouts 返回错误，其余委托给 MemoryStore
    struct FailingStore {
        inner: Arc<MemoryStore>,
        failures: usize,
        ticks: AtomicUsize,
    }

    #[async_trait]
    impl Store for FailingStore {
        async fn agent(&self, id: &AgentId) -> Result<Option<Agent>> {
            self.inner.agent(id).await
        }

        async fn agents(&self) -> Result<Vec<Agent>> {
            self.inner.agents().await
        }

        async fn upsert_agent(&self, id: &AgentId, updater: AgentUpdater<'_>) -> Result<Agent> {
            self.inner.upsert_agent(id, updater).await
        }

        async fn update_agent(&self, id: &AgentId, updater: AgentUpdater<'_>) -> Result<Agent> {
            self.inner.update_agent(id, updater).await
        }

        async fn delete_agents(&self, ids: &[AgentId]) -> Result<Vec<Agent>> {
            self.inner.delete_agents(ids).await
        }

        async fn configuration(&self, name: &str) -> Result<Option<Configuration>> {
            self.inner.configuration(name).await
        }

        async fn configurations(&self) -> Result<Vec<Configuration>> {
            self.inner.configurations().await
        }

        async fn apply_configuration(
            &self,
            name: &str,
            selector: Selector,
            content: &str,
            options: RolloutOptions,
        ) -> Result<Configuration> {
            self.inner.apply_configuration(name, selector, content, options).await
        }

        async fn update_rollout(&self, name: &str, updater: RolloutUpdater<'_>) -> Result<Configuration> {
            self.inner.update_rollout(name, updater).await
        }

        async fn update_all_rollouts(&self) -> Result<usize> {
            if self.ticks.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(CoreError::internal("store unavailable"));
            }
            self.inner.update_all_rollouts().await
        }

        fn updates(&self) -> Source<StoreUpdates> {
            self.inner.updates()
        }
    }

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(
            NodeId::new("test"),
            &BroadcastConfig::default(),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_stop_before_start_is_error() {
        let scheduler = RolloutScheduler::new(store(), Duration::from_secs(1));
        assert_eq!(
            scheduler.stop(Duration::from_secs(1)).await,
            Err(SchedulerError::NotStarted)
        );
    }

    #[tokio::test]
    async fn test_start_twice_is_error() {
        let scheduler = RolloutScheduler::new(store(), Duration::from_secs(1));
        let token = CancellationToken::new();
        scheduler.start(&token).await.unwrap();
        assert_eq!(scheduler.start(&token).await, Err(SchedulerError::AlreadyStarted));
        assert!(scheduler.is_running().await);

        scheduler.stop(Duration::from_secs(1)).await.unwrap();
        assert!(!scheduler.is_running().await);
        // 停止后可以再次启动
        scheduler.start(&token).await.unwrap();
        scheduler.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_advances_rollouts() {
        let store = store();
        for i in 0..5 {
            store
                .upsert_agent(&AgentId::new(format!("a{}", i)), &|_: &mut Agent| {})
                .await
                .unwrap();
        }
        let options = RolloutOptions {
            start_automatically: true,
            phase_agent_count: PhaseAgentCount {
                initial: 2,
                multiplier: 2.0,
                maximum: 10,
            },
            ..Default::default()
        };
        store
            .apply_configuration("otel", Selector::everything(), "a", options)
            .await
            .unwrap();

        let scheduler = RolloutScheduler::new(store.clone(), Duration::from_secs(1));
        scheduler.start(&CancellationToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let pending = store
            .agents()
            .await
            .unwrap()
            .iter()
            .filter(|agent| agent.pending_configuration() == Some("otel:1"))
            .count();
        // 上一阶段未完成前不会继续推进
        assert_eq!(pending, 2);

        scheduler.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_errors_do_not_stop_loop() {
        let inner = store();
        inner
            .upsert_agent(&AgentId::new("a0"), &|_: &mut Agent| {})
            .await
            .unwrap();
        inner
            .apply_configuration("otel", Selector::everything(), "a", RolloutOptions {
                start_automatically: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let failing = Arc::new(FailingStore {
            inner: inner.clone(),
            failures: 3,
            ticks: AtomicUsize::new(0),
        });

        let scheduler = RolloutScheduler::new(failing.clone(), Duration::from_secs(1));
        scheduler.start(&CancellationToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(failing.ticks.load(Ordering::SeqCst), 3);
        assert!(scheduler.is_running().await);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(failing.ticks.load(Ordering::SeqCst) >= 5);
        assert!(scheduler.is_running().await);
        let agent = inner.agent(&AgentId::new("a0")).await.unwrap().unwrap();
        assert_eq!(agent.pending_configuration(), Some("otel:1"));

        scheduler.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_parent_cancel_stops_loop() {
        let scheduler = RolloutScheduler::new(store(), Duration::from_millis(100));
        let parent = CancellationToken::new();
        scheduler.start(&parent).await.unwrap();
        parent.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!scheduler.is_running().await);
        // 句柄仍需回收
        scheduler.stop(Duration::from_secs(1)).await.unwrap();
    }
}
