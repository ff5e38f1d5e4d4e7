use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use armada_core::agent_types::{Agent, AgentStatus};
use armada_core::core_types::AgentId;
use armada_core::error::Result;

use crate::application::ports::Store;

/// 断线清理监控器
/// 定期删除断开时间超过 TTL 的 Agent
pub struct CleanupMonitor {
    store: Arc<dyn Store>,
    interval: Duration,
    disconnected_ttl: Duration,
    shutdown_token: CancellationToken,
}

impl CleanupMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        interval: Duration,
        disconnected_ttl: Duration,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            interval,
            disconnected_ttl,
            shutdown_token,
        }
    }

    /// 以后台任务方式启动，返回 JoinHandle，便于生命周期管理注册
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_sec = self.interval.as_secs(),
                ttl_sec = self.disconnected_ttl.as_secs(),
                "Starting CleanupMonitor"
            );
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = self.shutdown_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.scan(Utc::now()).await {
                            error!(error = %e, "Disconnected agent cleanup failed");
                        }
                    }
                }
            }
            info!("CleanupMonitor stopped");
        })
    }

    /// 删除在 `now` 时已超时的断线 Agent，返回删除数量
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<AgentId> = self
            .store
            .agents()
            .await?
            .into_iter()
            .filter(|agent| is_expired(agent, now, self.disconnected_ttl))
            .map(|agent| agent.id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let deleted = self.store.delete_agents(&expired).await?;
        for agent in &deleted {
            debug!(agent_id = %agent.id, "Removed disconnected agent");
        }
        info!(count = deleted.len(), "Cleaned up disconnected agents");
        Ok(deleted.len())
    }
}

fn is_expired(agent: &Agent, now: DateTime<Utc>, ttl: Duration) -> bool {
    if agent.status != AgentStatus::Disconnected {
        return false;
    }
    let Some(disconnected_at) = agent.disconnected_at else {
        return false;
    };
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        return false;
    };
    now - disconnected_at > ttl
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_core::config::BroadcastConfig;
    use armada_core::core_types::NodeId;

    use crate::infrastructure::persistence::MemoryStore;

    #[tokio::test]
    async fn test_scan_removes_only_expired_agents() {
        let store = Arc::new(MemoryStore::new(
            NodeId::new("test"),
            &BroadcastConfig::default(),
            CancellationToken::new(),
        ));
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        store
            .upsert_agent(&AgentId::new("stale"), &|agent: &mut Agent| {
                agent.disconnected_at = Some(long_ago);
            })
            .await
            .unwrap();
        store
            .upsert_agent(&AgentId::new("recent"), &|agent: &mut Agent| {
                agent.disconnected_at = Some(Utc::now());
            })
            .await
            .unwrap();
        store
            .upsert_agent(&AgentId::new("online"), &|agent: &mut Agent| {
                agent.connect("v1.0.0");
                agent.status = AgentStatus::Connected;
            })
            .await
            .unwrap();

        let monitor = CleanupMonitor::new(
            store.clone(),
            Duration::from_secs(60),
            Duration::from_secs(3600),
            CancellationToken::new(),
        );
        assert_eq!(monitor.scan(Utc::now()).await.unwrap(), 1);

        let remaining: Vec<String> = store
            .agents()
            .await
            .unwrap()
            .into_iter()
            .map(|agent| agent.id.to_string())
            .collect();
        assert_eq!(remaining, vec!["online".to_string(), "recent".to_string()]);
        assert_eq!(monitor.scan(Utc::now()).await.unwrap(), 0);
    }

    #[test]
    fn test_never_disconnected_agent_is_kept() {
        let agent = Agent::new(AgentId::new("a1"));
        assert!(!is_expired(&agent, Utc::now(), Duration::ZERO));
    }
}
