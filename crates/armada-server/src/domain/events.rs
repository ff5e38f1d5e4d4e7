//! Store 变更事件

use serde::{Deserialize, Serialize};

use armada_core::agent_types::Agent;
use armada_core::configuration_types::Configuration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Remove,
}

impl ChangeKind {
    /// 同一实体的两次变更合并后的类型
    fn then(self, next: ChangeKind) -> ChangeKind {
        match (self, next) {
            (_, ChangeKind::Remove) => ChangeKind::Remove,
            (ChangeKind::Insert, _) => ChangeKind::Insert,
            (_, next) => next,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentChange {
    pub kind: ChangeKind,
    pub agent: Agent,
    /// 变更前的 pending 配置
    pub previous_pending: Option<String>,
}

impl AgentChange {
    /// 本次变更新分配的 pending 配置
    pub fn pending_assigned(&self) -> Option<&str> {
        if self.kind == ChangeKind::Remove {
            return None;
        }
        let pending = self.agent.pending_configuration()?;
        (self.previous_pending.as_deref() != Some(pending)).then_some(pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationChange {
    pub kind: ChangeKind,
    pub configuration: Configuration,
}

/// 一批 Store 变更，经合并窗口聚合后推送给订阅者
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreUpdates {
    pub agents: Vec<AgentChange>,
    pub configurations: Vec<ConfigurationChange>,
}

impl StoreUpdates {
    pub fn agent(kind: ChangeKind, agent: Agent, previous_pending: Option<String>) -> Self {
        Self {
            agents: vec![AgentChange {
                kind,
                agent,
                previous_pending,
            }],
            configurations: Vec::new(),
        }
    }

    pub fn configuration(kind: ChangeKind, configuration: Configuration) -> Self {
        Self {
            agents: Vec::new(),
            configurations: vec![ConfigurationChange {
                kind,
                configuration,
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.configurations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.agents.len() + self.configurations.len()
    }

    /// 并入另一批变更：同一实体（配置按名称和版本区分）只保留最新状态，保留最早的 previous_pending
    pub fn merge(&mut self, other: &StoreUpdates) -> bool {
        for change in &other.agents {
            match self.agents.iter_mut().find(|c| c.agent.id == change.agent.id) {
                Some(existing) => {
                    existing.kind = existing.kind.then(change.kind);
                    existing.agent = change.agent.clone();
                }
                None => self.agents.push(change.clone()),
            }
        }
        for change in &other.configurations {
            match self
                .configurations
                .iter_mut()
                .find(|c| {
                    c.configuration.name == change.configuration.name
                        && c.configuration.version == change.configuration.version
                })
            {
                Some(existing) => {
                    existing.kind = existing.kind.then(change.kind);
                    existing.configuration = change.configuration.clone();
                }
                None => self.configurations.push(change.clone()),
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_core::core_types::AgentId;

    fn agent(id: &str, pending: Option<&str>) -> Agent {
        let mut agent = Agent::new(AgentId::new(id));
        agent.set_pending_configuration(pending);
        agent
    }

    #[test]
    fn test_pending_assigned() {
        let change = AgentChange {
            kind: ChangeKind::Update,
            agent: agent("a1", Some("otel:2")),
            previous_pending: None,
        };
        assert_eq!(change.pending_assigned(), Some("otel:2"));

        let unchanged = AgentChange {
            previous_pending: Some("otel:2".into()),
            ..change.clone()
        };
        assert_eq!(unchanged.pending_assigned(), None);

        let removed = AgentChange {
            kind: ChangeKind::Remove,
            ..change
        };
        assert_eq!(removed.pending_assigned(), None);
    }

    #[test]
    fn test_merge_keeps_latest_state_per_entity() {
        let mut batch = StoreUpdates::agent(ChangeKind::Insert, agent("a1", None), None);
        batch.merge(&StoreUpdates::agent(ChangeKind::Update, agent("a2", None), None));
        batch.merge(&StoreUpdates::agent(
            ChangeKind::Update,
            agent("a1", Some("otel:1")),
            None,
        ));

        assert_eq!(batch.agents.len(), 2);
        let a1 = &batch.agents[0];
        assert_eq!(a1.kind, ChangeKind::Insert);
        assert_eq!(a1.pending_assigned(), Some("otel:1"));

        batch.merge(&StoreUpdates::agent(ChangeKind::Remove, agent("a2", None), None));
        assert_eq!(batch.agents[1].kind, ChangeKind::Remove);
        assert_eq!(batch.len(), 2);
    }
}
