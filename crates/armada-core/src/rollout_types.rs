//! 灰度发布相关类型定义
//!
//! `Rollout` 是一个纯值对象：调度器每个周期把 Store 统计出的进度交给
//! [`Rollout::update_status`]，由它决定本阶段需要新增多少个 pending Agent。

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// 灰度发布状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    #[default]
    Pending, // 已创建，等待启动
    Started,  // 执行中
    Paused,   // 已暂停
    Error,    // 错误数超限
    Stable,   // 已完成（仍会为新匹配的 Agent 下发）
    Replaced, // 被新版本取代
}

impl RolloutStatus {
    /// 检查是否为终端状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Stable | Self::Replaced)
    }

    /// 调度器是否需要为其重新计算进度
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Started | Self::Stable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Stable => "stable",
            Self::Replaced => "replaced",
        }
    }
}

/// 每阶段 Agent 数量：`min(initial × multiplier^phase, maximum)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseAgentCount {
    pub initial: u32,
    pub multiplier: f64,
    pub maximum: u32,
}

impl Default for PhaseAgentCount {
    fn default() -> Self {
        Self {
            initial: 3,
            multiplier: 5.0,
            maximum: 100,
        }
    }
}

/// 灰度发布选项，发布开始后按值固化在 `Rollout` 中
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RolloutOptions {
    #[serde(default)]
    pub start_automatically: bool,
    #[serde(default)]
    pub rollback_on_failure: bool,
    #[serde(default)]
    pub max_errors: u32,
    #[serde(default)]
    pub phase_agent_count: PhaseAgentCount,
}

impl RolloutOptions {
    pub fn validate(&self) -> Result<()> {
        let phase = &self.phase_agent_count;
        if phase.initial == 0 {
            return Err(CoreError::config_error("phase_agent_count.initial must be at least 1"));
        }
        if !phase.multiplier.is_finite() || phase.multiplier < 1.0 {
            return Err(CoreError::config_error(
                "phase_agent_count.multiplier must be a finite number >= 1",
            ));
        }
        if phase.maximum < phase.initial {
            return Err(CoreError::config_error(
                "phase_agent_count.maximum must not be less than initial",
            ));
        }
        Ok(())
    }
}

/// 发布进度：四个计数划分了选择器命中的全部 Agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RolloutProgress {
    pub completed: u32,
    pub errors: u32,
    pub pending: u32,
    pub waiting: u32,
}

impl RolloutProgress {
    pub fn total(&self) -> u32 {
        self.completed + self.errors + self.pending + self.waiting
    }
}

/// 灰度发布聚合（随配置版本一起持久化）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Rollout {
    pub status: RolloutStatus,
    pub options: RolloutOptions,
    pub phase: u32,
    pub progress: RolloutProgress,
}

impl Rollout {
    pub fn new(options: RolloutOptions) -> Self {
        let status = if options.start_automatically {
            RolloutStatus::Started
        } else {
            RolloutStatus::Pending
        };
        Self {
            status,
            options,
            phase: 0,
            progress: RolloutProgress::default(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 尚未结束（可被新版本取代）
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    pub fn start(&mut self) -> Result<()> {
        match self.status {
            RolloutStatus::Pending => {
                self.status = RolloutStatus::Started;
                Ok(())
            }
            other => Err(CoreError::invalid_rollout(format!(
                "cannot start rollout in {} state",
                other.as_str()
            ))),
        }
    }

    pub fn pause(&mut self) -> Result<()> {
        match self.status {
            RolloutStatus::Pending | RolloutStatus::Started => {
                self.status = RolloutStatus::Paused;
                Ok(())
            }
            other => Err(CoreError::invalid_rollout(format!(
                "cannot pause rollout in {} state",
                other.as_str()
            ))),
        }
    }

    pub fn resume(&mut self) -> Result<()> {
        match self.status {
            RolloutStatus::Paused => {
                self.status = RolloutStatus::Started;
                Ok(())
            }
            other => Err(CoreError::invalid_rollout(format!(
                "cannot resume rollout in {} state",
                other.as_str()
            ))),
        }
    }

    /// 被新版本取代；终端状态保持不变
    pub fn replace(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = RolloutStatus::Replaced;
        true
    }

    /// 当前阶段应下发的 Agent 数，指数增长并封顶
    pub fn agents_per_phase(&self) -> u32 {
        let count = &self.options.phase_agent_count;
        let exponent = i32::try_from(self.phase).unwrap_or(i32::MAX);
        let raw = f64::from(count.initial) * count.multiplier.max(1.0).powi(exponent);
        raw.min(f64::from(count.maximum)) as u32
    }

    /// 仅在 Started/Stable 且无 pending 时推进下一阶段
    pub fn agents_next_phase(&self) -> u32 {
        let ready = matches!(self.status, RolloutStatus::Started | RolloutStatus::Stable)
            && self.progress.pending == 0;
        if ready {
            self.agents_per_phase()
        } else {
            0
        }
    }

    /// 用最新进度刷新状态，返回本周期需要新标记为 pending 的 Agent 数
    pub fn update_status(&mut self, progress: RolloutProgress) -> u32 {
        self.progress = progress;

        if self.progress.errors > self.options.max_errors {
            self.status = RolloutStatus::Error;
        } else if self.status == RolloutStatus::Started
            && self.progress.waiting == 0
            && self.progress.pending == 0
        {
            self.status = RolloutStatus::Stable;
        }

        let candidate = self.agents_next_phase().min(self.progress.waiting);
        if candidate > 0 {
            self.progress.waiting -= candidate;
            self.progress.pending += candidate;
            self.phase += 1;
        }
        candidate
    }
}
