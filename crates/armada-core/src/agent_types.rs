//! armada-core/src/agent_types.rs - Agent 状态机及相关类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use crate::core_types::AgentId;
use crate::error::CoreError;
use crate::selector::Labels;

/// 强类型的 Agent 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Disconnected,
    Connected,
    Error,
    /// 已废弃，仅为兼容旧数据保留
    ComponentFailed,
    /// 删除通知发出前的瞬态
    Deleted,
    Configuring,
    Upgrading,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::ComponentFailed => "component_failed",
            Self::Deleted => "deleted",
            Self::Configuring => "configuring",
            Self::Upgrading => "upgrading",
        }
    }

    /// 线上兼容的数值编码（3 未使用）
    pub fn code(&self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connected => 1,
            Self::Error => 2,
            Self::ComponentFailed => 4,
            Self::Deleted => 5,
            Self::Configuring => 6,
            Self::Upgrading => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Disconnected),
            1 => Some(Self::Connected),
            2 => Some(Self::Error),
            4 => Some(Self::ComponentFailed),
            5 => Some(Self::Deleted),
            6 => Some(Self::Configuring),
            7 => Some(Self::Upgrading),
            _ => None,
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "Disconnected",
            Self::Connected => "Connected",
            Self::Error => "Error",
            Self::ComponentFailed => "Component Failed",
            Self::Deleted => "Deleted",
            Self::Configuring => "Configuring",
            Self::Upgrading => "Upgrading",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(' ', "_").as_str() {
            "disconnected" => Ok(Self::Disconnected),
            "connected" => Ok(Self::Connected),
            "error" => Ok(Self::Error),
            "component_failed" => Ok(Self::ComponentFailed),
            "deleted" => Ok(Self::Deleted),
            "configuring" => Ok(Self::Configuring),
            "upgrading" => Ok(Self::Upgrading),
            other => Err(CoreError::Serialization {
                message: format!("unknown agent status: {}", other),
            }),
        }
    }
}

/// 升级子状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStatus {
    Pending,
    Started,
    Failed,
}

/// 进行中或最近失败的升级
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUpgrade {
    pub status: UpgradeStatus,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packages_hash: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// 配置三态：current 已确认运行，pending 下发中，future 排队等待灰度
///
/// 每个槽位要么为空，要么是 `name:version` 形式的标记。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationStatus {
    pub current: Option<String>,
    pub pending: Option<String>,
    pub future: Option<String>,
}

impl ConfigurationStatus {
    fn clear(&mut self) {
        self.current = None;
        self.pending = None;
        self.future = None;
    }
}

/// 基于语义化版本计算的能力位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AgentFeatures(u32);

impl AgentFeatures {
    pub const NONE: Self = Self(0);
    pub const LOG_BASED_METRICS: Self = Self(1 << 0);
    pub const MEASUREMENTS_THROUGHPUT: Self = Self(1 << 1);
    pub const SNAPSHOTS: Self = Self(1 << 2);
    pub const UPGRADE: Self = Self(1 << 3);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// 按版本阈值从新到旧匹配，高阈值包含所有低阈值的能力
    pub fn for_version(version: &str) -> Self {
        let Ok(parsed) = semver::Version::parse(version.trim_start_matches('v')) else {
            return Self::NONE;
        };
        let thresholds = [
            (
                semver::Version::new(1, 14, 0),
                Self::UPGRADE | Self::SNAPSHOTS | Self::MEASUREMENTS_THROUGHPUT | Self::LOG_BASED_METRICS,
            ),
            (
                semver::Version::new(1, 9, 2),
                Self::SNAPSHOTS | Self::MEASUREMENTS_THROUGHPUT | Self::LOG_BASED_METRICS,
            ),
            (
                semver::Version::new(1, 8, 0),
                Self::MEASUREMENTS_THROUGHPUT | Self::LOG_BASED_METRICS,
            ),
            (semver::Version::new(1, 6, 0), Self::LOG_BASED_METRICS),
        ];
        thresholds
            .into_iter()
            .find(|(min, _)| parsed >= *min)
            .map(|(_, features)| features)
            .unwrap_or(Self::NONE)
    }
}

impl BitOr for AgentFeatures {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Agent 聚合根 - 由 Store 持有，状态机方法只修改值本身
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub labels: Labels,
    pub status: AgentStatus,
    #[serde(default)]
    pub error_message: String,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub reported_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub configuration_status: ConfigurationStatus,
    #[serde(default)]
    pub upgrade: Option<AgentUpgrade>,
    /// 乐观锁版本号
    #[serde(default)]
    pub revision: u64,
}

impl Agent {
    pub fn new(id: AgentId) -> Self {
        Self {
            id,
            name: String::new(),
            version: String::new(),
            labels: Labels::new(),
            status: AgentStatus::Disconnected,
            error_message: String::new(),
            connected_at: None,
            disconnected_at: None,
            reported_at: None,
            configuration_status: ConfigurationStatus::default(),
            upgrade: None,
            revision: 0,
        }
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected_at.is_some()
    }

    pub fn features(&self) -> AgentFeatures {
        AgentFeatures::for_version(&self.version)
    }

    pub fn supports(&self, feature: AgentFeatures) -> bool {
        self.features().contains(feature)
    }

    pub fn supports_upgrade(&self) -> bool {
        self.supports(AgentFeatures::UPGRADE)
    }

    // === 连接状态 ===

    /// 记录一次上报；版本变化或首次连接时刷新 connected_at。不修改 status。
    pub fn connect(&mut self, new_version: &str) {
        let now = Utc::now();
        self.reported_at = Some(now);
        if self.version != new_version || self.connected_at.is_none() {
            self.connected_at = Some(now);
        }
        self.version = new_version.to_string();
        self.disconnected_at = None;
    }

    /// 断开连接，已断开时为空操作
    pub fn disconnect(&mut self) {
        if self.status == AgentStatus::Disconnected {
            return;
        }
        self.disconnected_at = Some(Utc::now());
        self.status = AgentStatus::Disconnected;
        self.connected_at = None;
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error_message = message.into();
        self.status = AgentStatus::Error;
    }

    // === 升级子状态 ===

    /// 不支持升级的 Agent 上为空操作
    pub fn upgrade_to(&mut self, version: &str) {
        if !self.supports_upgrade() {
            return;
        }
        self.upgrade = Some(AgentUpgrade {
            status: UpgradeStatus::Pending,
            version: version.to_string(),
            packages_hash: None,
            error: String::new(),
        });
        self.status = AgentStatus::Upgrading;
    }

    pub fn upgrade_started(&mut self, version: &str, packages_hash: impl Into<String>) {
        self.upgrade = Some(AgentUpgrade {
            status: UpgradeStatus::Started,
            version: version.to_string(),
            packages_hash: Some(packages_hash.into()),
            error: String::new(),
        });
        self.status = AgentStatus::Upgrading;
    }

    pub fn upgrade_complete(&mut self, version: &str, error_message: &str) {
        if error_message.is_empty() {
            self.upgrade = None;
        } else {
            let upgrade = self.upgrade.get_or_insert_with(|| AgentUpgrade {
                status: UpgradeStatus::Failed,
                version: version.to_string(),
                packages_hash: None,
                error: String::new(),
            });
            if upgrade.version.is_empty() {
                upgrade.version = version.to_string();
            }
            upgrade.status = UpgradeStatus::Failed;
            upgrade.error = error_message.to_string();
        }

        if self.status != AgentStatus::Configuring {
            self.status = if self.error_message.is_empty() {
                AgentStatus::Connected
            } else {
                AgentStatus::Error
            };
        }
    }

    // === 配置三态 ===

    pub fn current_configuration(&self) -> Option<&str> {
        self.configuration_status.current.as_deref()
    }

    pub fn pending_configuration(&self) -> Option<&str> {
        self.configuration_status.pending.as_deref()
    }

    pub fn future_configuration(&self) -> Option<&str> {
        self.configuration_status.future.as_deref()
    }

    /// `None` 清空全部三个槽位
    pub fn set_current_configuration(&mut self, name_and_version: Option<&str>) {
        let Some(nv) = name_and_version else {
            self.configuration_status.clear();
            return;
        };
        let cs = &mut self.configuration_status;
        cs.current = Some(nv.to_string());
        if cs.pending.as_deref() == Some(nv) {
            cs.pending = None;
        }
        if cs.future.as_deref() == Some(nv) {
            cs.future = None;
        }
    }

    /// Agent 成功应用了配置：记为 current 并退出 Error/Configuring
    pub fn configuration_applied(&mut self, name_and_version: &str) {
        self.set_current_configuration(Some(name_and_version));
        self.error_message.clear();
        if matches!(self.status, AgentStatus::Error | AgentStatus::Configuring) {
            self.status = AgentStatus::Connected;
        }
    }

    pub fn set_pending_configuration(&mut self, name_and_version: Option<&str>) {
        let Some(nv) = name_and_version else {
            self.configuration_status.clear();
            return;
        };
        let cs = &mut self.configuration_status;
        if cs.current.as_deref() == Some(nv) {
            cs.pending = None;
            cs.future = None;
            return;
        }
        if cs.future.as_deref() == Some(nv) {
            cs.future = None;
        }
        cs.pending = Some(nv.to_string());
        if self.status == AgentStatus::Error {
            self.status = AgentStatus::Configuring;
        }
    }

    pub fn set_future_configuration(&mut self, name_and_version: Option<&str>) {
        let Some(nv) = name_and_version else {
            self.configuration_status.clear();
            return;
        };
        let cs = &mut self.configuration_status;
        if cs.current.as_deref() == Some(nv) {
            cs.pending = None;
            cs.future = None;
            return;
        }
        if cs.pending.as_deref() == Some(nv) {
            cs.future = None;
            return;
        }
        cs.pending = None;
        cs.future = Some(nv.to_string());
    }
}
