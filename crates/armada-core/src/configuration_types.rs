//! 配置版本类型

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::rollout_types::{Rollout, RolloutOptions};
use crate::selector::{Labels, Selector};

/// 一个配置的某个版本，以及随之发布的灰度状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub name: String,
    pub version: u32,
    pub selector: Selector,
    pub content: String,
    pub rollout: Rollout,
    /// 乐观并发版本号，由 Store 维护
    #[serde(default)]
    pub revision: u64,
}

impl Configuration {
    pub fn new(
        name: impl Into<String>,
        selector: Selector,
        content: impl Into<String>,
        options: RolloutOptions,
    ) -> Self {
        Self {
            name: name.into(),
            version: 1,
            selector,
            content: content.into(),
            rollout: Rollout::new(options),
            revision: 0,
        }
    }

    /// Agent 配置槽中保存的标识：`name:version`
    pub fn name_and_version(&self) -> String {
        format_name_and_version(&self.name, self.version)
    }

    /// 基于当前版本生成下一个版本，发布状态重新开始
    pub fn new_version(
        &self,
        selector: Selector,
        content: impl Into<String>,
        options: RolloutOptions,
    ) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version + 1,
            selector,
            content: content.into(),
            rollout: Rollout::new(options),
            revision: 0,
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.selector.matches(labels)
    }
}

pub fn format_name_and_version(name: &str, version: u32) -> String {
    format!("{}:{}", name, version)
}

/// 解析 `name:version`；名称本身允许包含冒号
pub fn parse_name_and_version(value: &str) -> Result<(String, u32)> {
    let (name, version) = value.rsplit_once(':').ok_or_else(|| CoreError::Config {
        message: format!("Invalid configuration reference '{}'", value),
    })?;
    let version = version.parse::<u32>().map_err(|_| CoreError::Config {
        message: format!("Invalid configuration version in '{}'", value),
    })?;
    if name.is_empty() {
        return Err(CoreError::Config {
            message: format!("Empty configuration name in '{}'", value),
        });
    }
    Ok((name.to_string(), version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout_types::RolloutStatus;

    #[test]
    fn test_name_and_version() {
        let cfg = Configuration::new("otel", Selector::everything(), "receivers: {}", RolloutOptions::default());
        assert_eq!(cfg.name_and_version(), "otel:1");

        let next = cfg.new_version(Selector::everything(), "receivers: []", RolloutOptions::default());
        assert_eq!(next.name_and_version(), "otel:2");
        assert_eq!(next.rollout.status, RolloutStatus::Pending);
        assert_eq!(next.rollout.phase, 0);
    }

    #[test]
    fn test_parse_name_and_version() {
        assert_eq!(parse_name_and_version("otel:3").unwrap(), ("otel".to_string(), 3));
        assert_eq!(
            parse_name_and_version("ns:otel:12").unwrap(),
            ("ns:otel".to_string(), 12)
        );
        assert!(parse_name_and_version("otel").is_err());
        assert!(parse_name_and_version("otel:x").is_err());
        assert!(parse_name_and_version(":1").is_err());
    }
}
