//! 标签选择器 - 基于 `key=value` 等值条件的 Agent 选择

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CoreError, Result};

/// Agent 标签集合
pub type Labels = BTreeMap<String, String>;

/// 标签选择器，所有条件为 AND 关系；空选择器匹配全部 Agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    conditions: Labels,
}

impl Selector {
    /// 匹配全部 Agent 的选择器
    pub fn everything() -> Self {
        Self::default()
    }

    /// 解析 `env=prod,region=us-east-1` 形式的表达式
    pub fn parse(expression: &str) -> Result<Self> {
        let mut conditions = Labels::new();
        for part in expression.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| CoreError::Config {
                message: format!("Invalid selector condition '{}': expected key=value", part),
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(CoreError::Config {
                    message: format!("Invalid selector condition '{}': empty key", part),
                });
            }
            conditions.insert(key.to_string(), value.trim().to_string());
        }
        Ok(Self { conditions })
    }

    pub fn from_labels(labels: Labels) -> Self {
        Self { conditions: labels }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// 所有条件都命中时返回 true
    pub fn matches(&self, labels: &Labels) -> bool {
        self.conditions
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .conditions
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

/// 便捷的选择器构建器
#[derive(Debug, Default)]
pub struct SelectorBuilder {
    conditions: Labels,
}

impl SelectorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 标签匹配
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Selector {
        Selector::from_labels(self.conditions)
    }
}
