//! Armada 统一配置
//!
//! 加载顺序：默认值 → `armada.toml` → `ARMADA__` 前缀环境变量（以 `__` 分隔层级）。

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::constants::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_MERGE_MAX_EVENTS, DEFAULT_MERGE_MAX_LATENCY_MS,
    DEFAULT_ROLLOUT_INTERVAL_MS,
};
use crate::core_types::NodeId;
use crate::telemetry::LogConfig;

pub const DEFAULT_CONFIG_FILE: &str = "armada.toml";
pub const ENV_PREFIX: &str = "ARMADA__";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ArmadaConfig {
    /// 集群节点标识，作为广播消息的 `_origin`；为空时启动时生成
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for ArmadaConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            telemetry: TelemetryConfig::default(),
            broadcast: BroadcastConfig::default(),
            nats: NatsConfig::default(),
            scheduler: SchedulerConfig::default(),
            cleanup: CleanupConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl ArmadaConfig {
    /// 从指定路径或当前目录中的 armada.toml 加载配置
    pub fn load_config(path: Option<&str>) -> Result<Self, anyhow::Error> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(ArmadaConfig::default()));

        match path {
            Some(p) => {
                let p = Path::new(p);
                if !p.exists() {
                    return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
                }
                figment = figment.merge(Toml::file(p));
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    figment = figment.merge(Toml::file(default_path));
                }
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let cfg: ArmadaConfig = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load config via Figment: {}", e))?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !matches!(self.telemetry.log_format.as_str(), "text" | "json") {
            return Err(anyhow::anyhow!(
                "telemetry.log_format must be 'text' or 'json', got '{}'",
                self.telemetry.log_format
            ));
        }
        if self.broadcast.channel_capacity == 0 {
            return Err(anyhow::anyhow!("broadcast.channel_capacity must be greater than 0"));
        }
        if self.broadcast.merge_max_events == 0 {
            return Err(anyhow::anyhow!("broadcast.merge_max_events must be greater than 0"));
        }
        if self.broadcast.transport == BroadcastTransport::Nats && self.nats.url.is_empty() {
            return Err(anyhow::anyhow!("nats.url is required when broadcast.transport = 'nats'"));
        }
        if self.nats.subject_prefix.is_empty() {
            return Err(anyhow::anyhow!("nats.subject_prefix must not be empty"));
        }
        if self.scheduler.rollout_interval_ms < 100 {
            return Err(anyhow::anyhow!("scheduler.rollout_interval_ms must be at least 100"));
        }
        if self.cleanup.interval_sec == 0 {
            return Err(anyhow::anyhow!("cleanup.interval_sec must be greater than 0"));
        }
        Ok(())
    }

    /// 配置的节点标识；未配置时生成一个新的
    pub fn node_id(&self) -> NodeId {
        if self.node_id.is_empty() {
            NodeId::generate()
        } else {
            NodeId::new(self.node_id.clone())
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.telemetry.log_level.clone(),
            format: self.telemetry.log_format.clone(),
            no_ansi: self.telemetry.log_no_ansi,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub log_no_ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            log_no_ansi: false,
        }
    }
}

/// 广播传输方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastTransport {
    #[default]
    Local,
    Nats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BroadcastConfig {
    #[serde(default)]
    pub transport: BroadcastTransport,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_merge_max_latency_ms")]
    pub merge_max_latency_ms: u64,
    #[serde(default = "default_merge_max_events")]
    pub merge_max_events: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            transport: BroadcastTransport::default(),
            channel_capacity: default_channel_capacity(),
            merge_max_latency_ms: default_merge_max_latency_ms(),
            merge_max_events: default_merge_max_events(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NatsConfig {
    #[serde(default = "default_nats_url")]
    pub url: String,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            subject_prefix: default_subject_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_rollout_interval_ms")]
    pub rollout_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rollout_interval_ms: default_rollout_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_interval")]
    pub interval_sec: u64,
    /// 断开超过该时长的 Agent 将被删除；0 表示不清理
    #[serde(default = "default_disconnected_ttl")]
    pub disconnected_ttl_sec: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_sec: default_cleanup_interval(),
            disconnected_ttl_sec: default_disconnected_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_sec: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_sec: default_shutdown_timeout(),
        }
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_merge_max_latency_ms() -> u64 {
    DEFAULT_MERGE_MAX_LATENCY_MS
}

fn default_merge_max_events() -> usize {
    DEFAULT_MERGE_MAX_EVENTS
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_subject_prefix() -> String {
    crate::constants::BROADCAST_SUBJECT_PREFIX.to_string()
}

fn default_rollout_interval_ms() -> u64 {
    DEFAULT_ROLLOUT_INTERVAL_MS
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_disconnected_ttl() -> u64 {
    0
}

fn default_shutdown_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = ArmadaConfig::default();
        assert!(cfg.node_id.is_empty());
        assert_eq!(cfg.broadcast.transport, BroadcastTransport::Local);
        assert_eq!(cfg.scheduler.rollout_interval_ms, 10_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_from_file_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "armada.toml",
                r#"
                node_id = "node-a"

                [broadcast]
                transport = "nats"
                merge_max_events = 10

                [scheduler]
                rollout_interval_ms = 500
                "#,
            )?;
            jail.set_env("ARMADA__CLEANUP__DISCONNECTED_TTL_SEC", "120");
            jail.set_env("ARMADA__TELEMETRY__LOG_FORMAT", "json");

            let cfg = ArmadaConfig::load_config(None).expect("config loads");
            assert_eq!(cfg.node_id().as_str(), "node-a");
            assert_eq!(cfg.broadcast.transport, BroadcastTransport::Nats);
            assert_eq!(cfg.broadcast.merge_max_events, 10);
            assert_eq!(cfg.broadcast.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
            assert_eq!(cfg.scheduler.rollout_interval_ms, 500);
            assert_eq!(cfg.cleanup.disconnected_ttl_sec, 120);
            assert_eq!(cfg.telemetry.log_format, "json");
            Ok(())
        });
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("armada.toml", "listen_addr = \"0.0.0.0:1\"")?;
            assert!(ArmadaConfig::load_config(None).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_explicit_path_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[server]\nshutdown_timeout_sec = 5\n").unwrap();

        let cfg = ArmadaConfig::load_config(path.to_str()).unwrap();
        assert_eq!(cfg.server.shutdown_timeout_sec, 5);
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        assert!(ArmadaConfig::load_config(Some("/nonexistent/armada.toml")).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = ArmadaConfig::default();
        cfg.broadcast.channel_capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ArmadaConfig::default();
        cfg.telemetry.log_format = "xml".into();
        assert!(cfg.validate().is_err());

        let mut cfg = ArmadaConfig::default();
        cfg.scheduler.rollout_interval_ms = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_generated_node_id_when_empty() {
        let cfg = ArmadaConfig::default();
        assert_ne!(cfg.node_id(), cfg.node_id());
    }
}
