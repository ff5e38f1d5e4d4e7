//! tracing 初始化

use time::UtcOffset;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogConfig {
    /// 级别（info|debug|...）或完整的 EnvFilter 指令，如 `armada_server=debug,info`
    pub level: String,
    pub format: String, // text|json
    pub no_ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            no_ansi: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogConfig {
    pub fn log_format(&self) -> LogFormat {
        if self.format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }

    /// 生成过滤指令；单个未知级别回退为 info
    pub fn filter_directive(&self) -> String {
        let level = self.level.trim().to_lowercase();
        if level.contains('=') || level.contains(',') {
            return level;
        }
        match level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" | "off" => level,
            _ => "info".to_string(),
        }
    }
}

/// 使用提供的配置初始化 tracing；`RUST_LOG` 优先于配置文件中的级别。重复调用无副作用
pub fn init_tracing_with(cfg: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.filter_directive()));
    let base = fmt::layer().with_target(true).with_ansi(!cfg.no_ansi);
    let fmt_layer = match cfg.log_format() {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Text => {
            let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
            base.with_timer(fmt::time::OffsetTime::new(
                offset,
                time::format_description::well_known::Rfc3339,
            ))
            .boxed()
        }
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(level: &str, format: &str) -> LogConfig {
        LogConfig {
            level: level.to_string(),
            format: format.to_string(),
            no_ansi: true,
        }
    }

    #[test]
    fn test_filter_directive() {
        assert_eq!(cfg("DEBUG", "text").filter_directive(), "debug");
        assert_eq!(cfg("verbose", "text").filter_directive(), "info");
        assert_eq!(
            cfg("armada_server=debug,info", "text").filter_directive(),
            "armada_server=debug,info"
        );
    }

    #[test]
    fn test_log_format() {
        assert_eq!(cfg("info", "JSON").log_format(), LogFormat::Json);
        assert_eq!(cfg("info", "pretty").log_format(), LogFormat::Text);
    }

    #[test]
    fn test_init_is_idempotent() {
        init_tracing_with(&cfg("info", "text"));
        init_tracing_with(&cfg("debug", "json"));
    }
}
