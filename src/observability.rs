//! Shared logging configuration and lifecycle events for the binaries.

use std::env;
use std::net::SocketAddr;
use std::time::Instant;

use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    logging_config_from_lookup(|var| env::var(var).ok())
}

/// `AQ_LOG_LEVEL`, `AQ_LOG_FORMAT` and `AQ_LOG_TARGET` from any lookup.
/// Blank or unparsable values keep the default.
pub fn logging_config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Some(level) = lookup("AQ_LOG_LEVEL")
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
    {
        config.level = level;
    }
    if let Some(format) = lookup("AQ_LOG_FORMAT").and_then(|raw| parse_log_format(&raw)) {
        config.format = format;
    }
    if let Some(include) = lookup("AQ_LOG_TARGET").and_then(|raw| parse_bool(&raw)) {
        config.include_target = include;
    }
    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(component: &'static str, config: &LoggingConfig) {
    info!(
        component,
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_app_bind(bound_addr: SocketAddr) {
    info!(
        component = "dashboard_server",
        event = "app.bind",
        bind_addr = %bound_addr,
        route = "/dashboard"
    );
}

/// Timing handle for one pipeline run; emits `pipeline.<name>.start` now and
/// `.finish` or `.error` when closed.
#[derive(Debug)]
pub struct PipelineRun {
    pipeline: &'static str,
    started: Instant,
}

impl PipelineRun {
    pub fn start(pipeline: &'static str) -> Self {
        info!(
            component = "pipeline",
            event = %format!("pipeline.{pipeline}.start"),
            pipeline
        );
        Self {
            pipeline,
            started: Instant::now(),
        }
    }

    pub fn finish(self, rows: usize) {
        info!(
            component = "pipeline",
            event = %format!("pipeline.{}.finish", self.pipeline),
            pipeline = self.pipeline,
            rows,
            elapsed_ms = self.started.elapsed().as_millis() as u64
        );
    }

    pub fn fail(self, err: &dyn std::error::Error) {
        error!(
            component = "pipeline",
            event = %format!("pipeline.{}.error", self.pipeline),
            pipeline = self.pipeline,
            error = %err,
            elapsed_ms = self.started.elapsed().as_millis() as u64
        );
    }
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(logging_config_from_lookup(lookup(&[])), LoggingConfig::default());
    }

    #[test]
    fn reads_level_format_and_target() {
        let cfg = logging_config_from_lookup(lookup(&[
            ("AQ_LOG_LEVEL", "aq_pred=debug"),
            ("AQ_LOG_FORMAT", " JSON "),
            ("AQ_LOG_TARGET", "off"),
        ]));

        assert_eq!(cfg.level, "aq_pred=debug");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(!cfg.include_target);
    }

    #[test]
    fn unknown_values_keep_defaults() {
        let cfg = logging_config_from_lookup(lookup(&[
            ("AQ_LOG_LEVEL", "   "),
            ("AQ_LOG_FORMAT", "yaml"),
            ("AQ_LOG_TARGET", "sometimes"),
        ]));

        assert_eq!(cfg, LoggingConfig::default());
    }

    #[test]
    fn target_flag_accepts_common_spellings() {
        for (raw, expected) in [("1", true), ("YES", true), ("on", true), ("0", false), ("No", false)] {
            let cfg = logging_config_from_lookup(lookup(&[("AQ_LOG_TARGET", raw)]));
            assert_eq!(cfg.include_target, expected, "{raw}");
        }
    }
}
