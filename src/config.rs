//! Pipeline and dashboard configuration read from `AQ_*` environment
//! variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::source::HttpSourceConfig;

pub const DEFAULT_STORE_PATH: &str = "data/aq_store.sqlite";
pub const DEFAULT_REGISTRY_PATH: &str = "data/aq_registry.sqlite";
pub const DEFAULT_BACKFILL_CSV: &str = "air_quality_2023.csv";
pub const DEFAULT_MODEL_DIR: &str = "models";
pub const DEFAULT_DASHBOARD_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub store_path: PathBuf,
    pub registry_path: PathBuf,
    pub feature_group_version: u32,
    pub feature_view_version: u32,
    pub training_dataset_version: u32,
    pub backfill_csv: PathBuf,
    pub model_dir: PathBuf,
    pub source: HttpSourceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            registry_path: PathBuf::from(DEFAULT_REGISTRY_PATH),
            feature_group_version: 1,
            feature_view_version: 1,
            training_dataset_version: 1,
            backfill_csv: PathBuf::from(DEFAULT_BACKFILL_CSV),
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            source: HttpSourceConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Builds the config from an arbitrary variable lookup; unset or blank
    /// variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| {
            lookup(var)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };
        let mut cfg = Self::default();

        if let Some(path) = get("AQ_STORE_PATH") {
            cfg.store_path = PathBuf::from(path);
        }
        if let Some(path) = get("AQ_REGISTRY_PATH") {
            cfg.registry_path = PathBuf::from(path);
        }
        if let Some(path) = get("AQ_BACKFILL_CSV") {
            cfg.backfill_csv = PathBuf::from(path);
        }
        if let Some(path) = get("AQ_MODEL_DIR") {
            cfg.model_dir = PathBuf::from(path);
        }
        if let Some(url) = get("AQ_SOURCE_URL") {
            cfg.source.base_url = url;
        }

        parse_into(&get, "AQ_FEATURE_GROUP_VERSION", &mut cfg.feature_group_version)?;
        parse_into(&get, "AQ_FEATURE_VIEW_VERSION", &mut cfg.feature_view_version)?;
        parse_into(
            &get,
            "AQ_TRAINING_DATASET_VERSION",
            &mut cfg.training_dataset_version,
        )?;
        parse_into(&get, "AQ_SOURCE_PAGE_LIMIT", &mut cfg.source.page_limit)?;
        parse_into(&get, "AQ_HTTP_TIMEOUT_MS", &mut cfg.source.timeout_ms)?;
        parse_into(&get, "AQ_HTTP_MAX_RETRIES", &mut cfg.source.max_retries)?;
        parse_into(
            &get,
            "AQ_HTTP_RETRY_BACKOFF_MS",
            &mut cfg.source.retry_backoff_ms,
        )?;

        if cfg.source.page_limit == 0 {
            return Err(ConfigError::Invalid {
                var: "AQ_SOURCE_PAGE_LIMIT",
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        for (var, version) in [
            ("AQ_FEATURE_GROUP_VERSION", cfg.feature_group_version),
            ("AQ_FEATURE_VIEW_VERSION", cfg.feature_view_version),
            ("AQ_TRAINING_DATASET_VERSION", cfg.training_dataset_version),
        ] {
            if version == 0 {
                return Err(ConfigError::Invalid {
                    var,
                    value: "0".to_string(),
                    reason: "versions start at 1".to_string(),
                });
            }
        }

        Ok(cfg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardConfig {
    pub bind_addr: SocketAddr,
    pub store_path: PathBuf,
    pub prediction_version: u32,
}

impl DashboardConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let pipeline = PipelineConfig::from_lookup(&lookup)?;
        let get = |var: &str| {
            lookup(var)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        let raw_addr = get("AQ_DASHBOARD_ADDR").unwrap_or_else(|| DEFAULT_DASHBOARD_ADDR.to_string());
        let bind_addr = raw_addr.parse().map_err(|err: std::net::AddrParseError| {
            ConfigError::Invalid {
                var: "AQ_DASHBOARD_ADDR",
                value: raw_addr.clone(),
                reason: err.to_string(),
            }
        })?;

        Ok(Self {
            bind_addr,
            store_path: pipeline.store_path,
            prediction_version: pipeline.feature_group_version,
        })
    }
}

fn parse_into<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = get(var) {
        *slot = raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: err.to_string(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{DEFAULT_PAGE_LIMIT, DEFAULT_SOURCE_URL};
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.source.base_url, DEFAULT_SOURCE_URL);
        assert_eq!(cfg.source.page_limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(cfg.feature_group_version, 1);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = PipelineConfig::from_lookup(lookup(&[
            ("AQ_STORE_PATH", "/tmp/store.sqlite"),
            ("AQ_FEATURE_GROUP_VERSION", " 2 "),
            ("AQ_SOURCE_PAGE_LIMIT", "50"),
            ("AQ_HTTP_MAX_RETRIES", "0"),
            ("AQ_MODEL_DIR", ""),
        ]))
        .unwrap();
        assert_eq!(cfg.store_path, PathBuf::from("/tmp/store.sqlite"));
        assert_eq!(cfg.feature_group_version, 2);
        assert_eq!(cfg.source.page_limit, 50);
        assert_eq!(cfg.source.max_retries, 0);
        assert_eq!(cfg.model_dir, PathBuf::from(DEFAULT_MODEL_DIR));
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let err = PipelineConfig::from_lookup(lookup(&[("AQ_HTTP_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "AQ_HTTP_TIMEOUT_MS",
                ..
            }
        ));
    }

    #[test]
    fn zero_version_is_rejected() {
        assert!(PipelineConfig::from_lookup(lookup(&[("AQ_FEATURE_VIEW_VERSION", "0")])).is_err());
    }

    #[test]
    fn dashboard_addr_is_validated() {
        let cfg = DashboardConfig::from_lookup(lookup(&[("AQ_DASHBOARD_ADDR", "0.0.0.0:9000")]))
            .unwrap();
        assert_eq!(cfg.bind_addr.port(), 9000);
        assert!(DashboardConfig::from_lookup(lookup(&[("AQ_DASHBOARD_ADDR", "nowhere")])).is_err());
    }
}
