//! Model registry and serving deployments backed by SQLite.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use polars::prelude::DataFrame;

use crate::frame::FeatureSpec;
use crate::model::{dense_rows, LinearRegression, MinMaxScaler, ModelError};
use crate::timeseries::TimeSeriesConfig;

pub const METRIC_TRAIN_SCORE: &str = "Train Score";
pub const METRIC_TEST_SCORE: &str = "Test Score";
pub const METRIC_TRAIN_MSE: &str = "Train MSE";
pub const METRIC_TEST_MSE: &str = "Test MSE";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },
    #[error("no version of model '{name}' reports metric '{metric}'")]
    MetricMissing { name: String, metric: String },
    #[error("deployment '{0}' is not running")]
    NotRunning(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricDirection {
    Min,
    Max,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSchema {
    pub inputs: Vec<FeatureSpec>,
    pub outputs: Vec<FeatureSpec>,
}

/// Everything needed to turn a feature frame into predictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub regression: LinearRegression,
    pub scaler: MinMaxScaler,
    pub time_series: Option<TimeSeriesConfig>,
}

impl ModelArtifact {
    /// Scales the fitted columns, then predicts one value per row.
    pub fn predict_frame(&self, frame: &DataFrame) -> Result<Vec<f64>, ModelError> {
        let scaled = self.scaler.transform(frame)?;
        let names: Vec<&str> = self
            .regression
            .feature_names
            .iter()
            .map(String::as_str)
            .collect();
        self.regression.predict(&dense_rows(&scaled, &names)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewModel {
    pub name: String,
    pub description: String,
    pub metrics: BTreeMap<String, f64>,
    pub schema: ModelSchema,
    pub input_example: Value,
    pub artifact: ModelArtifact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub name: String,
    pub version: u32,
    pub description: String,
    pub metrics: BTreeMap<String, f64>,
    pub schema: ModelSchema,
    pub input_example: Value,
    pub artifact: ModelArtifact,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    Created,
    Running,
    Stopped,
}

impl DeploymentState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            _ => Self::Created,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub model_name: String,
    pub model_version: u32,
    pub state: DeploymentState,
}

pub trait ModelRegistry {
    /// Stores the model under the next free version of its name.
    fn register(&mut self, model: NewModel) -> Result<RegisteredModel, RegistryError>;

    fn model(&self, name: &str, version: u32) -> Result<RegisteredModel, RegistryError>;

    fn best_model(
        &self,
        name: &str,
        metric: &str,
        direction: MetricDirection,
    ) -> Result<RegisteredModel, RegistryError>;
}

pub trait ModelServing {
    /// Creates the deployment or rebinds it to `model`; either way it is
    /// left in the `Created` state.
    fn deploy(&mut self, name: &str, model: &RegisteredModel) -> Result<Deployment, RegistryError>;

    fn deployment(&self, name: &str) -> Result<Deployment, RegistryError>;

    fn start(&mut self, name: &str) -> Result<Deployment, RegistryError>;

    fn stop(&mut self, name: &str) -> Result<Deployment, RegistryError>;

    fn predict(&self, name: &str, inputs: &DataFrame) -> Result<Vec<f64>, RegistryError>;
}

pub struct SqliteModelRegistry {
    conn: Connection,
}

impl SqliteModelRegistry {
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        ensure_registry_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        ensure_registry_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn versions(&self, name: &str) -> Result<Vec<RegisteredModel>, RegistryError> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload FROM models WHERE name = ?1 ORDER BY version")?;
        let payloads = stmt
            .query_map(params![name], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        payloads
            .iter()
            .map(|raw| Ok(serde_json::from_str(raw)?))
            .collect()
    }

    fn set_state(&mut self, name: &str, state: DeploymentState) -> Result<Deployment, RegistryError> {
        let updated = self.conn.execute(
            "UPDATE deployments SET state = ?1 WHERE name = ?2",
            params![state.as_str(), name],
        )?;
        if updated == 0 {
            return Err(deployment_not_found(name));
        }
        info!(
            component = "model_serving",
            event = "serving.deployment.state",
            deployment = %name,
            state = state.as_str()
        );
        self.deployment(name)
    }
}

impl ModelRegistry for SqliteModelRegistry {
    fn register(&mut self, model: NewModel) -> Result<RegisteredModel, RegistryError> {
        let tx = self.conn.transaction()?;
        let latest: Option<u32> = tx.query_row(
            "SELECT MAX(version) FROM models WHERE name = ?1",
            params![model.name],
            |row| row.get(0),
        )?;
        let registered = RegisteredModel {
            version: latest.unwrap_or(0) + 1,
            name: model.name,
            description: model.description,
            metrics: model.metrics,
            schema: model.schema,
            input_example: model.input_example,
            artifact: model.artifact,
            created_at_ms: Utc::now().timestamp_millis(),
        };
        tx.execute(
            "INSERT INTO models (name, version, payload) VALUES (?1, ?2, ?3)",
            params![
                registered.name,
                registered.version,
                serde_json::to_string(&registered)?
            ],
        )?;
        tx.commit()?;

        info!(
            component = "model_registry",
            event = "registry.model.registered",
            model = %registered.name,
            version = registered.version,
            metrics = ?registered.metrics
        );
        Ok(registered)
    }

    fn model(&self, name: &str, version: u32) -> Result<RegisteredModel, RegistryError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM models WHERE name = ?1 AND version = ?2",
                params![name, version],
                |row| row.get(0),
            )
            .optional()?;
        let payload = payload.ok_or_else(|| RegistryError::NotFound {
            kind: "model",
            name: format!("{name}/{version}"),
        })?;
        Ok(serde_json::from_str(&payload)?)
    }

    fn best_model(
        &self,
        name: &str,
        metric: &str,
        direction: MetricDirection,
    ) -> Result<RegisteredModel, RegistryError> {
        let versions = self.versions(name)?;
        if versions.is_empty() {
            return Err(RegistryError::NotFound {
                kind: "model",
                name: name.to_string(),
            });
        }

        // Later versions win ties.
        let mut best: Option<(f64, RegisteredModel)> = None;
        for candidate in versions {
            let Some(value) = candidate.metrics.get(metric).copied() else {
                continue;
            };
            if value.is_nan() {
                continue;
            }
            let better = match &best {
                None => true,
                Some((current, _)) => match direction {
                    MetricDirection::Min => value <= *current,
                    MetricDirection::Max => value >= *current,
                },
            };
            if better {
                best = Some((value, candidate));
            }
        }

        best.map(|(_, model)| model)
            .ok_or_else(|| RegistryError::MetricMissing {
                name: name.to_string(),
                metric: metric.to_string(),
            })
    }
}

impl ModelServing for SqliteModelRegistry {
    fn deploy(&mut self, name: &str, model: &RegisteredModel) -> Result<Deployment, RegistryError> {
        self.model(&model.name, model.version)?;
        self.conn.execute(
            "
            INSERT INTO deployments (name, model_name, model_version, state)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(name) DO UPDATE SET
                model_name = excluded.model_name,
                model_version = excluded.model_version,
                state = excluded.state
            ",
            params![
                name,
                model.name,
                model.version,
                DeploymentState::Created.as_str()
            ],
        )?;
        info!(
            component = "model_serving",
            event = "serving.deployment.created",
            deployment = %name,
            model = %model.name,
            version = model.version
        );
        self.deployment(name)
    }

    fn deployment(&self, name: &str) -> Result<Deployment, RegistryError> {
        self.conn
            .query_row(
                "SELECT model_name, model_version, state FROM deployments WHERE name = ?1",
                params![name],
                |row| {
                    Ok(Deployment {
                        name: name.to_string(),
                        model_name: row.get(0)?,
                        model_version: row.get(1)?,
                        state: DeploymentState::parse(&row.get::<_, String>(2)?),
                    })
                },
            )
            .optional()?
            .ok_or_else(|| deployment_not_found(name))
    }

    fn start(&mut self, name: &str) -> Result<Deployment, RegistryError> {
        self.set_state(name, DeploymentState::Running)
    }

    fn stop(&mut self, name: &str) -> Result<Deployment, RegistryError> {
        self.set_state(name, DeploymentState::Stopped)
    }

    fn predict(&self, name: &str, inputs: &DataFrame) -> Result<Vec<f64>, RegistryError> {
        let deployment = self.deployment(name)?;
        if deployment.state != DeploymentState::Running {
            return Err(RegistryError::NotRunning(name.to_string()));
        }
        let model = self.model(&deployment.model_name, deployment.model_version)?;
        Ok(model.artifact.predict_frame(inputs)?)
    }
}

fn deployment_not_found(name: &str) -> RegistryError {
    RegistryError::NotFound {
        kind: "deployment",
        name: name.to_string(),
    }
}

fn ensure_registry_schema(conn: &Connection) -> Result<(), RegistryError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS models (
            name TEXT NOT NULL,
            version INTEGER NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY(name, version)
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS deployments (
            name TEXT PRIMARY KEY,
            model_name TEXT NOT NULL,
            model_version INTEGER NOT NULL,
            state TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::float_column;

    fn new_model(test_mse: Option<f64>) -> NewModel {
        let mut metrics = BTreeMap::new();
        if let Some(mse) = test_mse {
            metrics.insert(METRIC_TEST_MSE.to_string(), mse);
        }
        NewModel {
            name: "air_quality_estimation_model".to_string(),
            description: "test".to_string(),
            metrics,
            schema: ModelSchema::default(),
            input_example: Value::Null,
            artifact: ModelArtifact {
                regression: LinearRegression {
                    feature_names: vec!["x".to_string()],
                    intercept: 1.0,
                    coefficients: vec![2.0],
                },
                scaler: MinMaxScaler::default(),
                time_series: None,
            },
        }
    }

    #[test]
    fn versions_increment_per_name() {
        let mut registry = SqliteModelRegistry::open_in_memory().unwrap();
        assert_eq!(registry.register(new_model(Some(1.0))).unwrap().version, 1);
        assert_eq!(registry.register(new_model(Some(2.0))).unwrap().version, 2);
        assert_eq!(
            registry
                .model("air_quality_estimation_model", 2)
                .unwrap()
                .metrics[METRIC_TEST_MSE],
            2.0
        );
    }

    #[test]
    fn best_model_respects_direction_and_skips_unscored_versions() {
        let mut registry = SqliteModelRegistry::open_in_memory().unwrap();
        registry.register(new_model(Some(3.0))).unwrap();
        registry.register(new_model(Some(1.0))).unwrap();
        registry.register(new_model(None)).unwrap();
        registry.register(new_model(Some(2.0))).unwrap();

        let name = "air_quality_estimation_model";
        let min = registry
            .best_model(name, METRIC_TEST_MSE, MetricDirection::Min)
            .unwrap();
        assert_eq!(min.version, 2);
        let max = registry
            .best_model(name, METRIC_TEST_MSE, MetricDirection::Max)
            .unwrap();
        assert_eq!(max.version, 1);
        assert!(matches!(
            registry
                .best_model(name, METRIC_TRAIN_MSE, MetricDirection::Min)
                .unwrap_err(),
            RegistryError::MetricMissing { .. }
        ));
        assert!(matches!(
            registry
                .best_model("other", METRIC_TEST_MSE, MetricDirection::Min)
                .unwrap_err(),
            RegistryError::NotFound { .. }
        ));
    }

    #[test]
    fn predict_requires_running_deployment() {
        let mut registry = SqliteModelRegistry::open_in_memory().unwrap();
        let model = registry.register(new_model(Some(1.0))).unwrap();
        registry.deploy("aqestimatordeployment", &model).unwrap();

        let inputs = DataFrame::new(vec![float_column("x", vec![Some(1.0), Some(2.0)])]).unwrap();
        assert!(matches!(
            registry.predict("aqestimatordeployment", &inputs).unwrap_err(),
            RegistryError::NotRunning(_)
        ));

        let started = registry.start("aqestimatordeployment").unwrap();
        assert_eq!(started.state, DeploymentState::Running);
        assert_eq!(
            registry.predict("aqestimatordeployment", &inputs).unwrap(),
            vec![3.0, 5.0]
        );

        registry.stop("aqestimatordeployment").unwrap();
        assert!(registry.predict("aqestimatordeployment", &inputs).is_err());
    }

    #[test]
    fn redeploy_rebinds_and_resets_state() {
        let mut registry = SqliteModelRegistry::open_in_memory().unwrap();
        let first = registry.register(new_model(Some(1.0))).unwrap();
        let second = registry.register(new_model(Some(0.5))).unwrap();
        registry.deploy("d", &first).unwrap();
        registry.start("d").unwrap();

        let redeployed = registry.deploy("d", &second).unwrap();
        assert_eq!(redeployed.model_version, 2);
        assert_eq!(redeployed.state, DeploymentState::Created);
    }

    #[test]
    fn unknown_deployment_is_not_found() {
        let mut registry = SqliteModelRegistry::open_in_memory().unwrap();
        assert!(matches!(
            registry.start("missing").unwrap_err(),
            RegistryError::NotFound { .. }
        ));
    }
}
