//! End-to-end jobs. Each one receives its store, registry or serving handle
//! as a parameter and can be re-run after a failure.

mod backfill;
mod batch_inference;
mod deployment;
mod online_feature;
mod online_inference;
mod training;

pub use backfill::{backfill_frame, run_backfill, BackfillReport};
pub use batch_inference::{batch_predict, prediction_view_spec, run_batch_inference};
pub use deployment::{deploy_best_models, run_deployment, DEPLOYMENTS};
pub use online_feature::{run_online_feature_update, update_feature_groups, OnlineFeatureReport};
pub use online_inference::{pending_rows, run_online_inference, update_predictions};
pub use training::{
    chronological_split, create_feature_view, create_training_dataset, run_training,
    train_models, SplitBounds, TrainingOptions, TrainingReport, TRAIN_FRACTION,
};

use polars::prelude::DataFrame;
use thiserror::Error;

use crate::config::ConfigError;
use crate::frame::{
    float_column, float_values, require, PreprocessError, DATE_TIME_COLUMN, DATE_TIME_STR_COLUMN,
};
use crate::model::ModelError;
use crate::registry::RegistryError;
use crate::source::SourceError;
use crate::store::{FeatureGroupSpec, StoreError};

pub const RAW_GROUP: &str = "air_quality_data";
pub const CLEAN_GROUP: &str = "cleaned_air_quality_data";
pub const PREDICTION_GROUP: &str = "predicted_air_quality_regression";
pub const BASELINE_VIEW: &str = "air_qaulity_baseline_fv";
pub const PREDICTION_VIEW: &str = "predicted_air_quality_regression_fv";
pub const LABEL_COLUMN: &str = "femman_pm25";
pub const PREDICTED_LABEL_COLUMN: &str = "predicted_femman_pm25";
pub const ESTIMATION_MODEL: &str = "air_quality_estimation_model";
pub const TIME_SERIES_MODEL: &str = "air_quality_time_series_model";
pub const ESTIMATOR_DEPLOYMENT: &str = "aqestimatordeployment";
pub const TIME_SERIES_DEPLOYMENT: &str = "aqtsdeployment";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("feature group '{0}' has no rows yet; run the backfill first")]
    EmptyGroup(String),
    #[error("not enough rows to split: {0}")]
    NotEnoughRows(usize),
}

pub fn raw_group_spec(version: u32) -> FeatureGroupSpec {
    FeatureGroupSpec {
        name: RAW_GROUP.to_string(),
        version,
        description: "Uncleaned raw data for air quality in Gothenburg".to_string(),
        primary_key: DATE_TIME_COLUMN.to_string(),
        event_time: DATE_TIME_COLUMN.to_string(),
        online_enabled: false,
    }
}

pub fn clean_group_spec(version: u32) -> FeatureGroupSpec {
    FeatureGroupSpec {
        name: CLEAN_GROUP.to_string(),
        version,
        description: "Cleaned raw data for air quality in Gothenburg".to_string(),
        primary_key: DATE_TIME_STR_COLUMN.to_string(),
        event_time: DATE_TIME_COLUMN.to_string(),
        online_enabled: true,
    }
}

pub fn prediction_group_spec(version: u32) -> FeatureGroupSpec {
    FeatureGroupSpec {
        name: PREDICTION_GROUP.to_string(),
        version,
        description: "Predicted air quality in Gothenburg".to_string(),
        primary_key: DATE_TIME_STR_COLUMN.to_string(),
        event_time: DATE_TIME_COLUMN.to_string(),
        online_enabled: true,
    }
}

/// Rows of the prediction group: key, observed label, event time and the
/// model output, in that column order.
pub(crate) fn prediction_frame(
    source: &DataFrame,
    predictions: Vec<f64>,
) -> Result<DataFrame, PreprocessError> {
    if predictions.len() != source.height() {
        return Err(PreprocessError::LengthMismatch {
            column: PREDICTED_LABEL_COLUMN.to_string(),
            expected: source.height(),
            actual: predictions.len(),
        });
    }
    let actual = float_values(source, LABEL_COLUMN)?;

    Ok(DataFrame::new(vec![
        require(source, DATE_TIME_STR_COLUMN)?.clone(),
        float_column(LABEL_COLUMN, actual),
        require(source, DATE_TIME_COLUMN)?.clone(),
        float_column(
            PREDICTED_LABEL_COLUMN,
            predictions.into_iter().map(Some).collect(),
        ),
    ])?)
}
