//! Feature view, chronological train/test split and model registration.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{Duration, NaiveDateTime};
use polars::prelude::DataFrame;
use serde_json::{Map, Value};
use tracing::info;

use crate::frame::{
    filter_date_time, filter_rows, numeric_rows, sort_by_date_time, timestamps, FeatureSpec,
    FeatureType, DATE_TIME_COLUMN, DATE_TIME_STR_COLUMN,
};
use crate::model::{
    dense_column, dense_rows, mean_squared_error, r2_score, LinearRegression, MinMaxScaler,
};
use crate::observability::PipelineRun;
use crate::registry::{
    ModelArtifact, ModelRegistry, ModelSchema, NewModel, RegisteredModel, METRIC_TEST_MSE,
    METRIC_TEST_SCORE, METRIC_TRAIN_MSE, METRIC_TRAIN_SCORE,
};
use crate::store::{FeatureStore, FeatureViewSpec, TimeWindow, TrainingDatasetMeta};
use crate::timeseries::{build_time_series_features, TimeSeriesConfig};

use super::{
    PipelineError, BASELINE_VIEW, CLEAN_GROUP, ESTIMATION_MODEL, LABEL_COLUMN, TIME_SERIES_MODEL,
};

pub const TRAIN_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOptions {
    pub group_version: u32,
    pub view_version: u32,
    pub dataset_version: u32,
    pub train_fraction: f64,
    pub time_series: TimeSeriesConfig,
}

impl TrainingOptions {
    pub fn new(group_version: u32, view_version: u32, dataset_version: u32) -> Self {
        Self {
            group_version,
            view_version,
            dataset_version,
            train_fraction: TRAIN_FRACTION,
            time_series: TimeSeriesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub dataset: TrainingDatasetMeta,
    pub train_rows: usize,
    pub test_rows: usize,
    pub estimation_model: RegisteredModel,
    pub time_series_model: RegisteredModel,
}

pub fn run_training(
    store: &mut dyn FeatureStore,
    registry: &mut dyn ModelRegistry,
    model_dir: &Path,
    opts: &TrainingOptions,
) -> Result<TrainingReport, PipelineError> {
    let run = PipelineRun::start("training");
    let result = train_models(store, registry, model_dir, opts);
    match &result {
        Ok(report) => run.finish(report.train_rows + report.test_rows),
        Err(err) => run.fail(err),
    }
    result
}

pub fn train_models(
    store: &mut dyn FeatureStore,
    registry: &mut dyn ModelRegistry,
    model_dir: &Path,
    opts: &TrainingOptions,
) -> Result<TrainingReport, PipelineError> {
    let view = create_feature_view(store, opts.group_version, opts.view_version)?;
    let dataset = create_training_dataset(store, &view, opts)?;
    let frame = sort_by_date_time(&store.read(CLEAN_GROUP, opts.group_version, TimeWindow::all())?)?;

    let train_rows = rows_in(&frame, dataset.train_start, dataset.train_end, false)?.height();
    let test_rows = rows_in(&frame, dataset.test_start, dataset.test_end, true)?.height();

    let estimation_model = train_estimation_model(registry, model_dir, &frame, &view, &dataset)?;
    let time_series_model = train_time_series_model(registry, model_dir, &frame, &dataset, opts)?;

    Ok(TrainingReport {
        dataset,
        train_rows,
        test_rows,
        estimation_model,
        time_series_model,
    })
}

/// The baseline view over the cleaned group: the label plus every numeric
/// feature, the latter min-max scaled.
pub fn create_feature_view(
    store: &mut dyn FeatureStore,
    group_version: u32,
    view_version: u32,
) -> Result<FeatureViewSpec, PipelineError> {
    let group = store.feature_group(CLEAN_GROUP, group_version)?;
    let schema = group
        .schema
        .ok_or_else(|| PipelineError::EmptyGroup(CLEAN_GROUP.to_string()))?;

    let spec = FeatureViewSpec {
        name: BASELINE_VIEW.to_string(),
        version: view_version,
        description: "Baseline view over the cleaned air quality data".to_string(),
        source_group: CLEAN_GROUP.to_string(),
        source_version: group_version,
        labels: vec![LABEL_COLUMN.to_string()],
        scaled_columns: input_features(&schema),
    };
    Ok(store.get_or_create_feature_view(&spec)?)
}

fn input_features(schema: &[FeatureSpec]) -> Vec<String> {
    schema
        .iter()
        .filter(|spec| {
            matches!(spec.feature_type, FeatureType::Double | FeatureType::Bigint)
                && spec.name != LABEL_COLUMN
                && spec.name != DATE_TIME_COLUMN
                && spec.name != DATE_TIME_STR_COLUMN
        })
        .map(|spec| spec.name.clone())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitBounds {
    pub train_start: NaiveDateTime,
    pub train_end: NaiveDateTime,
    pub test_start: NaiveDateTime,
    pub test_end: NaiveDateTime,
}

/// Boundaries at `floor(fraction * n)` of the sorted timestamps. Training
/// covers `[train_start, train_end)`, testing `[test_start, test_end]`.
pub fn chronological_split(
    stamps: &[NaiveDateTime],
    fraction: f64,
) -> Result<SplitBounds, PipelineError> {
    let n = stamps.len();
    if n < 2 {
        return Err(PipelineError::NotEnoughRows(n));
    }
    let cut = ((fraction * n as f64) as usize).clamp(1, n - 1);
    Ok(SplitBounds {
        train_start: stamps[0],
        train_end: stamps[cut],
        test_start: stamps[cut],
        test_end: stamps[n - 1],
    })
}

pub fn create_training_dataset(
    store: &mut dyn FeatureStore,
    view: &FeatureViewSpec,
    opts: &TrainingOptions,
) -> Result<TrainingDatasetMeta, PipelineError> {
    let frame = sort_by_date_time(&store.read(
        &view.source_group,
        view.source_version,
        TimeWindow::all(),
    )?)?;
    let stamps: Vec<NaiveDateTime> = timestamps(&frame, DATE_TIME_COLUMN)?
        .into_iter()
        .flatten()
        .collect();
    let bounds = chronological_split(&stamps, opts.train_fraction)?;

    let train = rows_in(&frame, bounds.train_start, bounds.train_end, false)?;
    let scaled: Vec<&str> = view.scaled_columns.iter().map(String::as_str).collect();
    let scaler = MinMaxScaler::fit(&train, &scaled)?;

    let meta = TrainingDatasetMeta {
        view_name: view.name.clone(),
        view_version: view.version,
        version: opts.dataset_version,
        description: "Baseline train test split".to_string(),
        train_start: bounds.train_start,
        train_end: bounds.train_end,
        test_start: bounds.test_start,
        test_end: bounds.test_end,
        scaler,
    };
    store.save_training_dataset(&meta)?;
    info!(
        component = "training",
        event = "training.dataset.saved",
        view = %meta.view_name,
        version = meta.version,
        train_rows = train.height(),
        train_end = %meta.train_end
    );
    Ok(meta)
}

/// Timestamps are stored at millisecond resolution, so an inclusive end is
/// the half-open window one millisecond longer.
fn rows_in(
    frame: &DataFrame,
    start: NaiveDateTime,
    end: NaiveDateTime,
    inclusive_end: bool,
) -> Result<DataFrame, PipelineError> {
    let end = if inclusive_end {
        end + Duration::milliseconds(1)
    } else {
        end
    };
    Ok(filter_date_time(frame, Some(start), Some(end))?)
}

struct Fitted {
    model: LinearRegression,
    metrics: BTreeMap<String, f64>,
    input_example: Value,
}

/// Fits on the training rows and scores both splits. `features` must be
/// dense in both frames.
fn fit_and_score(
    train: &DataFrame,
    test: &DataFrame,
    features: &[String],
) -> Result<Fitted, PipelineError> {
    let names: Vec<&str> = features.iter().map(String::as_str).collect();
    let train_x = dense_rows(train, &names)?;
    let train_y = dense_column(train, LABEL_COLUMN)?;
    let test_x = dense_rows(test, &names)?;
    let test_y = dense_column(test, LABEL_COLUMN)?;

    let model = LinearRegression::fit(features.to_vec(), &train_x, &train_y)?;
    let train_pred = model.predict(&train_x)?;
    let test_pred = model.predict(&test_x)?;

    // An empty split scores NaN, which JSON cannot carry; leave it out.
    let metrics: BTreeMap<String, f64> = [
        (METRIC_TRAIN_SCORE, r2_score(&train_y, &train_pred)),
        (METRIC_TEST_SCORE, r2_score(&test_y, &test_pred)),
        (METRIC_TRAIN_MSE, mean_squared_error(&train_y, &train_pred)),
        (METRIC_TEST_MSE, mean_squared_error(&test_y, &test_pred)),
    ]
    .into_iter()
    .filter(|(_, value)| value.is_finite())
    .map(|(name, value)| (name.to_string(), value))
    .collect();

    let input_example = test_x
        .last()
        .map(|row| {
            Value::Object(
                features
                    .iter()
                    .cloned()
                    .zip(row.iter().map(|v| Value::from(*v)))
                    .collect::<Map<String, Value>>(),
            )
        })
        .unwrap_or(Value::Null);

    Ok(Fitted {
        model,
        metrics,
        input_example,
    })
}

fn train_estimation_model(
    registry: &mut dyn ModelRegistry,
    model_dir: &Path,
    frame: &DataFrame,
    view: &FeatureViewSpec,
    dataset: &TrainingDatasetMeta,
) -> Result<RegisteredModel, PipelineError> {
    let scaled = dataset.scaler.transform(frame)?;
    let train = rows_in(&scaled, dataset.train_start, dataset.train_end, false)?;
    let test = rows_in(&scaled, dataset.test_start, dataset.test_end, true)?;

    let fitted = fit_and_score(&train, &test, &view.scaled_columns)?;
    let artifact = ModelArtifact {
        regression: fitted.model,
        scaler: dataset.scaler.clone(),
        time_series: None,
    };
    register(
        registry,
        model_dir,
        ESTIMATION_MODEL,
        "Baseline linear regression model",
        fitted.metrics,
        fitted.input_example,
        artifact,
    )
}

/// Lag and rolling features of the label only; rows without full history
/// are left out of both splits.
fn train_time_series_model(
    registry: &mut dyn ModelRegistry,
    model_dir: &Path,
    frame: &DataFrame,
    dataset: &TrainingDatasetMeta,
    opts: &TrainingOptions,
) -> Result<RegisteredModel, PipelineError> {
    let features = opts.time_series.feature_names();
    let names: Vec<&str> = features.iter().map(String::as_str).collect();
    let mut needed = names.clone();
    needed.push(LABEL_COLUMN);

    let with_lags = build_time_series_features(frame, &opts.time_series)?;
    let complete_mask: Vec<bool> = numeric_rows(&with_lags, &needed)?
        .iter()
        .map(|row| row.iter().all(Option::is_some))
        .collect();
    let complete = filter_rows(&with_lags, &complete_mask)?;

    let train = rows_in(&complete, dataset.train_start, dataset.train_end, false)?;
    let test = rows_in(&complete, dataset.test_start, dataset.test_end, true)?;

    let fitted = fit_and_score(&train, &test, &features)?;
    let artifact = ModelArtifact {
        regression: fitted.model,
        scaler: MinMaxScaler::default(),
        time_series: Some(opts.time_series.clone()),
    };
    register(
        registry,
        model_dir,
        TIME_SERIES_MODEL,
        "Lagged linear regression model",
        fitted.metrics,
        fitted.input_example,
        artifact,
    )
}

fn register(
    registry: &mut dyn ModelRegistry,
    model_dir: &Path,
    name: &str,
    description: &str,
    metrics: BTreeMap<String, f64>,
    input_example: Value,
    artifact: ModelArtifact,
) -> Result<RegisteredModel, PipelineError> {
    let export_dir = model_dir.join(name);
    std::fs::create_dir_all(&export_dir)?;
    std::fs::write(
        export_dir.join("linear_regression.json"),
        serde_json::to_vec_pretty(&artifact)?,
    )?;

    let schema = ModelSchema {
        inputs: artifact
            .regression
            .feature_names
            .iter()
            .map(|n| FeatureSpec::new(n.clone(), FeatureType::Double))
            .collect(),
        outputs: vec![FeatureSpec::new(LABEL_COLUMN, FeatureType::Double)],
    };

    info!(
        component = "training",
        event = "training.model.fitted",
        model = %name,
        train_score = metrics.get(METRIC_TRAIN_SCORE).copied().unwrap_or(f64::NAN),
        test_score = metrics.get(METRIC_TEST_SCORE).copied().unwrap_or(f64::NAN)
    );

    Ok(registry.register(NewModel {
        name: name.to_string(),
        description: description.to_string(),
        metrics,
        schema,
        input_example,
        artifact,
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn hour(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 10, 9)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn split_cuts_at_eighty_percent() {
        let stamps: Vec<NaiveDateTime> = (0..10).map(hour).collect();
        let bounds = chronological_split(&stamps, TRAIN_FRACTION).unwrap();
        assert_eq!(bounds.train_start, hour(0));
        assert_eq!(bounds.train_end, hour(8));
        assert_eq!(bounds.test_start, hour(8));
        assert_eq!(bounds.test_end, hour(9));
    }

    #[test]
    fn split_keeps_one_row_on_each_side() {
        let stamps = vec![hour(0), hour(1)];
        let bounds = chronological_split(&stamps, 0.99).unwrap();
        assert_eq!(bounds.train_end, hour(1));
        assert!(matches!(
            chronological_split(&stamps[..1], TRAIN_FRACTION).unwrap_err(),
            PipelineError::NotEnoughRows(1)
        ));
    }

    #[test]
    fn inputs_exclude_label_keys_and_text() {
        let schema = vec![
            FeatureSpec::new(DATE_TIME_STR_COLUMN, FeatureType::String),
            FeatureSpec::new(LABEL_COLUMN, FeatureType::Double),
            FeatureSpec::new("no2", FeatureType::Double),
            FeatureSpec::new("station", FeatureType::String),
            FeatureSpec::new("count", FeatureType::Bigint),
            FeatureSpec::new(DATE_TIME_COLUMN, FeatureType::Timestamp),
        ];
        assert_eq!(input_features(&schema), vec!["no2", "count"]);
    }

    #[test]
    fn test_window_includes_its_last_row() {
        let stamps: Vec<Option<NaiveDateTime>> = (0..4).map(|h| Some(hour(h))).collect();
        let frame =
            DataFrame::new(vec![crate::frame::timestamp_column(DATE_TIME_COLUMN, &stamps).unwrap()])
                .unwrap();
        assert_eq!(rows_in(&frame, hour(0), hour(3), false).unwrap().height(), 3);
        assert_eq!(rows_in(&frame, hour(2), hour(3), true).unwrap().height(), 2);
    }
}
