//! Air-quality prediction core crate.
//!
//! Current implemented scope:
//! - Preprocessing on polars frames: date-time assembly, type coercion,
//!   missing-data cleaning
//! - Feature store and model registry backed by SQLite
//! - Backfill, online feature, training, deployment and inference pipelines
//! - Prediction dashboard over HTTP

mod assemble;
mod cleaning;
mod coercion;
mod config;
mod dashboard;
mod datetime;
mod frame;
mod iterative;
mod model;
mod observability;
mod pipeline;
mod registry;
mod source;
mod store;
mod timeseries;

pub use polars;

pub use assemble::{create_date_time_feature, normalize_column_names, DATE_COLUMN, TIME_COLUMN};
pub use cleaning::{
    clean_data, conform_to_schema, filter_features, interpolate, remove_nan_features,
    EdgeGapPolicy, ImputationStrategy, SchemaPolicy, MISSING_RATIO_DROP_THRESHOLD_PCT,
};
pub use coercion::set_feature_type;
pub use config::{
    ConfigError, DashboardConfig, PipelineConfig, DEFAULT_BACKFILL_CSV, DEFAULT_DASHBOARD_ADDR,
    DEFAULT_MODEL_DIR, DEFAULT_REGISTRY_PATH, DEFAULT_STORE_PATH,
};
pub use dashboard::{
    dashboard_router, load_series, points_from_frame, render_dashboard_html, DashboardError,
    EstimationPeriod, InMemoryPredictionSource, PredictionPoint, PredictionSeries,
    PredictionSource, StorePredictionSource,
};
pub use datetime::{convert_to_datetime, format_date_time, DATE_TIME_FORMAT};
pub use frame::{
    column_names, date_time_dtype, dedup_sorted_by, filter_date_time, filter_rows, float_column,
    float_values, int_column, null_column, numeric_rows, schema_of, sort_by, sort_by_date_time,
    text_column, text_values, timestamp_column, timestamps, total_null_count, FeatureSpec,
    FeatureType, PreprocessError, DATE_TIME_COLUMN, DATE_TIME_STR_COLUMN,
};
pub use iterative::{
    impute_iterative, ImputationOrder, IterativeImputerConfig, ITERATIVE_MAX_ITER,
    ITERATIVE_RANDOM_SEED,
};
pub use model::{
    dense_column, dense_rows, mean_squared_error, r2_score, LinearRegression, MinMaxScaler,
    MinMaxStats, ModelError,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, logging_config_from_env,
    logging_config_from_lookup, LogFormat, LoggingConfig,
    LoggingInitError, PipelineRun,
};
pub use pipeline::{
    backfill_frame, batch_predict, chronological_split, clean_group_spec, create_feature_view,
    create_training_dataset, deploy_best_models, pending_rows, prediction_group_spec,
    prediction_view_spec, raw_group_spec, run_backfill, run_batch_inference, run_deployment,
    run_online_feature_update, run_online_inference, run_training, train_models,
    update_feature_groups, update_predictions, BackfillReport, OnlineFeatureReport,
    PipelineError, SplitBounds, TrainingOptions, TrainingReport, BASELINE_VIEW, CLEAN_GROUP,
    DEPLOYMENTS, ESTIMATION_MODEL, ESTIMATOR_DEPLOYMENT, LABEL_COLUMN, PREDICTED_LABEL_COLUMN,
    PREDICTION_GROUP, PREDICTION_VIEW, RAW_GROUP, TIME_SERIES_DEPLOYMENT, TIME_SERIES_MODEL,
    TRAIN_FRACTION,
};
pub use registry::{
    Deployment, DeploymentState, MetricDirection, ModelArtifact, ModelRegistry, ModelSchema,
    ModelServing, NewModel, RegisteredModel, RegistryError, SqliteModelRegistry,
    METRIC_TEST_MSE, METRIC_TEST_SCORE, METRIC_TRAIN_MSE, METRIC_TRAIN_SCORE,
};
pub use source::{
    fetch_all_records, fetch_frame, read_csv, read_csv_frame, records_to_frame, HttpFetcher,
    HttpSourceConfig, ReqwestBlockingFetcher, SourceError, DEFAULT_PAGE_LIMIT, DEFAULT_SOURCE_URL,
};
pub use store::{
    schema_fingerprint, FeatureGroup, FeatureGroupSpec, FeatureStore, FeatureViewSpec,
    SqliteFeatureStore, StoreError, TimeWindow, TrainingDatasetMeta,
};
pub use timeseries::{
    append_forecast_placeholders, build_time_series_features, is_placeholder, TimeSeriesConfig,
    HOUR_COS_COLUMN, HOUR_SIN_COLUMN, PLACEHOLDER_TARGET,
};
