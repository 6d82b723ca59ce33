//! Lag, rolling-mean and hour-of-day features over an hourly target series.
//!
//! Future rows appended by [`append_forecast_placeholders`] carry
//! [`PLACEHOLDER_TARGET`] in the target column. Those rows, like rows with a
//! missing target, are unobserved: they receive derived features from the
//! history before them but never feed later lags or windows.

use std::collections::HashSet;
use std::f64::consts::PI;

use chrono::{Duration, NaiveDateTime, Timelike};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::datetime::format_date_time;
use crate::frame::{
    float_column, require, text_column, timestamp_column, timestamps, FeatureType,
    PreprocessError, DATE_TIME_COLUMN, DATE_TIME_STR_COLUMN,
};

const ROW_INDEX: &str = "__row_index";

pub const PLACEHOLDER_TARGET: f64 = -1.0;
pub const HOUR_SIN_COLUMN: &str = "hour_sin";
pub const HOUR_COS_COLUMN: &str = "hour_cos";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesConfig {
    pub target: String,
    pub lags: Vec<usize>,
    pub rolling_windows: Vec<usize>,
    pub hour_encoding: bool,
}

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        Self {
            target: "femman_pm25".to_string(),
            lags: vec![1, 2, 3, 24],
            rolling_windows: vec![3, 24],
            hour_encoding: true,
        }
    }
}

impl TimeSeriesConfig {
    pub fn lag_name(&self, lag: usize) -> String {
        format!("{}_lag_{lag}", self.target)
    }

    pub fn rolling_name(&self, window: usize) -> String {
        format!("{}_rolling_mean_{window}", self.target)
    }

    /// Names of every derived column, in the order they are appended.
    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lags.iter().map(|k| self.lag_name(*k)).collect();
        names.extend(self.rolling_windows.iter().map(|w| self.rolling_name(*w)));
        if self.hour_encoding {
            names.push(HOUR_SIN_COLUMN.to_string());
            names.push(HOUR_COS_COLUMN.to_string());
        }
        names
    }
}

pub fn is_placeholder(value: f64) -> bool {
    value == PLACEHOLDER_TARGET
}

pub fn build_time_series_features(
    frame: &DataFrame,
    cfg: &TimeSeriesConfig,
) -> Result<DataFrame, PreprocessError> {
    validate_config(cfg)?;
    let stamps = timestamps(frame, DATE_TIME_COLUMN)?;
    if stamps.windows(2).any(|w| match (w[0], w[1]) {
        (Some(a), Some(b)) => a > b,
        (None, Some(_)) => true,
        _ => false,
    }) {
        return Err(PreprocessError::InvalidInput(
            "frame must be sorted by date_time".to_string(),
        ));
    }

    let target = require(frame, &cfg.target)?;
    if !FeatureType::of(target.dtype()).is_numeric() {
        return Err(PreprocessError::KindMismatch {
            column: cfg.target.clone(),
            expected: "float",
            actual: target.dtype().to_string(),
        });
    }

    // Placeholder rows are unobserved and never feed later lags or windows.
    let observed = || {
        let value = col(cfg.target.as_str()).cast(DataType::Float64);
        when(value.clone().eq(lit(PLACEHOLDER_TARGET)))
            .then(lit(NULL).cast(DataType::Float64))
            .otherwise(value)
    };

    let mut derived = Vec::with_capacity(cfg.lags.len() + cfg.rolling_windows.len());
    for k in &cfg.lags {
        derived.push(observed().shift(lit(*k as i64)).alias(cfg.lag_name(*k)));
    }
    for w in &cfg.rolling_windows {
        // Mean of the observed values among the `w` rows before this one,
        // defined once `w` rows of history exist.
        let mean = observed()
            .shift(lit(1i64))
            .rolling_mean(RollingOptionsFixedWindow {
                window_size: *w,
                min_periods: 1,
                ..Default::default()
            });
        derived.push(
            when(col(ROW_INDEX).cast(DataType::Int64).lt(lit(*w as i64)))
                .then(lit(NULL).cast(DataType::Float64))
                .otherwise(mean)
                .alias(cfg.rolling_name(*w)),
        );
    }

    let mut out = frame
        .clone()
        .lazy()
        .with_row_index(ROW_INDEX, None)
        .with_columns(derived)
        .select([col("*").exclude([ROW_INDEX])])
        .collect()?;

    if cfg.hour_encoding {
        let (sin, cos): (Vec<Option<f64>>, Vec<Option<f64>>) = stamps
            .iter()
            .map(|ts| match ts.map(hour_of_day_encoding) {
                Some((s, c)) => (Some(s), Some(c)),
                None => (None, None),
            })
            .unzip();
        out.with_column(float_column(HOUR_SIN_COLUMN, sin))?;
        out.with_column(float_column(HOUR_COS_COLUMN, cos))?;
    }
    Ok(out)
}

/// Appends `horizon_hours` hourly rows after the latest `date_time` with the
/// placeholder target and every other cell missing.
pub fn append_forecast_placeholders(
    frame: &DataFrame,
    target: &str,
    horizon_hours: usize,
) -> Result<DataFrame, PreprocessError> {
    let last = timestamps(frame, DATE_TIME_COLUMN)?
        .into_iter()
        .flatten()
        .max()
        .ok_or_else(|| {
            PreprocessError::InvalidInput("no timestamp to extend from".to_string())
        })?;
    require(frame, target)?;

    let future: Vec<Option<NaiveDateTime>> = (1..=horizon_hours)
        .map(|h| Some(last + Duration::hours(h as i64)))
        .collect();

    let mut columns = Vec::with_capacity(frame.width());
    for column in frame.get_columns() {
        let name = column.name().as_str();
        let rows = if name == DATE_TIME_COLUMN {
            timestamp_column(name, &future)?
        } else if name == DATE_TIME_STR_COLUMN {
            text_column(
                name,
                future.iter().map(|ts| ts.map(format_date_time)).collect(),
            )
        } else if name == target {
            float_column(name, vec![Some(PLACEHOLDER_TARGET); horizon_hours])
        } else {
            Series::full_null(name.into(), horizon_hours, &DataType::Null).into()
        };
        columns.push(rows.cast(column.dtype())?);
    }

    Ok(frame.vstack(&DataFrame::new(columns)?)?)
}

fn hour_of_day_encoding(ts: NaiveDateTime) -> (f64, f64) {
    let hours = ts.hour() as f64 + ts.minute() as f64 / 60.0;
    let angle = 2.0 * PI * hours / 24.0;
    (angle.sin(), angle.cos())
}

fn validate_config(cfg: &TimeSeriesConfig) -> Result<(), PreprocessError> {
    for (label, values) in [("lags", &cfg.lags), ("rolling_windows", &cfg.rolling_windows)] {
        let mut seen = HashSet::new();
        for value in values {
            if *value == 0 {
                return Err(PreprocessError::InvalidInput(format!(
                    "{label} entries must be > 0"
                )));
            }
            if !seen.insert(*value) {
                return Err(PreprocessError::InvalidInput(format!(
                    "{label} entries must be unique"
                )));
            }
        }
    }
    Ok(())
}
