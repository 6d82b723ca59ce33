//! Missing-data filtering and imputation of assembled feature frames.

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::frame::{
    date_time_dtype, require, sort_by_date_time, total_null_count, FeatureSpec, FeatureType,
    PreprocessError,
};
use crate::iterative::{impute_iterative, IterativeImputerConfig};

pub const MISSING_RATIO_DROP_THRESHOLD_PCT: f64 = 50.0;

/// How the output column set is decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaPolicy {
    /// No schema yet: drop columns that are mostly missing.
    Discover,
    /// Select exactly these columns, in this order.
    ConformTo(Vec<FeatureSpec>),
}

/// What to do with missing values before the first observation of a column.
///
/// A column with no observation at all is one leading gap: `Backfill` has
/// nothing to copy from and fails like `Fail`, `Keep` leaves it missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EdgeGapPolicy {
    #[default]
    Backfill,
    Keep,
    Fail,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImputationStrategy {
    Interpolate(EdgeGapPolicy),
    Iterative(IterativeImputerConfig),
}

impl Default for ImputationStrategy {
    fn default() -> Self {
        Self::Interpolate(EdgeGapPolicy::default())
    }
}

/// Drops every column whose missing percentage is strictly above 50.
pub fn remove_nan_features(frame: &DataFrame) -> Result<DataFrame, PreprocessError> {
    if frame.height() == 0 {
        return Ok(frame.clone());
    }

    let null_counts = frame
        .clone()
        .lazy()
        .select([all().null_count()])
        .collect()?;

    let height = frame.height() as f64;
    let mut kept = Vec::with_capacity(frame.width());
    for name in frame.get_column_names() {
        let nulls = null_counts
            .column(name)?
            .cast(&DataType::UInt64)?
            .u64()?
            .get(0)
            .unwrap_or(0);
        let missing_pct = nulls as f64 / height * 100.0;
        if missing_pct > MISSING_RATIO_DROP_THRESHOLD_PCT {
            debug!(
                component = "cleaning",
                event = "cleaning.filter.column_dropped",
                column = %name,
                missing_pct
            );
        } else {
            kept.push(name.clone());
        }
    }

    Ok(frame.select(kept)?)
}

/// Selects exactly the declared columns in declared order.
pub fn conform_to_schema(
    frame: &DataFrame,
    schema: &[FeatureSpec],
) -> Result<DataFrame, PreprocessError> {
    for spec in schema {
        require(frame, &spec.name)?;
    }
    Ok(frame.select(schema.iter().map(|spec| spec.name.as_str()))?)
}

pub fn filter_features(
    frame: &DataFrame,
    policy: &SchemaPolicy,
) -> Result<DataFrame, PreprocessError> {
    match policy {
        SchemaPolicy::Discover => remove_nan_features(frame),
        SchemaPolicy::ConformTo(schema) => conform_to_schema(frame, schema),
    }
}

/// Filter, impute and sort a frame by `date_time`.
pub fn clean_data(
    frame: &DataFrame,
    policy: &SchemaPolicy,
    strategy: &ImputationStrategy,
) -> Result<DataFrame, PreprocessError> {
    let filtered = filter_features(frame, policy)?;
    let sorted = sort_by_date_time(&filtered)?;

    let cleaned = match strategy {
        ImputationStrategy::Interpolate(edge) => interpolate(&sorted, *edge)?,
        ImputationStrategy::Iterative(cfg) => impute_iterative(&sorted, cfg)?,
    };

    info!(
        component = "cleaning",
        event = "cleaning.clean.finish",
        rows = cleaned.height(),
        input_columns = frame.width(),
        output_columns = cleaned.width(),
        residual_nulls = total_null_count(&cleaned),
        conform = matches!(policy, SchemaPolicy::ConformTo(_))
    );

    Ok(cleaned)
}

/// Linear interpolation along row order for numeric and timestamp columns.
///
/// Interior gaps are filled linearly, trailing gaps repeat the last observed
/// value and leading gaps follow `edge`. Integer columns with gaps come back
/// as floats. Text columns are left untouched.
pub fn interpolate(frame: &DataFrame, edge: EdgeGapPolicy) -> Result<DataFrame, PreprocessError> {
    let mut fills = Vec::new();
    for column in frame.get_columns() {
        let name = column.name().as_str();
        let feature_type = FeatureType::of(column.dtype());
        if feature_type == FeatureType::String || column.null_count() == 0 {
            continue;
        }

        let leading = column
            .is_not_null()
            .into_iter()
            .position(|present| present == Some(true))
            .unwrap_or(column.len());
        if leading == column.len() && edge != EdgeGapPolicy::Keep {
            return Err(PreprocessError::Imputation(format!(
                "column '{name}' has no observed value to fill from"
            )));
        }
        if leading > 0 && edge == EdgeGapPolicy::Fail {
            return Err(PreprocessError::Imputation(format!(
                "column '{name}' has {leading} missing values before its first observation"
            )));
        }

        let physical = match feature_type {
            FeatureType::Timestamp => col(name).cast(DataType::Int64).cast(DataType::Float64),
            _ => col(name).cast(DataType::Float64),
        };
        let mut filled = physical
            .interpolate(InterpolationMethod::Linear)
            .forward_fill(None);
        if edge == EdgeGapPolicy::Backfill {
            filled = filled.backward_fill(None);
        }
        if feature_type == FeatureType::Timestamp {
            filled = filled.cast(DataType::Int64).cast(date_time_dtype());
        }
        fills.push(filled.alias(name));
    }

    if fills.is_empty() {
        return Ok(frame.clone());
    }
    Ok(frame.clone().lazy().with_columns(fills).collect()?)
}
