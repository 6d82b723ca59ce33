//! Feature frames are polars [`DataFrame`]s. This module holds the declared
//! feature types, the preprocessing error and the typed accessors the
//! cleaning steps, the store and the pipelines share.
//!
//! Missing cells are nulls. Float columns built here never carry NaN.

use chrono::{DateTime, NaiveDateTime};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DATE_TIME_COLUMN: &str = "date_time";
pub const DATE_TIME_STR_COLUMN: &str = "date_time_str";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreprocessError {
    #[error("invalid timestamp '{value}': {reason}")]
    Format { value: String, reason: String },
    #[error("column '{column}' not found in frame")]
    MissingColumn { column: String },
    #[error("cannot cast value '{value}' in column '{column}' to {target}")]
    Coercion {
        column: String,
        target: &'static str,
        value: String,
    },
    #[error("imputation failed: {0}")]
    Imputation(String),
    #[error("column '{column}' has {actual} rows, frame has {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("column '{column}' has kind {actual}, expected {expected}")]
    KindMismatch {
        column: String,
        expected: &'static str,
        actual: String,
    },
    #[error("frame operation failed: {0}")]
    Frame(String),
}

impl PreprocessError {
    pub fn missing_column(column: impl Into<String>) -> Self {
        Self::MissingColumn {
            column: column.into(),
        }
    }
}

impl From<PolarsError> for PreprocessError {
    fn from(err: PolarsError) -> Self {
        match err {
            PolarsError::ColumnNotFound(name) => Self::missing_column(name.to_string()),
            other => Self::Frame(other.to_string()),
        }
    }
}

/// Declared feature type of a stored column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureType {
    Double,
    Bigint,
    String,
    Timestamp,
}

impl FeatureType {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "double" => Self::Double,
            "bigint" => Self::Bigint,
            "timestamp" => Self::Timestamp,
            _ => Self::String,
        }
    }

    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Double => "double",
            Self::Bigint => "bigint",
            Self::String => "string",
            Self::Timestamp => "timestamp",
        }
    }

    /// Column dtype a feature of this type is stored as.
    pub fn dtype(self) -> DataType {
        match self {
            Self::Double => DataType::Float64,
            Self::Bigint => DataType::Int64,
            Self::String => DataType::String,
            Self::Timestamp => date_time_dtype(),
        }
    }

    /// Feature type of a column dtype. Anything that is not numeric or a
    /// datetime is treated as text.
    pub fn of(dtype: &DataType) -> Self {
        match dtype {
            DataType::Float32 | DataType::Float64 => Self::Double,
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => Self::Bigint,
            DataType::Datetime(_, _) => Self::Timestamp,
            _ => Self::String,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Double | Self::Bigint)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub name: String,
    pub feature_type: FeatureType,
}

impl FeatureSpec {
    pub fn new(name: impl Into<String>, feature_type: FeatureType) -> Self {
        Self {
            name: name.into(),
            feature_type,
        }
    }

    pub fn type_tag(&self) -> &'static str {
        self.feature_type.as_tag()
    }
}

/// Millisecond, zone-less datetime used for every timestamp column.
pub fn date_time_dtype() -> DataType {
    DataType::Datetime(TimeUnit::Milliseconds, None)
}

pub fn schema_of(frame: &DataFrame) -> Vec<FeatureSpec> {
    frame
        .get_columns()
        .iter()
        .map(|c| FeatureSpec::new(c.name().to_string(), FeatureType::of(c.dtype())))
        .collect()
}

pub fn column_names(frame: &DataFrame) -> Vec<String> {
    frame
        .get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect()
}

pub fn require<'a>(frame: &'a DataFrame, name: &str) -> Result<&'a Column, PreprocessError> {
    frame
        .column(name)
        .map_err(|_| PreprocessError::missing_column(name))
}

/// Float column; NaN cells are stored as null.
pub fn float_column(name: &str, values: Vec<Option<f64>>) -> Column {
    let values: Vec<Option<f64>> = values
        .into_iter()
        .map(|v| v.filter(|x| !x.is_nan()))
        .collect();
    Column::new(name.into(), values)
}

pub fn int_column(name: &str, values: Vec<Option<i64>>) -> Column {
    Column::new(name.into(), values)
}

pub fn text_column<S: Into<String>>(name: &str, values: Vec<Option<S>>) -> Column {
    let values: Vec<Option<String>> = values.into_iter().map(|v| v.map(Into::into)).collect();
    Column::new(name.into(), values)
}

pub fn timestamp_column(
    name: &str,
    values: &[Option<NaiveDateTime>],
) -> Result<Column, PreprocessError> {
    let millis: Vec<Option<i64>> = values
        .iter()
        .map(|v| v.map(|ts| ts.and_utc().timestamp_millis()))
        .collect();
    Ok(Series::new(name.into(), millis)
        .cast(&date_time_dtype())?
        .into())
}

/// All-null column of the given declared type.
pub fn null_column(name: &str, feature_type: FeatureType, len: usize) -> Column {
    Series::full_null(name.into(), len, &feature_type.dtype()).into()
}

/// Timestamps of a datetime column, decoded at millisecond precision.
pub fn timestamps(
    frame: &DataFrame,
    name: &str,
) -> Result<Vec<Option<NaiveDateTime>>, PreprocessError> {
    let column = require(frame, name)?;
    if !matches!(column.dtype(), DataType::Datetime(_, _)) {
        return Err(kind_mismatch(column, "timestamp"));
    }
    let millis = column.cast(&date_time_dtype())?.cast(&DataType::Int64)?;
    Ok(millis
        .i64()?
        .into_iter()
        .map(|ms| ms.and_then(DateTime::from_timestamp_millis).map(|dt| dt.naive_utc()))
        .collect())
}

/// Values of a numeric column as floats.
pub fn float_values(frame: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, PreprocessError> {
    let column = require(frame, name)?;
    if !FeatureType::of(column.dtype()).is_numeric() {
        return Err(kind_mismatch(column, "float"));
    }
    let floats = column.cast(&DataType::Float64)?;
    Ok(floats
        .f64()?
        .into_iter()
        .map(|v| v.filter(|x| !x.is_nan()))
        .collect())
}

/// Display form of every cell: text as is, numbers in their shortest form,
/// timestamps as `YYYY-MM-DD HH:MM:SS`.
pub fn text_values(frame: &DataFrame, name: &str) -> Result<Vec<Option<String>>, PreprocessError> {
    let column = require(frame, name)?;
    Ok(match FeatureType::of(column.dtype()) {
        FeatureType::String => column
            .str()?
            .into_iter()
            .map(|v| v.map(str::to_string))
            .collect(),
        FeatureType::Timestamp => timestamps(frame, name)?
            .into_iter()
            .map(|v| v.map(|ts| ts.to_string()))
            .collect(),
        FeatureType::Double => float_values(frame, name)?
            .into_iter()
            .map(|v| v.map(|x| x.to_string()))
            .collect(),
        FeatureType::Bigint => column
            .cast(&DataType::Int64)?
            .i64()?
            .into_iter()
            .map(|v| v.map(|x| x.to_string()))
            .collect(),
    })
}

/// Numeric row-major matrix over `names`; missing cells are `None`.
pub fn numeric_rows(
    frame: &DataFrame,
    names: &[&str],
) -> Result<Vec<Vec<Option<f64>>>, PreprocessError> {
    let columns = names
        .iter()
        .map(|name| float_values(frame, name))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((0..frame.height())
        .map(|row| columns.iter().map(|values| values[row]).collect())
        .collect())
}

pub fn total_null_count(frame: &DataFrame) -> usize {
    frame.get_columns().iter().map(Column::null_count).sum()
}

/// Stable ascending sort on one column, nulls last.
pub fn sort_by(frame: &DataFrame, name: &str) -> Result<DataFrame, PreprocessError> {
    require(frame, name)?;
    Ok(frame.sort(
        [name],
        SortMultipleOptions::new()
            .with_maintain_order(true)
            .with_nulls_last(true),
    )?)
}

pub fn sort_by_date_time(frame: &DataFrame) -> Result<DataFrame, PreprocessError> {
    sort_by(frame, DATE_TIME_COLUMN)
}

/// Keeps the first row of every run of equal values in a sorted column.
pub fn dedup_sorted_by(frame: &DataFrame, name: &str) -> Result<DataFrame, PreprocessError> {
    let keys = text_values(frame, name)?;
    let keep: Vec<bool> = (0..keys.len())
        .map(|idx| idx == 0 || keys[idx - 1] != keys[idx])
        .collect();
    filter_rows(frame, &keep)
}

pub fn filter_rows(frame: &DataFrame, keep: &[bool]) -> Result<DataFrame, PreprocessError> {
    if keep.len() != frame.height() {
        return Err(PreprocessError::LengthMismatch {
            column: "row mask".to_string(),
            expected: frame.height(),
            actual: keep.len(),
        });
    }
    Ok(frame.filter(&BooleanChunked::from_slice("keep".into(), keep))?)
}

/// Rows whose `date_time` lies in `[start, end)`; `None` leaves a side open.
pub fn filter_date_time(
    frame: &DataFrame,
    start: Option<NaiveDateTime>,
    end: Option<NaiveDateTime>,
) -> Result<DataFrame, PreprocessError> {
    let column = require(frame, DATE_TIME_COLUMN)?;
    if !matches!(column.dtype(), DataType::Datetime(_, _)) {
        return Err(kind_mismatch(column, "timestamp"));
    }
    let millis = || col(DATE_TIME_COLUMN).cast(DataType::Int64);
    let mut predicate = col(DATE_TIME_COLUMN).is_not_null();
    if let Some(start) = start {
        predicate = predicate.and(millis().gt_eq(lit(start.and_utc().timestamp_millis())));
    }
    if let Some(end) = end {
        predicate = predicate.and(millis().lt(lit(end.and_utc().timestamp_millis())));
    }
    Ok(frame.clone().lazy().filter(predicate).collect()?)
}

fn kind_mismatch(column: &Column, expected: &'static str) -> PreprocessError {
    PreprocessError::KindMismatch {
        column: column.name().to_string(),
        expected,
        actual: column.dtype().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn hour(h: u32) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(2023, 10, 9)
            .unwrap()
            .and_hms_opt(h, 0, 0)
    }

    fn sample() -> DataFrame {
        DataFrame::new(vec![
            float_column("b", vec![Some(2.0), None, Some(1.0)]),
            int_column("key", vec![Some(3), Some(1), Some(2)]),
            text_column("label", vec![Some("c"), Some("a"), None]),
        ])
        .unwrap()
    }

    #[test]
    fn ragged_columns_are_rejected_by_the_frame() {
        let err = DataFrame::new(vec![
            float_column("a", vec![Some(1.0)]),
            float_column("b", vec![Some(1.0), Some(2.0)]),
        ])
        .unwrap_err();
        assert!(matches!(PreprocessError::from(err), PreprocessError::Frame(_)));
    }

    #[test]
    fn sort_places_missing_keys_last() {
        let frame = sort_by(&sample(), "b").unwrap();
        let keys: Vec<Option<i64>> = frame.column("key").unwrap().i64().unwrap().into_iter().collect();
        assert_eq!(keys, vec![Some(2), Some(3), Some(1)]);
    }

    #[test]
    fn nan_is_stored_as_null() {
        let column = float_column("x", vec![Some(f64::NAN), Some(1.0)]);
        assert_eq!(column.null_count(), 1);
        assert_eq!(total_null_count(&sample()), 2);
    }

    #[test]
    fn schema_maps_dtypes_to_feature_types() {
        let mut frame = sample();
        frame
            .with_column(timestamp_column(DATE_TIME_COLUMN, &[hour(0), hour(1), None]).unwrap())
            .unwrap();
        let types: Vec<FeatureType> = schema_of(&frame).iter().map(|s| s.feature_type).collect();
        assert_eq!(
            types,
            vec![
                FeatureType::Double,
                FeatureType::Bigint,
                FeatureType::String,
                FeatureType::Timestamp
            ]
        );
        assert_eq!(timestamps(&frame, DATE_TIME_COLUMN).unwrap()[1], hour(1));
    }

    #[test]
    fn dedup_keeps_first_of_each_run() {
        let frame = DataFrame::new(vec![
            int_column("k", vec![Some(1), Some(1), Some(2)]),
            float_column("v", vec![Some(1.0), Some(2.0), Some(3.0)]),
        ])
        .unwrap();
        let deduped = dedup_sorted_by(&frame, "k").unwrap();
        assert_eq!(deduped.height(), 2);
        assert_eq!(float_values(&deduped, "v").unwrap(), vec![Some(1.0), Some(3.0)]);
    }

    #[test]
    fn date_time_window_is_half_open() {
        let frame = DataFrame::new(vec![
            timestamp_column(DATE_TIME_COLUMN, &[hour(0), hour(1), hour(2), None]).unwrap(),
            float_column("v", vec![Some(0.0), Some(1.0), Some(2.0), Some(3.0)]),
        ])
        .unwrap();
        let window = filter_date_time(&frame, hour(1), hour(2)).unwrap();
        assert_eq!(float_values(&window, "v").unwrap(), vec![Some(1.0)]);
        assert_eq!(filter_date_time(&frame, None, None).unwrap().height(), 3);
    }

    #[test]
    fn text_column_is_not_a_float_source() {
        assert!(matches!(
            float_values(&sample(), "label").unwrap_err(),
            PreprocessError::KindMismatch { expected: "float", .. }
        ));
        assert_eq!(
            require(&sample(), "nope").unwrap_err(),
            PreprocessError::missing_column("nope")
        );
    }
}
