//! Incremental ingestion from the rowstore API into the raw and cleaned
//! groups.

use polars::prelude::DataFrame;
use tracing::info;

use crate::assemble::{create_date_time_feature, normalize_column_names, DATE_COLUMN, TIME_COLUMN};
use crate::cleaning::{clean_data, ImputationStrategy, SchemaPolicy};
use crate::coercion::set_feature_type;
use crate::frame::{
    filter_date_time, float_values, int_column, null_column, require, sort_by_date_time,
    timestamps, FeatureSpec, FeatureType, PreprocessError, DATE_TIME_COLUMN,
    DATE_TIME_STR_COLUMN,
};
use crate::observability::PipelineRun;
use crate::source::{fetch_frame, HttpFetcher, HttpSourceConfig};
use crate::store::{FeatureStore, TimeWindow};

use super::{PipelineError, CLEAN_GROUP, RAW_GROUP};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OnlineFeatureReport {
    pub fetched_rows: usize,
    pub raw_rows: usize,
    pub clean_rows: usize,
}

pub fn run_online_feature_update(
    store: &mut dyn FeatureStore,
    fetcher: &dyn HttpFetcher,
    source: &HttpSourceConfig,
    version: u32,
) -> Result<OnlineFeatureReport, PipelineError> {
    let run = PipelineRun::start("online_feature");
    let result = fetch_frame(fetcher, source)
        .map_err(PipelineError::from)
        .and_then(|fetched| update_feature_groups(store, fetched, version));
    match &result {
        Ok(report) => run.finish(report.clean_rows),
        Err(err) => run.fail(err),
    }
    result
}

/// Types the fetched rows by the raw group's schema, inserts them, and
/// re-cleans the raw history so interpolation sees the neighbours of every
/// new row. Only cleaned rows at or after the earliest fetched timestamp
/// are written back.
pub fn update_feature_groups(
    store: &mut dyn FeatureStore,
    mut fetched: DataFrame,
    version: u32,
) -> Result<OnlineFeatureReport, PipelineError> {
    if fetched.height() == 0 {
        info!(
            component = "online_feature",
            event = "online_feature.empty_fetch"
        );
        return Ok(OnlineFeatureReport::default());
    }
    normalize_column_names(&mut fetched)?;

    let raw_schema = stored_schema(store, RAW_GROUP, version)?;
    let typed = type_by_schema(&fetched, &raw_schema)?;
    let assembled = sort_by_date_time(&create_date_time_feature(typed)?)?;
    let raw_rows = store.insert(RAW_GROUP, version, &assembled)?;

    let Some(insert_start) = timestamps(&assembled, DATE_TIME_COLUMN)?
        .into_iter()
        .flatten()
        .min()
    else {
        return Ok(OnlineFeatureReport {
            fetched_rows: fetched.height(),
            raw_rows,
            clean_rows: 0,
        });
    };

    let history = store.read(RAW_GROUP, version, TimeWindow::all())?;
    let clean_schema = stored_schema(store, CLEAN_GROUP, version)?;
    let cleaned = clean_data(
        &history,
        &SchemaPolicy::ConformTo(clean_schema.clone()),
        &ImputationStrategy::default(),
    )?;
    let cleaned = restore_integer_columns(cleaned, &clean_schema)?;

    let fresh = filter_date_time(&cleaned, Some(insert_start), None)?;
    let clean_rows = store.insert(CLEAN_GROUP, version, &fresh)?;

    Ok(OnlineFeatureReport {
        fetched_rows: fetched.height(),
        raw_rows,
        clean_rows,
    })
}

fn stored_schema(
    store: &dyn FeatureStore,
    group: &str,
    version: u32,
) -> Result<Vec<FeatureSpec>, PipelineError> {
    store
        .feature_group(group, version)?
        .schema
        .ok_or_else(|| PipelineError::EmptyGroup(group.to_string()))
}

/// Casts every declared feature present in `fetched` to its declared type
/// and adds declared features the API did not return as typed missing
/// columns. Undeclared columns are dropped; `date`/`time` are kept for
/// assembly.
fn type_by_schema(
    fetched: &DataFrame,
    schema: &[FeatureSpec],
) -> Result<DataFrame, PipelineError> {
    let mut columns = Vec::with_capacity(schema.len() + 2);
    let mut absent = Vec::new();
    for spec in schema {
        if spec.name == DATE_TIME_COLUMN || spec.name == DATE_TIME_STR_COLUMN {
            continue;
        }
        if fetched.column(&spec.name).is_ok() {
            columns.push(set_feature_type(fetched, &spec.name, spec.type_tag())?);
        } else {
            absent.push(spec.name.as_str());
            columns.push(null_column(&spec.name, spec.feature_type, fetched.height()));
        }
    }
    columns.push(require(fetched, DATE_COLUMN)?.clone());
    columns.push(require(fetched, TIME_COLUMN)?.clone());

    if !absent.is_empty() {
        info!(
            component = "online_feature",
            event = "online_feature.absent_features",
            features = ?absent
        );
    }
    Ok(DataFrame::new(columns).map_err(PreprocessError::from)?)
}

/// Interpolation turns integer columns into floats; round them back where
/// the cleaned group declares `bigint`.
fn restore_integer_columns(
    mut frame: DataFrame,
    schema: &[FeatureSpec],
) -> Result<DataFrame, PipelineError> {
    for spec in schema.iter().filter(|s| s.feature_type == FeatureType::Bigint) {
        let column = require(&frame, &spec.name)?;
        if FeatureType::of(column.dtype()) != FeatureType::Double {
            continue;
        }
        let rounded = float_values(&frame, &spec.name)?
            .into_iter()
            .map(|v| v.map(|x| x.round() as i64))
            .collect();
        frame
            .with_column(int_column(&spec.name, rounded))
            .map_err(PreprocessError::from)?;
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{column_names, float_column, text_column};
    use polars::prelude::DataType;

    #[test]
    fn absent_features_become_typed_missing_columns() {
        let fetched = DataFrame::new(vec![
            text_column("date", vec![Some("2023-10-09")]),
            text_column("time", vec![Some("01:00")]),
            text_column("femman_pm25", vec![Some("3.5")]),
            text_column("extra", vec![Some("x")]),
        ])
        .unwrap();
        let schema = vec![
            FeatureSpec::new("femman_pm25", FeatureType::Double),
            FeatureSpec::new("station_count", FeatureType::Bigint),
            FeatureSpec::new(DATE_TIME_COLUMN, FeatureType::Timestamp),
        ];

        let typed = type_by_schema(&fetched, &schema).unwrap();
        assert_eq!(
            column_names(&typed),
            vec!["femman_pm25", "station_count", "date", "time"]
        );
        assert_eq!(float_values(&typed, "femman_pm25").unwrap(), vec![Some(3.5)]);
        let counts = typed.column("station_count").unwrap();
        assert_eq!(counts.dtype(), &DataType::Int64);
        assert_eq!(counts.null_count(), 1);
    }

    #[test]
    fn interpolated_integers_are_rounded_back() {
        let frame = DataFrame::new(vec![float_column("n", vec![Some(1.5), Some(2.0)])]).unwrap();
        let schema = vec![FeatureSpec::new("n", FeatureType::Bigint)];
        let out = restore_integer_columns(frame, &schema).unwrap();
        let ints: Vec<Option<i64>> = out.column("n").unwrap().i64().unwrap().into_iter().collect();
        assert_eq!(ints, vec![Some(2), Some(2)]);
    }
}
