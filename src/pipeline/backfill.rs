//! One-shot load of the historical CSV into the raw and cleaned groups.

use std::path::Path;

use crate::assemble::create_date_time_feature;
use crate::cleaning::{clean_data, ImputationStrategy, SchemaPolicy};
use polars::prelude::DataFrame;

use crate::frame::{column_names, sort_by_date_time};
use crate::observability::PipelineRun;
use crate::source::read_csv_frame;
use crate::store::FeatureStore;

use super::{clean_group_spec, raw_group_spec, PipelineError, CLEAN_GROUP, RAW_GROUP};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub raw_rows: usize,
    pub clean_rows: usize,
    pub clean_columns: Vec<String>,
}

pub fn run_backfill(
    store: &mut dyn FeatureStore,
    csv_path: &Path,
    version: u32,
) -> Result<BackfillReport, PipelineError> {
    let run = PipelineRun::start("backfill");
    let result = read_csv_frame(csv_path)
        .map_err(PipelineError::from)
        .and_then(|raw| backfill_frame(store, raw, version));
    match &result {
        Ok(report) => run.finish(report.clean_rows),
        Err(err) => run.fail(err),
    }
    result
}

/// Assembles timestamps, stores the raw rows, then discovers the cleaned
/// schema and stores the interpolated rows.
pub fn backfill_frame(
    store: &mut dyn FeatureStore,
    raw: DataFrame,
    version: u32,
) -> Result<BackfillReport, PipelineError> {
    let assembled = sort_by_date_time(&create_date_time_feature(raw)?)?;

    store.get_or_create_feature_group(&raw_group_spec(version))?;
    let raw_rows = store.insert(RAW_GROUP, version, &assembled)?;

    store.get_or_create_feature_group(&clean_group_spec(version))?;
    let cleaned = clean_data(
        &assembled,
        &SchemaPolicy::Discover,
        &ImputationStrategy::default(),
    )?;
    let clean_rows = store.insert(CLEAN_GROUP, version, &cleaned)?;

    Ok(BackfillReport {
        raw_rows,
        clean_rows,
        clean_columns: column_names(&cleaned),
    })
}
