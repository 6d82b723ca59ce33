//! Predicts cleaned rows that have no stored prediction yet.

use std::collections::HashSet;

use polars::prelude::DataFrame;
use tracing::info;

use crate::frame::{
    dedup_sorted_by, filter_rows, require, sort_by_date_time, text_values, DATE_TIME_COLUMN,
    DATE_TIME_STR_COLUMN,
};
use crate::observability::PipelineRun;
use crate::registry::ModelServing;
use crate::store::{FeatureStore, TimeWindow};

use super::{
    prediction_frame, PipelineError, CLEAN_GROUP, ESTIMATOR_DEPLOYMENT, PREDICTED_LABEL_COLUMN,
    PREDICTION_GROUP,
};

pub fn run_online_inference(
    store: &mut dyn FeatureStore,
    serving: &dyn ModelServing,
    version: u32,
) -> Result<usize, PipelineError> {
    let run = PipelineRun::start("online_inference");
    let result = update_predictions(store, serving, version);
    match &result {
        Ok(rows) => run.finish(*rows),
        Err(err) => run.fail(err),
    }
    result
}

/// Returns the number of rows predicted; zero when nothing is pending.
pub fn update_predictions(
    store: &mut dyn FeatureStore,
    serving: &dyn ModelServing,
    version: u32,
) -> Result<usize, PipelineError> {
    store.feature_group(PREDICTION_GROUP, version)?;
    let clean = store.read(CLEAN_GROUP, version, TimeWindow::all())?;
    let predicted = store.read(PREDICTION_GROUP, version, TimeWindow::all())?;

    let pending = pending_rows(&clean, &predicted)?;
    if pending.height() == 0 {
        info!(
            component = "online_inference",
            event = "online_inference.nothing_pending"
        );
        return Ok(0);
    }

    let predictions = serving.predict(ESTIMATOR_DEPLOYMENT, &pending)?;
    let rows = store.insert(
        PREDICTION_GROUP,
        version,
        &prediction_frame(&pending, predictions)?,
    )?;
    Ok(rows)
}

/// Cleaned rows whose key has no non-missing prediction, sorted and
/// deduplicated by `date_time`.
pub fn pending_rows(
    clean: &DataFrame,
    predicted: &DataFrame,
) -> Result<DataFrame, PipelineError> {
    let done: HashSet<String> = if predicted.height() == 0 {
        HashSet::new()
    } else {
        let keys = text_values(predicted, DATE_TIME_STR_COLUMN)?;
        let values = require(predicted, PREDICTED_LABEL_COLUMN)?.is_not_null();
        keys.into_iter()
            .zip(values.into_iter())
            .filter(|(_, present)| *present == Some(true))
            .filter_map(|(key, _)| key)
            .collect()
    };

    if clean.height() == 0 {
        return Ok(clean.clone());
    }
    let keep: Vec<bool> = text_values(clean, DATE_TIME_STR_COLUMN)?
        .into_iter()
        .map(|key| key.map_or(true, |k| !done.contains(&k)))
        .collect();
    let pending = sort_by_date_time(&filter_rows(clean, &keep)?)?;
    Ok(dedup_sorted_by(&pending, DATE_TIME_COLUMN)?)
}
