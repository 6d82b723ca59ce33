//! Predicts every cleaned row with the best estimation model.

use crate::frame::sort_by_date_time;
use crate::observability::PipelineRun;
use crate::registry::{MetricDirection, ModelRegistry, METRIC_TEST_MSE};
use crate::store::{FeatureStore, FeatureViewSpec, TimeWindow};

use super::{
    prediction_frame, prediction_group_spec, PipelineError, CLEAN_GROUP, ESTIMATION_MODEL,
    PREDICTION_GROUP, PREDICTION_VIEW,
};

pub fn run_batch_inference(
    store: &mut dyn FeatureStore,
    registry: &dyn ModelRegistry,
    version: u32,
) -> Result<usize, PipelineError> {
    let run = PipelineRun::start("batch_inference");
    let result = batch_predict(store, registry, version);
    match &result {
        Ok(rows) => run.finish(*rows),
        Err(err) => run.fail(err),
    }
    result
}

pub fn batch_predict(
    store: &mut dyn FeatureStore,
    registry: &dyn ModelRegistry,
    version: u32,
) -> Result<usize, PipelineError> {
    store.get_or_create_feature_group(&prediction_group_spec(version))?;

    let clean = store.read(CLEAN_GROUP, version, TimeWindow::all())?;
    if clean.height() == 0 {
        return Err(PipelineError::EmptyGroup(CLEAN_GROUP.to_string()));
    }
    let clean = sort_by_date_time(&clean)?;

    let best = registry.best_model(ESTIMATION_MODEL, METRIC_TEST_MSE, MetricDirection::Min)?;
    let predictions = best.artifact.predict_frame(&clean)?;
    let rows = store.insert(
        PREDICTION_GROUP,
        version,
        &prediction_frame(&clean, predictions)?,
    )?;

    store.get_or_create_feature_view(&prediction_view_spec(version))?;
    Ok(rows)
}

pub fn prediction_view_spec(version: u32) -> FeatureViewSpec {
    FeatureViewSpec {
        name: PREDICTION_VIEW.to_string(),
        version,
        description: "Predicted and observed PM2.5".to_string(),
        source_group: PREDICTION_GROUP.to_string(),
        source_version: version,
        labels: Vec::new(),
        scaled_columns: Vec::new(),
    }
}
