//! Deploys the best registered version of each model and starts it.

use tracing::info;

use crate::observability::PipelineRun;
use crate::registry::{Deployment, MetricDirection, ModelRegistry, ModelServing, METRIC_TEST_MSE};

use super::{
    PipelineError, ESTIMATION_MODEL, ESTIMATOR_DEPLOYMENT, TIME_SERIES_DEPLOYMENT,
    TIME_SERIES_MODEL,
};

pub const DEPLOYMENTS: [(&str, &str); 2] = [
    (ESTIMATION_MODEL, ESTIMATOR_DEPLOYMENT),
    (TIME_SERIES_MODEL, TIME_SERIES_DEPLOYMENT),
];

pub fn run_deployment<R>(registry: &mut R) -> Result<Vec<Deployment>, PipelineError>
where
    R: ModelRegistry + ModelServing + ?Sized,
{
    let run = PipelineRun::start("deployment");
    let result = deploy_best_models(registry);
    match &result {
        Ok(deployments) => run.finish(deployments.len()),
        Err(err) => run.fail(err),
    }
    result
}

pub fn deploy_best_models<R>(registry: &mut R) -> Result<Vec<Deployment>, PipelineError>
where
    R: ModelRegistry + ModelServing + ?Sized,
{
    let mut deployed = Vec::with_capacity(DEPLOYMENTS.len());
    for (model_name, deployment_name) in DEPLOYMENTS {
        let best = registry.best_model(model_name, METRIC_TEST_MSE, MetricDirection::Min)?;
        registry.deploy(deployment_name, &best)?;
        let started = registry.start(deployment_name)?;
        info!(
            component = "deployment",
            event = "deployment.started",
            deployment = %deployment_name,
            model = %best.name,
            version = best.version,
            test_mse = best.metrics.get(METRIC_TEST_MSE).copied().unwrap_or(f64::NAN)
        );
        deployed.push(started);
    }
    Ok(deployed)
}
