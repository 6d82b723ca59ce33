use aq_pred::{
    init_logging, log_app_start, logging_config_from_env, run_deployment, PipelineConfig,
    SqliteModelRegistry,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("aq_deploy", &logging_cfg);

    let cfg = PipelineConfig::from_env()?;
    let mut registry = SqliteModelRegistry::open(&cfg.registry_path)?;
    for deployment in run_deployment(&mut registry)? {
        println!(
            "Deployment {} | model={} v{} state={:?}",
            deployment.name, deployment.model_name, deployment.model_version, deployment.state
        );
    }
    Ok(())
}
