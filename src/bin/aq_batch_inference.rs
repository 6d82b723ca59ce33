use aq_pred::{
    init_logging, log_app_start, logging_config_from_env, run_batch_inference, PipelineConfig,
    SqliteFeatureStore, SqliteModelRegistry,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("aq_batch_inference", &logging_cfg);

    let cfg = PipelineConfig::from_env()?;
    let mut store = SqliteFeatureStore::open(&cfg.store_path)?;
    let registry = SqliteModelRegistry::open(&cfg.registry_path)?;
    let rows = run_batch_inference(&mut store, &registry, cfg.feature_group_version)?;

    println!("Batch inference done | predicted_rows={rows}");
    Ok(())
}
