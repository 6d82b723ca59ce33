use aq_pred::{
    init_logging, log_app_start, logging_config_from_env, run_online_inference, PipelineConfig,
    SqliteFeatureStore, SqliteModelRegistry,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("aq_online_inference", &logging_cfg);

    let cfg = PipelineConfig::from_env()?;
    let mut store = SqliteFeatureStore::open(&cfg.store_path)?;
    let serving = SqliteModelRegistry::open(&cfg.registry_path)?;
    let rows = run_online_inference(&mut store, &serving, cfg.feature_group_version)?;

    println!("Online inference done | predicted_rows={rows}");
    Ok(())
}
