use aq_pred::{
    init_logging, log_app_start, logging_config_from_env, run_training, PipelineConfig,
    SqliteFeatureStore, SqliteModelRegistry, TrainingOptions, METRIC_TEST_MSE,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("aq_train", &logging_cfg);

    let cfg = PipelineConfig::from_env()?;
    let mut store = SqliteFeatureStore::open(&cfg.store_path)?;
    let mut registry = SqliteModelRegistry::open(&cfg.registry_path)?;
    let opts = TrainingOptions::new(
        cfg.feature_group_version,
        cfg.feature_view_version,
        cfg.training_dataset_version,
    );
    let report = run_training(&mut store, &mut registry, &cfg.model_dir, &opts)?;

    for model in [&report.estimation_model, &report.time_series_model] {
        println!(
            "Registered {} v{} | test_mse={:.4}",
            model.name,
            model.version,
            model.metrics.get(METRIC_TEST_MSE).copied().unwrap_or(f64::NAN)
        );
    }
    println!(
        "Training done | train_rows={} test_rows={}",
        report.train_rows, report.test_rows
    );
    Ok(())
}
