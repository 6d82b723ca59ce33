use aq_pred::{
    init_logging, log_app_start, logging_config_from_env, run_backfill, PipelineConfig,
    SqliteFeatureStore,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("aq_backfill", &logging_cfg);

    let cfg = PipelineConfig::from_env()?;
    let mut store = SqliteFeatureStore::open(&cfg.store_path)?;
    let report = run_backfill(&mut store, &cfg.backfill_csv, cfg.feature_group_version)?;

    println!(
        "Backfill done | csv={} raw_rows={} clean_rows={} clean_columns={}",
        cfg.backfill_csv.display(),
        report.raw_rows,
        report.clean_rows,
        report.clean_columns.join(",")
    );
    Ok(())
}
