use aq_pred::{
    init_logging, log_app_start, logging_config_from_env, run_online_feature_update,
    PipelineConfig, ReqwestBlockingFetcher, SqliteFeatureStore,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("aq_feature_sync", &logging_cfg);

    let cfg = PipelineConfig::from_env()?;
    let fetcher = ReqwestBlockingFetcher::new(cfg.source.timeout_ms)?;
    let mut store = SqliteFeatureStore::open(&cfg.store_path)?;
    let report =
        run_online_feature_update(&mut store, &fetcher, &cfg.source, cfg.feature_group_version)?;

    println!(
        "Feature sync done | source={} fetched={} raw_rows={} clean_rows={}",
        cfg.source.base_url, report.fetched_rows, report.raw_rows, report.clean_rows
    );
    Ok(())
}
