use std::sync::Arc;

use aq_pred::{
    dashboard_router, init_logging, log_app_bind, log_app_start, logging_config_from_env,
    DashboardConfig, PredictionSource, StorePredictionSource,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("dashboard_server", &logging_cfg);

    let cfg = DashboardConfig::from_env()?;
    let source: Arc<dyn PredictionSource> = Arc::new(StorePredictionSource::open(
        &cfg.store_path,
        cfg.prediction_version,
    )?);
    let app = dashboard_router(source);
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
