use std::io;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex};

use aq_pred::{
    dashboard_router, log_app_bind, log_app_start, run_backfill, InMemoryPredictionSource,
    LoggingConfig, PipelineError, SqliteFeatureStore,
};
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use tower::util::ServiceExt;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

#[test]
fn failed_backfill_logs_pipeline_start_and_error() {
    let logs = capture_logs(Level::INFO, || {
        let mut store = SqliteFeatureStore::open_in_memory().expect("in-memory store opens");
        let err = run_backfill(&mut store, Path::new("does/not/exist.csv"), 1)
            .expect_err("missing csv should fail");
        assert!(matches!(err, PipelineError::Source(_)));
    });

    assert!(logs.contains("\"event\":\"pipeline.backfill.start\""));
    assert!(logs.contains("\"event\":\"pipeline.backfill.error\""));
    assert!(logs.contains("\"pipeline\":\"backfill\""));
    assert!(!logs.contains("\"event\":\"pipeline.backfill.finish\""));
}

#[test]
fn server_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        let cfg = LoggingConfig::default();
        log_app_start("dashboard_server", &cfg);
        log_app_bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"component\":\"dashboard_server\""));
    assert!(logs.contains("\"event\":\"app.bind\""));
}

#[test]
fn predictions_route_emits_http_event() {
    let logs = capture_logs(Level::INFO, || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("single-thread runtime should build");

        rt.block_on(async {
            let app = dashboard_router(Arc::new(InMemoryPredictionSource::default()));
            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/dashboard/predictions?period=1w")
                        .body(Body::empty())
                        .expect("request should build"),
                )
                .await
                .expect("predictions request should succeed");

            assert_eq!(response.status(), StatusCode::OK);
        });
    });

    assert!(logs.contains("\"event\":\"http.predictions.request\""));
    assert!(logs.contains("\"period\":\"1w\""));
}
