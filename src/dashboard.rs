//! Prediction dashboard: a scatter of observed vs predicted PM2.5 over a
//! selectable period, plus the same points as JSON.

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Duration, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use polars::prelude::DataFrame;

use crate::frame::{float_values, text_values, timestamps, DATE_TIME_COLUMN, DATE_TIME_STR_COLUMN};
use crate::pipeline::{LABEL_COLUMN, PREDICTED_LABEL_COLUMN, PREDICTION_VIEW};
use crate::store::{FeatureStore, SqliteFeatureStore, StoreError, TimeWindow};

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("prediction source is unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EstimationPeriod {
    #[default]
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "1w")]
    Week,
    #[serde(rename = "1m")]
    Month,
}

impl EstimationPeriod {
    pub const ALL: [Self; 3] = [Self::Day, Self::Week, Self::Month];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "24h" | "24 hours" => Some(Self::Day),
            "1w" | "1 week" => Some(Self::Week),
            "1m" | "1 month" => Some(Self::Month),
            _ => None,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::Day => "24h",
            Self::Week => "1w",
            Self::Month => "1m",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Day => "24 hours",
            Self::Week => "1 Week",
            Self::Month => "1 Month",
        }
    }

    pub fn span(self) -> Duration {
        match self {
            Self::Day => Duration::days(1),
            Self::Week => Duration::days(7),
            Self::Month => Duration::days(30),
        }
    }

    /// `[now - span, now)`.
    pub fn window(self, now: NaiveDateTime) -> TimeWindow {
        TimeWindow::between(now - self.span(), now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionPoint {
    pub date_time: NaiveDateTime,
    pub date_time_str: String,
    pub actual: Option<f64>,
    pub predicted: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSeries {
    pub period: EstimationPeriod,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub points: Vec<PredictionPoint>,
}

pub trait PredictionSource: Send + Sync + 'static {
    fn predictions(&self, window: TimeWindow) -> Result<Vec<PredictionPoint>, DashboardError>;
}

/// Fixed points, filtered by window on every call.
#[derive(Clone, Default)]
pub struct InMemoryPredictionSource {
    inner: Arc<RwLock<Vec<PredictionPoint>>>,
}

impl InMemoryPredictionSource {
    pub fn new(points: Vec<PredictionPoint>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(points)),
        }
    }

    pub fn replace_points(&self, points: Vec<PredictionPoint>) -> Result<(), DashboardError> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| DashboardError::Unavailable("points lock poisoned".to_string()))?;
        *guard = points;
        Ok(())
    }
}

impl PredictionSource for InMemoryPredictionSource {
    fn predictions(&self, window: TimeWindow) -> Result<Vec<PredictionPoint>, DashboardError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| DashboardError::Unavailable("points lock poisoned".to_string()))?;
        let mut points: Vec<PredictionPoint> = guard
            .iter()
            .filter(|p| window.start.map_or(true, |start| p.date_time >= start))
            .filter(|p| window.end.map_or(true, |end| p.date_time < end))
            .cloned()
            .collect();
        points.sort_by_key(|p| p.date_time);
        Ok(points)
    }
}

/// Reads the prediction view's source group from a SQLite feature store.
pub struct StorePredictionSource {
    store: Mutex<SqliteFeatureStore>,
    view_version: u32,
}

impl StorePredictionSource {
    pub fn open(path: &Path, view_version: u32) -> Result<Self, DashboardError> {
        Ok(Self {
            store: Mutex::new(SqliteFeatureStore::open(path)?),
            view_version,
        })
    }
}

impl PredictionSource for StorePredictionSource {
    fn predictions(&self, window: TimeWindow) -> Result<Vec<PredictionPoint>, DashboardError> {
        let store = self
            .store
            .lock()
            .map_err(|_| DashboardError::Unavailable("store lock poisoned".to_string()))?;
        let view = store.feature_view(PREDICTION_VIEW, self.view_version)?;
        let frame = store.read(&view.source_group, view.source_version, window)?;
        Ok(points_from_frame(&frame)?)
    }
}

pub fn points_from_frame(frame: &DataFrame) -> Result<Vec<PredictionPoint>, StoreError> {
    if frame.height() == 0 {
        return Ok(Vec::new());
    }
    let stamps = timestamps(frame, DATE_TIME_COLUMN)?;
    let keys = text_values(frame, DATE_TIME_STR_COLUMN)?;
    let actual = float_values(frame, LABEL_COLUMN)?;
    let predicted = float_values(frame, PREDICTED_LABEL_COLUMN)?;

    Ok(stamps
        .into_iter()
        .enumerate()
        .filter_map(|(idx, ts)| {
            ts.map(|date_time| PredictionPoint {
                date_time,
                date_time_str: keys[idx].clone().unwrap_or_default(),
                actual: actual[idx],
                predicted: predicted[idx],
            })
        })
        .collect())
}

pub fn dashboard_router(source: Arc<dyn PredictionSource>) -> Router {
    Router::new()
        .route("/dashboard", get(get_dashboard_html))
        .route("/dashboard/predictions", get(get_dashboard_predictions))
        .with_state(DashboardAppState { source })
}

pub fn load_series(
    source: &dyn PredictionSource,
    period: EstimationPeriod,
    now: NaiveDateTime,
) -> Result<PredictionSeries, DashboardError> {
    let window = period.window(now);
    Ok(PredictionSeries {
        period,
        start: now - period.span(),
        end: now,
        points: source.predictions(window)?,
    })
}

const CHART_WIDTH: f64 = 880.0;
const CHART_HEIGHT: f64 = 420.0;
const CHART_PAD: f64 = 56.0;

pub fn render_dashboard_html(series: &PredictionSeries) -> String {
    let mut out = String::new();
    out.push_str("<!DOCTYPE html><html><head><meta charset=\"utf-8\">\n");
    out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    out.push_str("<title>Air Quality Estimation - Gothenburg</title>\n");
    out.push_str("<style>body{margin:0;font-family:\"Avenir Next\",\"Segoe UI\",sans-serif;background:#f4f6f8;color:#182026}.shell{max-width:960px;margin:0 auto;padding:24px 18px}h1{margin:0 0 4px;font-size:1.5rem;border-bottom:3px solid #1f6fd1;padding-bottom:8px}.controls{margin:16px 0}.card{background:#fff;border:1px solid #d7dce1;border-radius:12px;padding:12px}.axis{stroke:#5f6a73;stroke-width:1}.actual{fill:#1f6fd1}.predicted{fill:#e4572e}.legend{font-size:.85rem;color:#5f6a73}.empty{padding:40px;text-align:center;color:#5f6a73}</style>\n");
    out.push_str("</head><body><main class=\"shell\">\n");
    out.push_str("<h1>Air Quality Estimation - Gothenburg</h1>\n");

    out.push_str("<form class=\"controls\" method=\"get\" action=\"/dashboard\">");
    out.push_str("<label for=\"period\">Estimation Period</label> ");
    out.push_str("<select id=\"period\" name=\"period\" onchange=\"this.form.submit()\">");
    for period in EstimationPeriod::ALL {
        let selected = if period == series.period {
            " selected"
        } else {
            ""
        };
        out.push_str(&format!(
            "<option value=\"{}\"{selected}>{}</option>",
            period.key(),
            escape_html(period.label())
        ));
    }
    out.push_str("</select></form>\n");

    out.push_str("<section class=\"card\">");
    out.push_str(&render_scatter_svg(series));
    out.push_str(&format!(
        "<div class=\"legend\">Points: {} &middot; {} to {}</div>",
        series.points.len(),
        escape_html(&series.start.format("%Y-%m-%d %H:%M").to_string()),
        escape_html(&series.end.format("%Y-%m-%d %H:%M").to_string())
    ));
    out.push_str("</section></main></body></html>\n");
    out
}

fn render_scatter_svg(series: &PredictionSeries) -> String {
    let title = format!("{} Prediction", series.period.label());
    let mut out = format!(
        "<svg id=\"prediction-chart\" xmlns=\"http://www.w3.org/2000/svg\" viewBox=\"0 0 {CHART_WIDTH} {CHART_HEIGHT}\" role=\"img\" aria-label=\"{}\">",
        escape_html(&title)
    );
    out.push_str(&format!(
        "<text x=\"{}\" y=\"24\" text-anchor=\"middle\">{}</text>",
        CHART_WIDTH / 2.0,
        escape_html(&title)
    ));

    let values: Vec<f64> = series
        .points
        .iter()
        .flat_map(|p| [p.actual, p.predicted])
        .flatten()
        .collect();
    if values.is_empty() {
        out.push_str(&format!(
            "<text class=\"empty\" x=\"{}\" y=\"{}\" text-anchor=\"middle\">No predictions in this period</text></svg>",
            CHART_WIDTH / 2.0,
            CHART_HEIGHT / 2.0
        ));
        return out;
    }

    let (mut lo, mut hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if hi - lo < f64::EPSILON {
        lo -= 1.0;
        hi += 1.0;
    }
    let t0 = series.start.and_utc().timestamp() as f64;
    let t1 = (series.end.and_utc().timestamp() as f64).max(t0 + 1.0);

    let x_of = |ts: NaiveDateTime| {
        CHART_PAD + (ts.and_utc().timestamp() as f64 - t0) / (t1 - t0) * (CHART_WIDTH - 2.0 * CHART_PAD)
    };
    let y_of = |v: f64| CHART_HEIGHT - CHART_PAD - (v - lo) / (hi - lo) * (CHART_HEIGHT - 2.0 * CHART_PAD);

    out.push_str(&format!(
        "<line class=\"axis\" x1=\"{CHART_PAD}\" y1=\"{bottom}\" x2=\"{right}\" y2=\"{bottom}\"/><line class=\"axis\" x1=\"{CHART_PAD}\" y1=\"{CHART_PAD}\" x2=\"{CHART_PAD}\" y2=\"{bottom}\"/>",
        bottom = CHART_HEIGHT - CHART_PAD,
        right = CHART_WIDTH - CHART_PAD
    ));
    out.push_str(&format!(
        "<text x=\"{}\" y=\"{}\" text-anchor=\"middle\">Date - Time</text>",
        CHART_WIDTH / 2.0,
        CHART_HEIGHT - 12.0
    ));
    out.push_str(&format!(
        "<text x=\"16\" y=\"{}\" transform=\"rotate(-90 16 {})\" text-anchor=\"middle\">PM 25</text>",
        CHART_HEIGHT / 2.0,
        CHART_HEIGHT / 2.0
    ));
    out.push_str(&format!(
        "<text x=\"{}\" y=\"{}\" text-anchor=\"end\">{hi:.1}</text><text x=\"{}\" y=\"{}\" text-anchor=\"end\">{lo:.1}</text>",
        CHART_PAD - 6.0,
        CHART_PAD + 4.0,
        CHART_PAD - 6.0,
        CHART_HEIGHT - CHART_PAD
    ));

    for (class, pick) in [
        ("actual", (|p: &PredictionPoint| p.actual) as fn(&PredictionPoint) -> Option<f64>),
        ("predicted", |p: &PredictionPoint| p.predicted),
    ] {
        out.push_str(&format!("<g class=\"{class}\">"));
        for point in &series.points {
            if let Some(value) = pick(point) {
                out.push_str(&format!(
                    "<circle cx=\"{:.1}\" cy=\"{:.1}\" r=\"3\"><title>{} {class}: {value:.2}</title></circle>",
                    x_of(point.date_time),
                    y_of(value),
                    escape_html(&point.date_time_str)
                ));
            }
        }
        out.push_str("</g>");
    }

    out.push_str(&format!(
        "<g class=\"legend\"><circle class=\"actual\" cx=\"{x}\" cy=\"40\" r=\"4\"/><text x=\"{tx}\" y=\"44\">actual</text><circle class=\"predicted\" cx=\"{x}\" cy=\"58\" r=\"4\"/><text x=\"{tx}\" y=\"62\">predicted</text></g>",
        x = CHART_WIDTH - CHART_PAD - 90.0,
        tx = CHART_WIDTH - CHART_PAD - 80.0
    ));
    out.push_str("</svg>");
    out
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[derive(Clone)]
struct DashboardAppState {
    source: Arc<dyn PredictionSource>,
}

#[derive(Debug, Deserialize)]
struct PeriodQuery {
    period: Option<String>,
}

fn resolve_period(query: &PeriodQuery) -> Result<EstimationPeriod, Response> {
    match query.period.as_deref() {
        None => Ok(EstimationPeriod::default()),
        Some(raw) => EstimationPeriod::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("unknown period '{raw}'; expected 24h, 1w or 1m"),
            )
                .into_response()
        }),
    }
}

fn source_error(err: DashboardError) -> Response {
    warn!(
        component = "dashboard_server",
        event = "http.predictions.error",
        error = %err
    );
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

async fn get_dashboard_html(
    State(state): State<DashboardAppState>,
    Query(query): Query<PeriodQuery>,
) -> Response {
    let period = match resolve_period(&query) {
        Ok(period) => period,
        Err(response) => return response,
    };
    match load_series(state.source.as_ref(), period, Local::now().naive_local()) {
        Ok(series) => {
            info!(
                component = "dashboard_server",
                event = "http.dashboard.request",
                period = period.key(),
                points = series.points.len()
            );
            Html(render_dashboard_html(&series)).into_response()
        }
        Err(err) => source_error(err),
    }
}

async fn get_dashboard_predictions(
    State(state): State<DashboardAppState>,
    Query(query): Query<PeriodQuery>,
) -> Response {
    let period = match resolve_period(&query) {
        Ok(period) => period,
        Err(response) => return response,
    };
    match load_series(state.source.as_ref(), period, Local::now().naive_local()) {
        Ok(series) => {
            info!(
                component = "dashboard_server",
                event = "http.predictions.request",
                period = period.key(),
                points = series.points.len()
            );
            Json(series).into_response()
        }
        Err(err) => source_error(err),
    }
}
