use std::sync::Arc;

use aq_pred::{
    dashboard_router, InMemoryPredictionSource, PredictionPoint, PredictionSource,
    DashboardError, TimeWindow,
};
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use chrono::{Duration, Local, NaiveDateTime};
use tower::util::ServiceExt;

fn point(at: NaiveDateTime, actual: f64, predicted: f64) -> PredictionPoint {
    PredictionPoint {
        date_time: at,
        date_time_str: at.format("%Y-%m-%d %H:%M").to_string(),
        actual: Some(actual),
        predicted: Some(predicted),
    }
}

fn recent_points() -> Vec<PredictionPoint> {
    let now = Local::now().naive_local();
    vec![
        point(now - Duration::hours(2), 7.5, 8.0),
        point(now - Duration::days(3), 12.0, 10.5),
        point(now - Duration::days(20), 3.0, 4.0),
        point(now - Duration::days(45), 1.0, 1.0),
    ]
}

struct FailingSource;

impl PredictionSource for FailingSource {
    fn predictions(&self, _window: TimeWindow) -> Result<Vec<PredictionPoint>, DashboardError> {
        Err(DashboardError::Unavailable("store offline".to_string()))
    }
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn dashboard_page_renders_selector_and_chart() {
    let app = dashboard_router(Arc::new(InMemoryPredictionSource::new(recent_points())));
    let (status, body) = get(app, "/dashboard").await;

    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("Air Quality Estimation - Gothenburg"));
    assert!(text.contains("name=\"period\""));
    assert!(text.contains("<option value=\"24h\" selected>24 hours</option>"));
    assert!(text.contains("<option value=\"1w\">1 Week</option>"));
    assert!(text.contains("<option value=\"1m\">1 Month</option>"));
    assert!(text.contains("id=\"prediction-chart\""));
    assert!(text.contains("Date - Time"));
    assert!(text.contains("PM 25"));
}

#[tokio::test]
async fn predictions_endpoint_scopes_points_to_period() {
    let source = Arc::new(InMemoryPredictionSource::new(recent_points()));

    let (status, body) = get(dashboard_router(source.clone()), "/dashboard/predictions").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["period"], "24h");
    assert_eq!(json["points"].as_array().unwrap().len(), 1);
    assert_eq!(json["points"][0]["actual"], 7.5);
    assert_eq!(json["points"][0]["predicted"], 8.0);

    let (_, body) = get(
        dashboard_router(source.clone()),
        "/dashboard/predictions?period=1w",
    )
    .await;
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["points"].as_array().unwrap().len(), 2);

    let (_, body) = get(dashboard_router(source), "/dashboard/predictions?period=1m").await;
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let points = json["points"].as_array().unwrap();
    assert_eq!(points.len(), 3);
    let stamps: Vec<&str> = points
        .iter()
        .map(|p| p["date_time_str"].as_str().unwrap())
        .collect();
    let mut sorted = stamps.clone();
    sorted.sort();
    assert_eq!(stamps, sorted);
}

#[tokio::test]
async fn unknown_period_is_rejected() {
    let app = dashboard_router(Arc::new(InMemoryPredictionSource::default()));
    let (status, body) = get(app, "/dashboard/predictions?period=1y").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8(body).unwrap().contains("1y"));
}

#[tokio::test]
async fn source_failures_map_to_server_error() {
    let app = dashboard_router(Arc::new(FailingSource));
    let (status, body) = get(app, "/dashboard").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(String::from_utf8(body).unwrap().contains("store offline"));
}

#[tokio::test]
async fn empty_period_renders_placeholder() {
    let app = dashboard_router(Arc::new(InMemoryPredictionSource::new(Vec::new())));
    let (status, body) = get(app, "/dashboard?period=1m").await;

    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("No predictions in this period"));
    assert!(text.contains("<option value=\"1m\" selected>1 Month</option>"));
}

#[test]
fn empty_frame_has_no_points() {
    assert!(aq_pred::points_from_frame(&aq_pred::polars::prelude::DataFrame::empty())
        .unwrap()
        .is_empty());
}
