//! Raw observation sources: the backfill CSV file and the paginated
//! open-data rowstore API.

use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use polars::prelude::{Column, DataFrame};

use crate::frame::{float_column, int_column, text_column, PreprocessError};

pub const DEFAULT_SOURCE_URL: &str =
    "https://catalog.goteborg.se/rowstore/dataset/85ae9601-5258-442b-bc65-d74549c0cf8a/json";
pub const DEFAULT_PAGE_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("invalid page payload from {url}: {message}")]
    Payload { url: String, message: String },
    #[error("CSV row {row} has {found} fields, header has {expected}")]
    RaggedRow {
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub page_limit: usize,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SOURCE_URL.to_string(),
            page_limit: DEFAULT_PAGE_LIMIT,
            timeout_ms: 30_000,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

pub trait HttpFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, SourceError>;
}

pub struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    pub fn new(timeout_ms: u64) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| SourceError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let request_error = |message: String| SourceError::HttpRequest {
            url: url.to_string(),
            message,
        };
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| request_error(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(request_error(format!("unexpected HTTP status {status}")));
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| request_error(err.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct RowstorePage {
    limit: usize,
    #[serde(rename = "resultCount")]
    result_count: usize,
    results: Vec<Map<String, Value>>,
}

/// Pages through the rowstore with `_offset`/`_limit` until the reported
/// result count is exhausted.
pub fn fetch_all_records(
    fetcher: &dyn HttpFetcher,
    cfg: &HttpSourceConfig,
) -> Result<Vec<Map<String, Value>>, SourceError> {
    let mut offset = 0usize;
    let mut records = Vec::new();
    loop {
        let url = format!(
            "{}?_offset={offset}&_limit={}",
            cfg.base_url, cfg.page_limit
        );
        let body = retry(cfg, || fetcher.get_bytes(&url))?;
        let page: RowstorePage =
            serde_json::from_slice(&body).map_err(|err| SourceError::Payload {
                url: url.clone(),
                message: err.to_string(),
            })?;
        debug!(
            component = "rowstore_source",
            event = "source.page.fetched",
            offset,
            rows = page.results.len(),
            result_count = page.result_count
        );
        records.extend(page.results);

        if page.result_count <= offset + page.limit {
            break;
        }
        if page.limit == 0 {
            return Err(SourceError::Payload {
                url,
                message: "page limit is zero but more results remain".to_string(),
            });
        }
        offset += page.limit;
    }

    info!(
        component = "rowstore_source",
        event = "source.fetch.finish",
        records = records.len()
    );
    Ok(records)
}

/// Turns API records into a frame of text columns; blank strings become
/// missing. Typing is left to the declared schema.
pub fn records_to_frame(records: &[Map<String, Value>]) -> Result<DataFrame, SourceError> {
    let mut names: Vec<&str> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !names.contains(&key.as_str()) {
                names.push(key);
            }
        }
    }

    let columns = names
        .iter()
        .map(|name| {
            let cells: Vec<Option<String>> = records
                .iter()
                .map(|record| record.get(*name).and_then(text_cell))
                .collect();
            text_column(&name.trim().to_ascii_lowercase(), cells)
        })
        .collect();
    Ok(DataFrame::new(columns).map_err(PreprocessError::from)?)
}

pub fn fetch_frame(
    fetcher: &dyn HttpFetcher,
    cfg: &HttpSourceConfig,
) -> Result<DataFrame, SourceError> {
    records_to_frame(&fetch_all_records(fetcher, cfg)?)
}

fn text_cell(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(raw) => {
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        other => Some(other.to_string()),
    }
}

fn retry<T>(
    cfg: &HttpSourceConfig,
    mut f: impl FnMut() -> Result<T, SourceError>,
) -> Result<T, SourceError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= cfg.max_retries => return Err(err),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(1u64 << shift);
                warn!(
                    component = "rowstore_source",
                    event = "source.fetch.retry",
                    attempt,
                    sleep_ms,
                    error = %err
                );
                std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            }
        }
    }
}

pub fn read_csv_frame(path: &Path) -> Result<DataFrame, SourceError> {
    let file = std::fs::File::open(path)?;
    read_csv(file)
}

/// Reads a headed CSV, trimming whitespace around fields. Each column is
/// typed as integer, float or text, whichever is the narrowest that parses
/// every non-empty cell.
pub fn read_csv<R: Read>(reader: R) -> Result<DataFrame, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let mut cells: Vec<Vec<Option<String>>> = vec![Vec::new(); headers.len()];
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != headers.len() {
            return Err(SourceError::RaggedRow {
                row,
                found: record.len(),
                expected: headers.len(),
            });
        }
        for (column, field) in cells.iter_mut().zip(record.iter()) {
            column.push((!field.is_empty()).then(|| field.to_string()));
        }
    }

    let columns = headers
        .into_iter()
        .zip(cells)
        .map(|(name, values)| infer_column(&name, values))
        .collect();
    Ok(DataFrame::new(columns).map_err(PreprocessError::from)?)
}

fn infer_column(name: &str, values: Vec<Option<String>>) -> Column {
    let present = || values.iter().flatten();
    if present().all(|raw| raw.parse::<i64>().is_ok()) && present().next().is_some() {
        return int_column(
            name,
            values
                .iter()
                .map(|v| v.as_deref().and_then(|raw| raw.parse().ok()))
                .collect(),
        );
    }
    if present().all(|raw| raw.parse::<f64>().is_ok()) {
        return float_column(
            name,
            values
                .iter()
                .map(|v| v.as_deref().and_then(|raw| raw.parse::<f64>().ok()))
                .collect(),
        );
    }
    text_column(name, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{column_names, float_values, text_values};
    use polars::prelude::DataType;
    use std::cell::Cell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockFetcher {
        responses: HashMap<String, Vec<u8>>,
        failures_before_success: Cell<u32>,
        calls: Cell<u32>,
    }

    impl MockFetcher {
        fn with(mut self, url: &str, body: &str) -> Self {
            self.responses.insert(url.to_string(), body.as_bytes().to_vec());
            self
        }
    }

    impl HttpFetcher for MockFetcher {
        fn get_bytes(&self, url: &str) -> Result<Vec<u8>, SourceError> {
            self.calls.set(self.calls.get() + 1);
            if self.failures_before_success.get() > 0 {
                self.failures_before_success
                    .set(self.failures_before_success.get() - 1);
                return Err(SourceError::HttpRequest {
                    url: url.to_string(),
                    message: "transient".to_string(),
                });
            }
            self.responses
                .get(url)
                .cloned()
                .ok_or_else(|| SourceError::HttpRequest {
                    url: url.to_string(),
                    message: "missing mock".to_string(),
                })
        }
    }

    fn cfg() -> HttpSourceConfig {
        HttpSourceConfig {
            base_url: "http://rowstore.test/json".to_string(),
            page_limit: 2,
            timeout_ms: 1_000,
            max_retries: 2,
            retry_backoff_ms: 0,
        }
    }

    fn paged_fetcher() -> MockFetcher {
        MockFetcher::default()
            .with(
                "http://rowstore.test/json?_offset=0&_limit=2",
                r#"{"limit":2,"resultCount":3,"results":[
                    {"date":"2023-10-09","time":"01:00","femman_pm25":"4.5"},
                    {"date":"2023-10-09","time":"02:00","femman_pm25":" "}]}"#,
            )
            .with(
                "http://rowstore.test/json?_offset=2&_limit=2",
                r#"{"limit":2,"resultCount":3,"results":[
                    {"date":"2023-10-09","time":"03:00","femman_pm25":6}]}"#,
            )
    }

    #[test]
    fn pagination_follows_result_count() {
        let fetcher = paged_fetcher();
        let records = fetch_all_records(&fetcher, &cfg()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(fetcher.calls.get(), 2);
    }

    #[test]
    fn records_become_text_columns_with_blanks_missing() {
        let frame = fetch_frame(&paged_fetcher(), &cfg()).unwrap();
        assert_eq!(frame.height(), 3);
        assert_eq!(
            text_values(&frame, "femman_pm25").unwrap(),
            vec![Some("4.5".to_string()), None, Some("6".to_string())]
        );
        assert_eq!(frame.column("femman_pm25").unwrap().dtype(), &DataType::String);
    }

    #[test]
    fn transient_failures_are_retried() {
        let fetcher = paged_fetcher();
        fetcher.failures_before_success.set(2);
        assert_eq!(fetch_all_records(&fetcher, &cfg()).unwrap().len(), 3);
        assert_eq!(fetcher.calls.get(), 4);
    }

    #[test]
    fn retries_are_bounded() {
        let fetcher = paged_fetcher();
        fetcher.failures_before_success.set(3);
        assert!(matches!(
            fetch_all_records(&fetcher, &cfg()).unwrap_err(),
            SourceError::HttpRequest { .. }
        ));
        assert_eq!(fetcher.calls.get(), 3);
    }

    #[test]
    fn malformed_page_is_payload_error() {
        let fetcher =
            MockFetcher::default().with("http://rowstore.test/json?_offset=0&_limit=2", "[]");
        assert!(matches!(
            fetch_all_records(&fetcher, &cfg()).unwrap_err(),
            SourceError::Payload { .. }
        ));
    }

    #[test]
    fn csv_columns_are_trimmed_and_typed() {
        let csv = "date, time, femman_pm25, station_count, note\n\
                   2023-10-09, 01:00, 4.5, 3, ok\n\
                   2023-10-09, 02:00, , 4, \n";
        let frame = read_csv(csv.as_bytes()).unwrap();

        assert_eq!(
            column_names(&frame),
            vec!["date", "time", "femman_pm25", "station_count", "note"]
        );
        assert_eq!(
            float_values(&frame, "femman_pm25").unwrap(),
            vec![Some(4.5), None]
        );
        assert_eq!(frame.column("station_count").unwrap().dtype(), &DataType::Int64);
        assert_eq!(
            float_values(&frame, "station_count").unwrap(),
            vec![Some(3.0), Some(4.0)]
        );
        assert_eq!(
            text_values(&frame, "time").unwrap(),
            vec![Some("01:00".to_string()), Some("02:00".to_string())]
        );
        assert_eq!(
            text_values(&frame, "note").unwrap(),
            vec![Some("ok".to_string()), None]
        );
    }

    #[test]
    fn ragged_csv_row_is_rejected() {
        let csv = "a,b\n1,2\n3\n";
        assert!(matches!(
            read_csv(csv.as_bytes()).unwrap_err(),
            SourceError::RaggedRow { row: 1, .. }
        ));
    }
}
