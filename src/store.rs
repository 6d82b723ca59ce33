//! Versioned feature groups, feature views and training-dataset metadata
//! behind the [`FeatureStore`] trait, with a SQLite implementation.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use polars::prelude::DataFrame;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::coercion::set_feature_type;
use crate::frame::{
    float_column, float_values, int_column, require, schema_of, text_column, text_values,
    timestamp_column, timestamps, FeatureSpec, FeatureType, PreprocessError,
};
use crate::model::MinMaxScaler;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error("{kind} '{name}' version {version} not found")]
    NotFound {
        kind: &'static str,
        name: String,
        version: u32,
    },
    #[error("schema mismatch for feature group '{group}': expected {expected}, got {actual}")]
    SchemaMismatch {
        group: String,
        expected: String,
        actual: String,
    },
    #[error("row {row} of feature group '{group}' has no value in key column '{column}'")]
    MissingKey {
        group: String,
        column: String,
        row: usize,
    },
    #[error("corrupt stored row in feature group '{group}': {reason}")]
    Corrupt { group: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureGroupSpec {
    pub name: String,
    pub version: u32,
    pub description: String,
    pub primary_key: String,
    pub event_time: String,
    pub online_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureGroup {
    pub spec: FeatureGroupSpec,
    /// Fixed by the first insert.
    pub schema: Option<Vec<FeatureSpec>>,
    pub schema_fingerprint: Option<String>,
}

/// Half-open event-time window `[start, end)`; open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl TimeWindow {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(start: NaiveDateTime) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn between(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureViewSpec {
    pub name: String,
    pub version: u32,
    pub description: String,
    pub source_group: String,
    pub source_version: u32,
    pub labels: Vec<String>,
    /// Columns passed through a min-max transformation fitted on the
    /// training split.
    pub scaled_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingDatasetMeta {
    pub view_name: String,
    pub view_version: u32,
    pub version: u32,
    pub description: String,
    pub train_start: NaiveDateTime,
    pub train_end: NaiveDateTime,
    pub test_start: NaiveDateTime,
    pub test_end: NaiveDateTime,
    pub scaler: MinMaxScaler,
}

pub trait FeatureStore {
    fn get_or_create_feature_group(
        &mut self,
        spec: &FeatureGroupSpec,
    ) -> Result<FeatureGroup, StoreError>;

    fn feature_group(&self, name: &str, version: u32) -> Result<FeatureGroup, StoreError>;

    /// Upserts every row by its primary-key value; returns the row count.
    fn insert(&mut self, name: &str, version: u32, frame: &DataFrame)
        -> Result<usize, StoreError>;

    /// Rows ordered by event time, restricted to `window`.
    fn read(&self, name: &str, version: u32, window: TimeWindow)
        -> Result<DataFrame, StoreError>;

    fn get_or_create_feature_view(
        &mut self,
        spec: &FeatureViewSpec,
    ) -> Result<FeatureViewSpec, StoreError>;

    fn feature_view(&self, name: &str, version: u32) -> Result<FeatureViewSpec, StoreError>;

    fn save_training_dataset(&mut self, meta: &TrainingDatasetMeta) -> Result<(), StoreError>;

    fn training_dataset(
        &self,
        view_name: &str,
        view_version: u32,
        version: u32,
    ) -> Result<TrainingDatasetMeta, StoreError>;
}

pub struct SqliteFeatureStore {
    conn: Connection,
}

impl SqliteFeatureStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        ensure_store_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        ensure_store_schema(&conn)?;
        Ok(Self { conn })
    }

    fn group_row(&self, name: &str, version: u32) -> Result<Option<(i64, FeatureGroup)>, StoreError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT group_id, description, primary_key, event_time, online_enabled,
                       schema_json, schema_fingerprint
                FROM feature_groups
                WHERE name = ?1 AND version = ?2
                ",
                params![name, version],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((group_id, description, primary_key, event_time, online_enabled, schema, fp)) =
            row
        else {
            return Ok(None);
        };
        let schema = schema
            .map(|raw| serde_json::from_str::<Vec<FeatureSpec>>(&raw))
            .transpose()?;
        Ok(Some((
            group_id,
            FeatureGroup {
                spec: FeatureGroupSpec {
                    name: name.to_string(),
                    version,
                    description,
                    primary_key,
                    event_time,
                    online_enabled,
                },
                schema,
                schema_fingerprint: fp,
            },
        )))
    }

    fn require_group(&self, name: &str, version: u32) -> Result<(i64, FeatureGroup), StoreError> {
        self.group_row(name, version)?
            .ok_or_else(|| StoreError::NotFound {
                kind: "feature group",
                name: name.to_string(),
                version,
            })
    }
}

impl FeatureStore for SqliteFeatureStore {
    fn get_or_create_feature_group(
        &mut self,
        spec: &FeatureGroupSpec,
    ) -> Result<FeatureGroup, StoreError> {
        if let Some((_, existing)) = self.group_row(&spec.name, spec.version)? {
            return Ok(existing);
        }

        self.conn.execute(
            "
            INSERT INTO feature_groups (
                name, version, description, primary_key, event_time, online_enabled,
                created_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                spec.name,
                spec.version,
                spec.description,
                spec.primary_key,
                spec.event_time,
                spec.online_enabled,
                Utc::now().timestamp_millis(),
            ],
        )?;
        info!(
            component = "feature_store",
            event = "store.group.created",
            group = %spec.name,
            version = spec.version,
            primary_key = %spec.primary_key,
            online_enabled = spec.online_enabled
        );

        Ok(FeatureGroup {
            spec: spec.clone(),
            schema: None,
            schema_fingerprint: None,
        })
    }

    fn feature_group(&self, name: &str, version: u32) -> Result<FeatureGroup, StoreError> {
        Ok(self.require_group(name, version)?.1)
    }

    fn insert(
        &mut self,
        name: &str,
        version: u32,
        frame: &DataFrame,
    ) -> Result<usize, StoreError> {
        let (group_id, group) = self.require_group(name, version)?;

        let (schema, frame) = match &group.schema {
            Some(schema) => (schema.clone(), conform_frame(name, schema, frame)?),
            None => (schema_of(frame), frame.clone()),
        };
        if frame.height() == 0 {
            return Ok(0);
        }

        let keys = key_values(name, &frame, &group.spec.primary_key)?;
        let event_times = event_time_values(name, &frame, &group.spec.event_time)?;
        let payloads = encode_rows(&frame)?;

        let tx = self.conn.transaction()?;
        if group.schema.is_none() {
            tx.execute(
                "
                UPDATE feature_groups
                SET schema_json = ?1, schema_fingerprint = ?2
                WHERE group_id = ?3
                ",
                params![
                    serde_json::to_string(&schema)?,
                    schema_fingerprint(&schema),
                    group_id
                ],
            )?;
        }
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO feature_rows (group_id, pk, event_time_ms, payload)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(group_id, pk) DO UPDATE SET
                    event_time_ms = excluded.event_time_ms,
                    payload = excluded.payload
                ",
            )?;
            for ((key, event_time_ms), payload) in keys.iter().zip(&event_times).zip(&payloads) {
                stmt.execute(params![group_id, key, event_time_ms, payload.to_string()])?;
            }
        }
        tx.commit()?;

        info!(
            component = "feature_store",
            event = "store.insert.finish",
            group = %name,
            version,
            rows = frame.height()
        );
        Ok(frame.height())
    }

    fn read(
        &self,
        name: &str,
        version: u32,
        window: TimeWindow,
    ) -> Result<DataFrame, StoreError> {
        let (group_id, group) = self.require_group(name, version)?;
        let Some(schema) = group.schema else {
            return Ok(DataFrame::empty());
        };

        let start = window.start.map_or(i64::MIN, |ts| ts.and_utc().timestamp_millis());
        let end = window.end.map_or(i64::MAX, |ts| ts.and_utc().timestamp_millis());
        let mut stmt = self.conn.prepare(
            "
            SELECT payload
            FROM feature_rows
            WHERE group_id = ?1
              AND event_time_ms >= ?2
              AND event_time_ms < ?3
            ORDER BY event_time_ms, pk
            ",
        )?;
        let payloads = stmt
            .query_map(params![group_id, start, end], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let frame = decode_rows(name, &schema, &payloads)?;
        debug!(
            component = "feature_store",
            event = "store.read.finish",
            group = %name,
            version,
            rows = frame.height()
        );
        Ok(frame)
    }

    fn get_or_create_feature_view(
        &mut self,
        spec: &FeatureViewSpec,
    ) -> Result<FeatureViewSpec, StoreError> {
        if let Ok(existing) = self.feature_view(&spec.name, spec.version) {
            return Ok(existing);
        }
        self.require_group(&spec.source_group, spec.source_version)?;

        self.conn.execute(
            "INSERT INTO feature_views (name, version, payload) VALUES (?1, ?2, ?3)",
            params![spec.name, spec.version, serde_json::to_string(spec)?],
        )?;
        info!(
            component = "feature_store",
            event = "store.view.created",
            view = %spec.name,
            version = spec.version,
            source_group = %spec.source_group
        );
        Ok(spec.clone())
    }

    fn feature_view(&self, name: &str, version: u32) -> Result<FeatureViewSpec, StoreError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM feature_views WHERE name = ?1 AND version = ?2",
                params![name, version],
                |row| row.get(0),
            )
            .optional()?;
        let payload = payload.ok_or_else(|| StoreError::NotFound {
            kind: "feature view",
            name: name.to_string(),
            version,
        })?;
        Ok(serde_json::from_str(&payload)?)
    }

    fn save_training_dataset(&mut self, meta: &TrainingDatasetMeta) -> Result<(), StoreError> {
        self.feature_view(&meta.view_name, meta.view_version)?;
        self.conn.execute(
            "
            INSERT INTO training_datasets (view_name, view_version, version, payload)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(view_name, view_version, version) DO UPDATE SET
                payload = excluded.payload
            ",
            params![
                meta.view_name,
                meta.view_version,
                meta.version,
                serde_json::to_string(meta)?
            ],
        )?;
        Ok(())
    }

    fn training_dataset(
        &self,
        view_name: &str,
        view_version: u32,
        version: u32,
    ) -> Result<TrainingDatasetMeta, StoreError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "
                SELECT payload FROM training_datasets
                WHERE view_name = ?1 AND view_version = ?2 AND version = ?3
                ",
                params![view_name, view_version, version],
                |row| row.get(0),
            )
            .optional()?;
        let payload = payload.ok_or_else(|| StoreError::NotFound {
            kind: "training dataset",
            name: format!("{view_name}/{view_version}"),
            version,
        })?;
        Ok(serde_json::from_str(&payload)?)
    }
}

/// Hex SHA-256 over `name:type` pairs in column order.
pub fn schema_fingerprint(schema: &[FeatureSpec]) -> String {
    let mut hasher = Sha256::new();
    for spec in schema {
        hasher.update(spec.name.as_bytes());
        hasher.update(b":");
        hasher.update(spec.type_tag().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn ensure_store_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS feature_groups (
            group_id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            version INTEGER NOT NULL,
            description TEXT NOT NULL,
            primary_key TEXT NOT NULL,
            event_time TEXT NOT NULL,
            online_enabled INTEGER NOT NULL,
            schema_json TEXT,
            schema_fingerprint TEXT,
            created_at_ms INTEGER NOT NULL,
            UNIQUE(name, version)
        );
        CREATE TABLE IF NOT EXISTS feature_rows (
            group_id INTEGER NOT NULL,
            pk TEXT NOT NULL,
            event_time_ms INTEGER NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY(group_id, pk)
        ) WITHOUT ROWID;
        CREATE INDEX IF NOT EXISTS feature_rows_event_time
            ON feature_rows(group_id, event_time_ms);
        CREATE TABLE IF NOT EXISTS feature_views (
            name TEXT NOT NULL,
            version INTEGER NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY(name, version)
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS training_datasets (
            view_name TEXT NOT NULL,
            view_version INTEGER NOT NULL,
            version INTEGER NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY(view_name, view_version, version)
        ) WITHOUT ROWID;
        ",
    )?;
    Ok(())
}

/// Reorders `frame` to the stored schema, widening integer columns into
/// double ones and narrowing integral floats into bigint ones.
fn conform_frame(
    group: &str,
    schema: &[FeatureSpec],
    frame: &DataFrame,
) -> Result<DataFrame, StoreError> {
    let mismatch = || StoreError::SchemaMismatch {
        group: group.to_string(),
        expected: describe_schema(schema),
        actual: describe_schema(&schema_of(frame)),
    };
    if frame.width() != schema.len() {
        return Err(mismatch());
    }

    let mut columns = Vec::with_capacity(schema.len());
    for spec in schema {
        let column = frame.column(&spec.name).map_err(|_| mismatch())?;
        let actual = FeatureType::of(column.dtype());
        let column = match (spec.feature_type, actual) {
            (expected, actual) if expected == actual => column
                .cast(&expected.dtype())
                .map_err(PreprocessError::from)?,
            (FeatureType::Double, FeatureType::Bigint)
            | (FeatureType::Bigint, FeatureType::Double) => {
                set_feature_type(frame, &spec.name, spec.type_tag())?
            }
            _ => return Err(mismatch()),
        };
        columns.push(column);
    }
    Ok(DataFrame::new(columns).map_err(PreprocessError::from)?)
}

fn describe_schema(schema: &[FeatureSpec]) -> String {
    schema
        .iter()
        .map(|spec| format!("{}:{}", spec.name, spec.type_tag()))
        .collect::<Vec<_>>()
        .join(",")
}

fn key_values(group: &str, frame: &DataFrame, key: &str) -> Result<Vec<String>, StoreError> {
    text_values(frame, key)?
        .into_iter()
        .enumerate()
        .map(|(row, value)| {
            value.ok_or_else(|| StoreError::MissingKey {
                group: group.to_string(),
                column: key.to_string(),
                row,
            })
        })
        .collect()
}

fn event_time_values(
    group: &str,
    frame: &DataFrame,
    column: &str,
) -> Result<Vec<i64>, StoreError> {
    timestamps(frame, column)?
        .into_iter()
        .enumerate()
        .map(|(row, ts)| {
            ts.map(|ts| ts.and_utc().timestamp_millis())
                .ok_or_else(|| StoreError::MissingKey {
                    group: group.to_string(),
                    column: column.to_string(),
                    row,
                })
        })
        .collect()
}

/// One JSON array per row, cells in column order. Timestamps are stored as
/// epoch milliseconds.
fn encode_rows(frame: &DataFrame) -> Result<Vec<Value>, StoreError> {
    let mut cells: Vec<Vec<Value>> = Vec::with_capacity(frame.width());
    for spec in schema_of(frame) {
        let name = spec.name.as_str();
        let encoded: Vec<Value> = match spec.feature_type {
            FeatureType::Double => float_values(frame, name)?
                .into_iter()
                .map(|v| {
                    v.and_then(serde_json::Number::from_f64)
                        .map_or(Value::Null, Value::Number)
                })
                .collect(),
            FeatureType::Bigint => {
                let ints = require(frame, name)?
                    .cast(&polars::prelude::DataType::Int64)
                    .map_err(PreprocessError::from)?;
                ints.i64()
                    .map_err(PreprocessError::from)?
                    .into_iter()
                    .map(|v| v.map_or(Value::Null, Value::from))
                    .collect()
            }
            FeatureType::String => text_values(frame, name)?
                .into_iter()
                .map(|v| v.map_or(Value::Null, Value::String))
                .collect(),
            FeatureType::Timestamp => timestamps(frame, name)?
                .into_iter()
                .map(|v| v.map_or(Value::Null, |ts| Value::from(ts.and_utc().timestamp_millis())))
                .collect(),
        };
        cells.push(encoded);
    }

    Ok((0..frame.height())
        .map(|row| Value::Array(cells.iter().map(|column| column[row].clone()).collect()))
        .collect())
}

fn decode_rows(
    group: &str,
    schema: &[FeatureSpec],
    payloads: &[String],
) -> Result<DataFrame, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        group: group.to_string(),
        reason,
    };

    let mut rows = Vec::with_capacity(payloads.len());
    for payload in payloads {
        let cells: Vec<Value> = serde_json::from_str(payload)?;
        if cells.len() != schema.len() {
            return Err(corrupt(format!(
                "row has {} cells, schema has {}",
                cells.len(),
                schema.len()
            )));
        }
        rows.push(cells);
    }

    let mut columns = Vec::with_capacity(schema.len());
    for (j, spec) in schema.iter().enumerate() {
        let name = spec.name.as_str();
        let cells = rows.iter().map(|row| &row[j]);
        let bad = |cell: &Value| corrupt(format!("column '{name}' cannot hold {cell}"));
        let column = match spec.feature_type {
            FeatureType::Double => float_column(
                name,
                cells
                    .map(|cell| decode_cell(cell, Value::as_f64).ok_or_else(|| bad(cell)))
                    .collect::<Result<_, _>>()?,
            ),
            FeatureType::Bigint => int_column(
                name,
                cells
                    .map(|cell| decode_cell(cell, Value::as_i64).ok_or_else(|| bad(cell)))
                    .collect::<Result<_, _>>()?,
            ),
            FeatureType::String => text_column(
                name,
                cells
                    .map(|cell| {
                        decode_cell(cell, |v| v.as_str().map(str::to_string))
                            .ok_or_else(|| bad(cell))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            FeatureType::Timestamp => {
                let stamps = cells
                    .map(|cell| {
                        decode_cell(cell, |v| {
                            v.as_i64()
                                .and_then(DateTime::from_timestamp_millis)
                                .map(|dt| dt.naive_utc())
                        })
                        .ok_or_else(|| bad(cell))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                timestamp_column(name, &stamps)?
            }
        };
        columns.push(column);
    }
    Ok(DataFrame::new(columns).map_err(PreprocessError::from)?)
}

/// `Some(None)` for a null cell, `None` when the cell has the wrong shape.
fn decode_cell<T>(cell: &Value, read: impl Fn(&Value) -> Option<T>) -> Option<Option<T>> {
    if cell.is_null() {
        Some(None)
    } else {
        read(cell).map(Some)
    }
}
