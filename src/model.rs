//! Linear regression, min-max scaling and regression metrics.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use polars::prelude::*;

use crate::frame::{float_values, numeric_rows, require, PreprocessError};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("expected {expected} features, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("least squares system could not be solved")]
    Singular,
    #[error("missing value in column '{column}' at row {row}")]
    MissingValue { column: String, row: usize },
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
}

/// Ordinary least squares with an intercept term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearRegression {
    pub feature_names: Vec<String>,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl LinearRegression {
    pub fn fit(feature_names: Vec<String>, x: &[Vec<f64>], y: &[f64]) -> Result<Self, ModelError> {
        if x.is_empty() || y.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        if x.len() != y.len() {
            return Err(ModelError::DimensionMismatch {
                expected: x.len(),
                actual: y.len(),
            });
        }
        let width = feature_names.len();
        if let Some(row) = x.iter().find(|row| row.len() != width) {
            return Err(ModelError::DimensionMismatch {
                expected: width,
                actual: row.len(),
            });
        }

        let design = DMatrix::from_fn(x.len(), width + 1, |r, c| {
            if c == 0 {
                1.0
            } else {
                x[r][c - 1]
            }
        });
        let target = DVector::from_column_slice(y);
        let beta = solve_least_squares(&design, &target).ok_or(ModelError::Singular)?;

        Ok(Self {
            feature_names,
            intercept: beta[0],
            coefficients: beta.iter().skip(1).copied().collect(),
        })
    }

    pub fn predict_row(&self, row: &[f64]) -> Result<f64, ModelError> {
        if row.len() != self.coefficients.len() {
            return Err(ModelError::DimensionMismatch {
                expected: self.coefficients.len(),
                actual: row.len(),
            });
        }
        Ok(self.intercept
            + row
                .iter()
                .zip(&self.coefficients)
                .map(|(x, b)| x * b)
                .sum::<f64>())
    }

    pub fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        rows.iter().map(|row| self.predict_row(row)).collect()
    }

    /// Coefficient of determination on `(x, y)`.
    pub fn score(&self, x: &[Vec<f64>], y: &[f64]) -> Result<f64, ModelError> {
        Ok(r2_score(y, &self.predict(x)?))
    }
}

/// Solve a least squares problem using SVD, loosening the tolerance for
/// near-collinear designs.
pub(crate) fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);
    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }
    None
}

/// Ridge regression on centered data; returns `(intercept, coefficients)`.
pub(crate) fn ridge_fit(x: &DMatrix<f64>, y: &DVector<f64>, alpha: f64) -> Option<(f64, DVector<f64>)> {
    let n = x.nrows();
    if n == 0 {
        return None;
    }
    let x_mean = DVector::from_fn(x.ncols(), |c, _| x.column(c).mean());
    let y_mean = y.mean();

    let mut centered = x.clone();
    for (c, mut column) in centered.column_iter_mut().enumerate() {
        column.add_scalar_mut(-x_mean[c]);
    }
    let y_centered = y.add_scalar(-y_mean);

    let xt = centered.transpose();
    let gram = &xt * &centered + DMatrix::identity(x.ncols(), x.ncols()) * alpha;
    let rhs = &xt * &y_centered;

    let beta = match gram.clone().cholesky() {
        Some(chol) => chol.solve(&rhs),
        None => solve_least_squares(&gram, &rhs)?,
    };
    if !beta.iter().all(|v| v.is_finite()) {
        return None;
    }
    let intercept = y_mean - x_mean.dot(&beta);
    Some((intercept, beta))
}

pub fn r2_score(y_true: &[f64], y_pred: &[f64]) -> f64 {
    if y_true.is_empty() {
        return f64::NAN;
    }
    let mean = y_true.iter().sum::<f64>() / y_true.len() as f64;
    let ss_res: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean).powi(2)).sum();
    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

pub fn mean_squared_error(y_true: &[f64], y_pred: &[f64]) -> f64 {
    if y_true.is_empty() {
        return f64::NAN;
    }
    y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum::<f64>()
        / y_true.len() as f64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxStats {
    pub name: String,
    pub min: f64,
    pub max: f64,
}

/// Per-column min-max scaling fitted on a training split.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    pub columns: Vec<MinMaxStats>,
}

impl MinMaxScaler {
    pub fn fit(frame: &DataFrame, names: &[&str]) -> Result<Self, ModelError> {
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let values = float_values(frame, name)?;
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            for value in values.into_iter().flatten() {
                min = min.min(value);
                max = max.max(value);
            }
            if !min.is_finite() || !max.is_finite() {
                min = 0.0;
                max = 0.0;
            }
            columns.push(MinMaxStats {
                name: (*name).to_string(),
                min,
                max,
            });
        }
        Ok(Self { columns })
    }

    /// Scales fitted columns to `[0, 1]`; a constant column maps to 0.
    pub fn transform(&self, frame: &DataFrame) -> Result<DataFrame, PreprocessError> {
        let mut scaled = Vec::with_capacity(self.columns.len());
        for stats in &self.columns {
            require(frame, &stats.name)?;
            let value = col(stats.name.as_str()).cast(DataType::Float64);
            let range = stats.max - stats.min;
            let expr = if range == 0.0 {
                when(value.clone().is_null())
                    .then(lit(NULL).cast(DataType::Float64))
                    .otherwise(lit(0.0))
            } else {
                (value - lit(stats.min)) / lit(range)
            };
            scaled.push(expr.alias(stats.name.as_str()));
        }
        if scaled.is_empty() {
            return Ok(frame.clone());
        }
        Ok(frame.clone().lazy().with_columns(scaled).collect()?)
    }
}

/// Row-major dense matrix over `names`; every cell must be present.
pub fn dense_rows(frame: &DataFrame, names: &[&str]) -> Result<Vec<Vec<f64>>, ModelError> {
    let sparse = numeric_rows(frame, names)?;
    sparse
        .into_iter()
        .enumerate()
        .map(|(row, cells)| {
            cells
                .into_iter()
                .enumerate()
                .map(|(col, cell)| {
                    cell.ok_or_else(|| ModelError::MissingValue {
                        column: names[col].to_string(),
                        row,
                    })
                })
                .collect()
        })
        .collect()
}

pub fn dense_column(frame: &DataFrame, name: &str) -> Result<Vec<f64>, ModelError> {
    Ok(dense_rows(frame, &[name])?.into_iter().map(|row| row[0]).collect())
}
