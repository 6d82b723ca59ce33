//! Casting incoming columns to a declared feature type.

use polars::prelude::*;

use crate::frame::{require, text_values, FeatureType, PreprocessError};

/// Casts `feature_name` to the type named by `type_tag`: `double` gives a
/// float column, `bigint` an integer column, anything else a text column.
/// Missing cells stay missing; blank strings count as missing.
pub fn set_feature_type(
    frame: &DataFrame,
    feature_name: &str,
    type_tag: &str,
) -> Result<Column, PreprocessError> {
    let source = require(frame, feature_name)?;
    let source_type = FeatureType::of(source.dtype());

    let (target, label) = match type_tag {
        "double" => (FeatureType::Double, "double"),
        "bigint" => (FeatureType::Bigint, "bigint"),
        _ => {
            let text = text_values(frame, feature_name)?;
            return Ok(Column::new(feature_name.into(), text));
        }
    };

    let input = match source_type {
        FeatureType::String => blank_to_null(source)?,
        FeatureType::Timestamp => {
            return match first_present(frame, feature_name)? {
                Some(value) => Err(coercion_error(feature_name, label, value)),
                None => Ok(Series::full_null(
                    feature_name.into(),
                    frame.height(),
                    &target.dtype(),
                )
                .into()),
            };
        }
        FeatureType::Double | FeatureType::Bigint => source.clone(),
    };

    if target == FeatureType::Bigint && source_type == FeatureType::Double {
        reject_fractions(&input, feature_name)?;
    }

    let mut cast = input.cast(&target.dtype())?;
    if target == FeatureType::Double {
        // "nan" parses to NaN; the frame stores it as missing.
        let cleaned: Float64Chunked = cast
            .f64()?
            .into_iter()
            .map(|v| v.filter(|x| !x.is_nan()))
            .collect();
        cast = cleaned.with_name(feature_name.into()).into_series().into();
    }

    // A cell that was present before the cast and is null after it did not parse.
    let before = input.is_not_null();
    let after = cast.is_not_null();
    let texts = text_values(frame, feature_name)?;
    for (idx, (was, now)) in before.into_iter().zip(after.into_iter()).enumerate() {
        if was == Some(true) && now != Some(true) && !is_nan_literal(texts[idx].as_deref()) {
            let value = texts[idx].clone().unwrap_or_default();
            return Err(coercion_error(feature_name, label, value));
        }
    }
    Ok(cast)
}

fn blank_to_null(column: &Column) -> Result<Column, PreprocessError> {
    let trimmed: StringChunked = column
        .str()?
        .into_iter()
        .map(|cell| cell.map(str::trim).filter(|raw| !raw.is_empty()))
        .collect();
    Ok(trimmed.with_name(column.name().clone()).into_series().into())
}

fn reject_fractions(column: &Column, name: &str) -> Result<(), PreprocessError> {
    let floats = column.cast(&DataType::Float64)?;
    for value in floats.f64()?.into_iter().flatten() {
        if value.is_nan() {
            continue;
        }
        if value.fract() != 0.0 || value.abs() >= i64::MAX as f64 {
            return Err(coercion_error(name, "bigint", value.to_string()));
        }
    }
    Ok(())
}

fn first_present(frame: &DataFrame, name: &str) -> Result<Option<String>, PreprocessError> {
    Ok(text_values(frame, name)?.into_iter().flatten().next())
}

fn is_nan_literal(cell: Option<&str>) -> bool {
    cell.is_some_and(|raw| raw.trim().eq_ignore_ascii_case("nan"))
}

fn coercion_error(column: &str, target: &'static str, value: impl Into<String>) -> PreprocessError {
    PreprocessError::Coercion {
        column: column.to_string(),
        target,
        value: value.into(),
    }
}
