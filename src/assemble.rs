//! Merges separate `date`/`time` columns into the canonical timestamp.

use polars::prelude::*;

use crate::datetime::convert_to_datetime;
use crate::frame::{
    column_names, text_column, text_values, timestamp_column, PreprocessError, DATE_TIME_COLUMN,
    DATE_TIME_STR_COLUMN,
};

pub const DATE_COLUMN: &str = "date";
pub const TIME_COLUMN: &str = "time";

/// Lowercases and trims every column name.
pub fn normalize_column_names(frame: &mut DataFrame) -> Result<(), PreprocessError> {
    let normalized: Vec<String> = column_names(frame)
        .iter()
        .map(|name| name.trim().to_lowercase())
        .collect();
    frame.set_column_names(normalized)?;
    Ok(())
}

pub fn create_date_time_feature(mut frame: DataFrame) -> Result<DataFrame, PreprocessError> {
    normalize_column_names(&mut frame)?;

    let dates = text_values(&frame, DATE_COLUMN)?;
    let times = text_values(&frame, TIME_COLUMN)?;

    let mut date_time_str = Vec::with_capacity(frame.height());
    let mut date_time = Vec::with_capacity(frame.height());
    for (row, (date, time)) in dates.iter().zip(times.iter()).enumerate() {
        let (Some(date), Some(time)) = (date, time) else {
            return Err(PreprocessError::Format {
                value: format!("{} {}", date.as_deref().unwrap_or(""), time.as_deref().unwrap_or("")),
                reason: format!("missing date or time in row {row}"),
            });
        };
        // "01:00+01:00" -> "01:00"
        let clock = time.split('+').next().unwrap_or_default();
        let joined = format!("{} {}", date.trim(), clock.trim());
        date_time.push(Some(convert_to_datetime(&joined)?));
        date_time_str.push(Some(joined));
    }

    let mut frame = frame.drop_many([DATE_COLUMN, TIME_COLUMN]);
    frame.with_column(text_column(DATE_TIME_STR_COLUMN, date_time_str))?;
    frame.with_column(timestamp_column(DATE_TIME_COLUMN, &date_time)?)?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{float_column, timestamps};
    use chrono::NaiveDate;

    fn raw_frame() -> DataFrame {
        DataFrame::new(vec![
            text_column(" Date ", vec![Some("2023-10-09"), Some("2023-10-09")]),
            text_column("TIME", vec![Some("23:00+01:00"), Some("24:00")]),
            float_column("Femman_PM25", vec![Some(4.5), None]),
        ])
        .unwrap()
    }

    #[test]
    fn builds_timestamp_and_string_columns() {
        let frame = create_date_time_feature(raw_frame()).unwrap();

        assert_eq!(
            column_names(&frame),
            vec!["femman_pm25", DATE_TIME_STR_COLUMN, DATE_TIME_COLUMN]
        );
        let stamps = timestamps(&frame, DATE_TIME_COLUMN).unwrap();
        assert_eq!(
            stamps[0],
            NaiveDate::from_ymd_opt(2023, 10, 9).unwrap().and_hms_opt(23, 0, 0)
        );
        assert_eq!(
            stamps[1],
            NaiveDate::from_ymd_opt(2023, 10, 10).unwrap().and_hms_opt(0, 0, 0)
        );
        let strings = text_values(&frame, DATE_TIME_STR_COLUMN).unwrap();
        assert_eq!(strings[0].as_deref(), Some("2023-10-09 23:00"));
        assert_eq!(strings[1].as_deref(), Some("2023-10-09 24:00"));
    }

    #[test]
    fn missing_time_column_is_schema_error() {
        let frame = DataFrame::new(vec![text_column("date", vec![Some("2023-10-09")])]).unwrap();
        assert_eq!(
            create_date_time_feature(frame).unwrap_err(),
            PreprocessError::missing_column(TIME_COLUMN)
        );
    }

    #[test]
    fn missing_cell_is_format_error() {
        let frame = DataFrame::new(vec![
            text_column("date", vec![Some("2023-10-09")]),
            text_column::<&str>("time", vec![None]),
        ])
        .unwrap();
        assert!(matches!(
            create_date_time_feature(frame).unwrap_err(),
            PreprocessError::Format { .. }
        ));
    }
}
