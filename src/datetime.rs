//! Canonical timestamps for `YYYY-MM-DD HH:MM` readings.
//!
//! The open-data feed reports the last hour of a day as `24:00`; that value
//! maps to `00:00` on the following day.

use chrono::{Days, NaiveDateTime};

use crate::frame::PreprocessError;

pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

const DIGIT_POSITIONS: [usize; 12] = [0, 1, 2, 3, 5, 6, 8, 9, 11, 12, 14, 15];
const SEPARATORS: [(usize, u8); 4] = [(4, b'-'), (7, b'-'), (10, b' '), (13, b':')];

pub fn convert_to_datetime(date_str: &str) -> Result<NaiveDateTime, PreprocessError> {
    check_layout(date_str)?;

    if &date_str[11..13] != "24" {
        return parse_exact(date_str);
    }

    let rolled = format!("{}00{}", &date_str[..11], &date_str[13..]);
    let parsed = parse_exact(&rolled)?;
    parsed
        .checked_add_days(Days::new(1))
        .ok_or_else(|| format_error(date_str, "date overflows after 24:00 rollover"))
}

pub fn format_date_time(value: NaiveDateTime) -> String {
    value.format(DATE_TIME_FORMAT).to_string()
}

fn parse_exact(date_str: &str) -> Result<NaiveDateTime, PreprocessError> {
    NaiveDateTime::parse_from_str(date_str, DATE_TIME_FORMAT)
        .map_err(|err| format_error(date_str, &err.to_string()))
}

// chrono accepts unpadded fields, so the fixed layout is checked up front.
fn check_layout(date_str: &str) -> Result<(), PreprocessError> {
    let bytes = date_str.as_bytes();
    if bytes.len() != 16 {
        return Err(format_error(date_str, "expected YYYY-MM-DD HH:MM"));
    }
    if DIGIT_POSITIONS.iter().any(|idx| !bytes[*idx].is_ascii_digit()) {
        return Err(format_error(date_str, "expected YYYY-MM-DD HH:MM"));
    }
    if SEPARATORS.iter().any(|(idx, sep)| bytes[*idx] != *sep) {
        return Err(format_error(date_str, "expected YYYY-MM-DD HH:MM"));
    }
    Ok(())
}

fn format_error(value: &str, reason: &str) -> PreprocessError {
    PreprocessError::Format {
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
