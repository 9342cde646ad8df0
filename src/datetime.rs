//! HL7 DTM timestamps.
//!
//! Analyzers send anything from a bare year to sub-second precision, sometimes with a
//! UTC offset tacked on. Parsing walks down from the most to the least precise layout
//! and gives up quietly: a timestamp we can't read is never worth rejecting a message over.

use chrono::{Local, NaiveDate, NaiveDateTime};

/// Layout used whenever we stamp an outgoing message
pub const HL7_DATETIME_FORMAT: &str = "%Y%m%d%H%M%S";
pub const HL7_DATE_FORMAT: &str = "%Y%m%d";

/// Parses an HL7 DTM value, e.g. `20240101120000`, `202401011200`, `20240101`, `2024`.
///
/// Recognised, in decreasing precision: `YYYYMMDDHHMMSS.F{1,4}`, `YYYYMMDDHHMMSS`,
/// `YYYYMMDDHHMM`, `YYYYMMDDHH`, `YYYYMMDD`, `YYYYMM`, `YYYY`. A trailing `+ZZZZ`/`-ZZZZ`
/// offset is dropped. Returns `None` for anything else.
pub fn parse_hl7_datetime(value: &str) -> Option<NaiveDateTime> {
    let value = strip_offset(value.trim());
    if value.is_empty() {
        return None;
    }

    let (digits, fraction) = match value.split_once('.') {
        Some((digits, fraction)) => (digits, Some(fraction)),
        None => (value, None),
    };

    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !matches!(digits.len(), 4 | 6 | 8 | 10 | 12 | 14) {
        return None;
    }

    let micros = match fraction {
        Some(fraction) => {
            // only whole-second values carry a fraction
            if digits.len() != 14
                || fraction.is_empty()
                || fraction.len() > 4
                || !fraction.bytes().all(|b| b.is_ascii_digit())
            {
                return None;
            }
            let scaled = format!("{:0<6}", fraction);
            scaled.parse::<u32>().ok()?
        }
        None => 0,
    };

    let part = |from: usize, to: usize, default: u32| -> Option<u32> {
        if digits.len() >= to {
            digits[from..to].parse().ok()
        } else {
            Some(default)
        }
    };

    let year: i32 = digits[0..4].parse().ok()?;
    let month = part(4, 6, 1)?;
    let day = part(6, 8, 1)?;
    let hour = part(8, 10, 0)?;
    let minute = part(10, 12, 0)?;
    let second = part(12, 14, 0)?;

    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_micro_opt(hour, minute, second, micros)
}

/// Formats a timestamp the way we write it into MSH-7 and friends.
pub fn format_hl7_datetime(value: &NaiveDateTime) -> String {
    value.format(HL7_DATETIME_FORMAT).to_string()
}

pub fn format_hl7_date(value: &NaiveDate) -> String {
    value.format(HL7_DATE_FORMAT).to_string()
}

/// The current local time in HL7 layout.
pub fn now_hl7() -> String {
    format_hl7_datetime(&Local::now().naive_local())
}

fn strip_offset(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() > 5 {
        let sign = bytes[bytes.len() - 5];
        let offset = &bytes[bytes.len() - 4..];
        if (sign == b'+' || sign == b'-') && offset.iter().all(|b| b.is_ascii_digit()) {
            return &value[..value.len() - 5];
        }
    }
    value
}
