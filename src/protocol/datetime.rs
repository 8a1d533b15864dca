//! Payload datetime codecs.
//!
//! Two packing schemes occur in the protocol: a byte-per-field form used by
//! override/state commands, and a 40-bit bitfield form used only by fault
//! log entries.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use super::DecodeError;
use super::{hex_u16, hex_u8};

/// Decode a 12-hex-char packed datetime: minute, hour, day and month as one
/// byte each followed by a 16-bit year.
pub fn packed_datetime_decode(hex: &str) -> Result<NaiveDateTime, DecodeError> {
    if hex.len() < 12 {
        return Err(DecodeError::BadDatetime(hex.to_string()));
    }
    let minute = hex_u8(&hex[0..2])?;
    let hour = hex_u8(&hex[2..4])?;
    let day = hex_u8(&hex[4..6])?;
    let month = hex_u8(&hex[6..8])?;
    let year = hex_u16(&hex[8..12])?;
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .and_then(|d| d.and_hms_opt(hour as u32, minute as u32, 0))
        .ok_or_else(|| DecodeError::BadDatetime(hex.to_string()))
}

/// Encode a datetime in the byte-per-field packing, for outbound override
/// commands.
pub fn packed_datetime_encode(dtm: &NaiveDateTime) -> String {
    use chrono::{Datelike, Timelike};
    format!(
        "{:02X}{:02X}{:02X}{:02X}{:04X}",
        dtm.minute(),
        dtm.hour(),
        dtm.day(),
        dtm.month(),
        dtm.year() as u16
    )
}

/// Parse an `until` timestamp from a control instruction, e.g.
/// `2026-03-01T22:00:00Z`.
pub fn parse_until(s: &str) -> Result<DateTime<Utc>, DecodeError> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ")
        .map(|n| Utc.from_utc_datetime(&n))
        .map_err(|_| DecodeError::BadDatetime(s.to_string()))
}

/// Decode the fault log's 40-bit packed timestamp from its 8 hex chars.
///
/// The bit layout interleaves date and time fields; the shifts below are the
/// controller's, taken as ground truth rather than derived.
pub fn faultlog_datetime(hex: &str) -> Result<NaiveDateTime, DecodeError> {
    if hex.len() < 8 {
        return Err(DecodeError::BadDatetime(hex.to_string()));
    }
    let packed: u64 = (hex_u8(&hex[0..2])? as u64) << 32
        | (hex_u8(&hex[2..4])? as u64) << 24
        | (hex_u8(&hex[4..6])? as u64) << 16
        | (hex_u8(&hex[6..8])? as u64) << 8;

    let year = ((packed >> 24) & 0x7F) + 2000;
    let month = (packed >> 36) & 0x0F;
    let day = (packed >> 31) & 0x1F;
    let hour = (packed >> 19) & 0x1F;
    let minute = (packed >> 13) & 0x3F;
    let second = (packed >> 7) & 0x3F;

    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .and_then(|d| d.and_hms_opt(hour as u32, minute as u32, second as u32))
        .ok_or_else(|| DecodeError::BadDatetime(hex.to_string()))
}
