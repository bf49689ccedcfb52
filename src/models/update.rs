//! Inbound live updates and their loosely typed timestamps.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::candle::{Candle, Granularity};
use crate::bucket::bucket_start;

/// Epoch values above this are taken to be milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// A timestamp as it arrives on the wire: an epoch number (seconds or
/// milliseconds) or an ISO-8601 string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpdateTime {
    Epoch(i64),
    EpochFloat(f64),
    Iso(String),
}

impl UpdateTime {
    /// Converts the timestamp to unix seconds (UTC), or `None` if it
    /// cannot be interpreted or lies outside the calendar range.
    ///
    /// ISO strings without an offset are read as UTC.
    pub fn to_unix_seconds(&self) -> Option<i64> {
        let seconds = match self {
            UpdateTime::Epoch(value) => epoch_to_seconds(*value),
            UpdateTime::EpochFloat(value) => epoch_to_seconds(float_to_epoch(*value)?),
            UpdateTime::Iso(text) => parse_iso_seconds(text.trim())?,
        };
        DateTime::<Utc>::from_timestamp(seconds, 0).map(|dt| dt.timestamp())
    }
}

impl From<i64> for UpdateTime {
    fn from(value: i64) -> Self {
        UpdateTime::Epoch(value)
    }
}

impl From<&str> for UpdateTime {
    fn from(value: &str) -> Self {
        UpdateTime::Iso(value.to_string())
    }
}

fn epoch_to_seconds(value: i64) -> i64 {
    if value.unsigned_abs() > EPOCH_MILLIS_THRESHOLD.unsigned_abs() {
        value.div_euclid(1000)
    } else {
        value
    }
}

/// Floors a float epoch, rejecting values an `i64` cannot hold.
fn float_to_epoch(value: f64) -> Option<i64> {
    let floored = value.floor();
    // i64::MAX as f64 rounds up to 2^63, which is itself out of range.
    (floored.is_finite() && floored >= i64::MIN as f64 && floored < i64::MAX as f64)
        .then_some(floored as i64)
}

fn parse_iso_seconds(text: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp())
}

/// An unvalidated live update addressed at one (symbol, granularity) series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawUpdate {
    pub symbol: String,
    pub granularity: Granularity,
    pub time: UpdateTime,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Option<Decimal>,
}

impl RawUpdate {
    /// Validates the update into a candle carrying the raw (not yet
    /// bucketed) time.
    ///
    /// Returns `None` when the time is unreadable or has no bucket at this
    /// update's granularity, or when `open`/`close` is missing.
    pub fn to_tick(&self) -> Option<Candle> {
        let time = self.time.to_unix_seconds()?;
        bucket_start(time, self.granularity)?;
        Candle::from_parts(time, self.open, self.high, self.low, self.close)
    }
}
