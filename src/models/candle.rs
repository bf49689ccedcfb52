//! Candle and granularity types shared by the engine and the wire models.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::PulseError;

/// A single OHLC candlestick bar.
///
/// `time` is the bucket start in unix seconds. The engine expects
/// `low <= open, close <= high` but does not enforce it; upstream data is
/// trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl Candle {
    #[must_use]
    pub fn new(time: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
        }
    }

    /// Builds a candle from optional prices, rejecting it when `open` or
    /// `close` is missing.
    ///
    /// A missing `high`/`low` falls back to the larger/smaller of open and
    /// close. Nothing is ever coerced to zero.
    pub fn from_parts(
        time: i64,
        open: Option<Decimal>,
        high: Option<Decimal>,
        low: Option<Decimal>,
        close: Option<Decimal>,
    ) -> Option<Self> {
        let (open, close) = (open?, close?);
        Some(Self {
            time,
            open,
            high: high.unwrap_or_else(|| open.max(close)),
            low: low.unwrap_or_else(|| open.min(close)),
            close,
        })
    }
}

/// Bucket width of a candle series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "1min")]
    Min1,
    #[serde(rename = "5min")]
    Min5,
    #[serde(rename = "30min")]
    Min30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "1d")]
    Day1,
}

impl Granularity {
    /// Returns all granularities from finest to coarsest.
    pub fn all() -> &'static [Granularity] {
        &[
            Granularity::Min1,
            Granularity::Min5,
            Granularity::Min30,
            Granularity::Hour1,
            Granularity::Day1,
        ]
    }

    /// Bucket length in seconds.
    pub fn interval_secs(&self) -> i64 {
        match self {
            Granularity::Min1 => 60,
            Granularity::Min5 => 5 * 60,
            Granularity::Min30 => 30 * 60,
            Granularity::Hour1 => 60 * 60,
            Granularity::Day1 => 24 * 60 * 60,
        }
    }

    /// Returns the wire-format name (`"1min"`, `"5min"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Min1 => "1min",
            Granularity::Min5 => "5min",
            Granularity::Min30 => "30min",
            Granularity::Hour1 => "1h",
            Granularity::Day1 => "1d",
        }
    }

    /// The `(multiplier, timespan)` pair used in aggregate range URLs.
    pub fn range_spec(&self) -> (u32, &'static str) {
        match self {
            Granularity::Min1 => (1, "minute"),
            Granularity::Min5 => (5, "minute"),
            Granularity::Min30 => (30, "minute"),
            Granularity::Hour1 => (1, "hour"),
            Granularity::Day1 => (1, "day"),
        }
    }

    /// How many days of history one page covers for this granularity.
    pub fn lookback_days(&self) -> i64 {
        match self {
            Granularity::Min1 => 4,
            Granularity::Min5 => 10,
            Granularity::Min30 => 30,
            Granularity::Hour1 => 180,
            Granularity::Day1 => 730,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Granularity::all()
            .iter()
            .copied()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| PulseError::MalformedMessage(format!("unknown granularity {s:?}")))
    }
}
