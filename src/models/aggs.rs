//! REST models for historical aggregates and market status.

use rust_decimal::Decimal;
use serde::Deserialize;

use super::candle::{Candle, Granularity};
use crate::bucket::bucket_start;

/// Response body of the aggregate range endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatesResponse {
    pub status: Option<String>,
    pub ticker: Option<String>,
    #[serde(default)]
    pub results: Vec<AggregateBar>,
    /// Error description; set instead of `results` on failure.
    pub error: Option<String>,
}

/// One historical bar. Every price is optional on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregateBar {
    /// Bar start, epoch milliseconds.
    pub t: i64,
    pub o: Option<Decimal>,
    pub h: Option<Decimal>,
    pub l: Option<Decimal>,
    pub c: Option<Decimal>,
    pub v: Option<Decimal>,
}

impl AggregateBar {
    /// Converts the bar into a bucket-aligned candle, or `None` when
    /// `open` or `close` is missing.
    pub fn to_candle(&self, granularity: Granularity) -> Option<Candle> {
        let time = bucket_start(self.t.div_euclid(1000), granularity)?;
        Candle::from_parts(time, self.o, self.h, self.l, self.c)
    }
}

/// Response body of the market status endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketStatusResponse {
    pub market: MarketStatus,
    #[serde(rename = "serverTime")]
    pub server_time: Option<String>,
}

/// Whether the exchange is currently trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarketStatus {
    Open,
    Closed,
    ExtendedHours,
}

impl MarketStatus {
    /// Live minute aggregates only flow while the market is not closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, MarketStatus::Closed)
    }
}
