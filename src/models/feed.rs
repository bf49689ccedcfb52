//! Live feed wire models: minute aggregates and status events.

use rust_decimal::Decimal;
use serde::Deserialize;

use super::candle::Granularity;
use super::update::{RawUpdate, UpdateTime};

/// One event from the live feed, routed on its `ev` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "ev")]
pub enum FeedMessage {
    /// Per-minute aggregate bar (wire name: `"AM"`).
    #[serde(rename = "AM")]
    MinuteAggregate(MinuteAggregate),
    /// Connection or authentication status (wire name: `"status"`).
    #[serde(rename = "status")]
    Status(StatusMessage),
    /// Any event type this crate does not consume.
    #[serde(other)]
    Other,
}

/// A per-minute aggregate for one symbol.
#[derive(Debug, Clone, Deserialize)]
pub struct MinuteAggregate {
    pub sym: String,
    pub o: Option<Decimal>,
    pub h: Option<Decimal>,
    pub l: Option<Decimal>,
    pub c: Option<Decimal>,
    /// Tick volume for the window.
    pub v: Option<Decimal>,
    /// Window start, epoch milliseconds.
    pub s: i64,
    /// Window end, epoch milliseconds.
    pub e: Option<i64>,
}

impl MinuteAggregate {
    /// Addresses this aggregate at a `granularity` series of its symbol.
    ///
    /// Prices are carried over as-is; validation happens in the merger.
    #[must_use]
    pub fn into_update(self, granularity: Granularity) -> RawUpdate {
        RawUpdate {
            symbol: self.sym,
            granularity,
            time: UpdateTime::Epoch(self.s),
            open: self.o,
            high: self.h,
            low: self.l,
            close: self.c,
        }
    }
}

/// Status event, e.g. `auth_success` after authenticating.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusMessage {
    pub status: String,
    #[serde(default)]
    pub message: String,
}
