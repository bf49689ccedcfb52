//! Candle engine types and the market-data provider's wire models.
//!
//! Contains the candle/granularity core types, inbound live updates, feed
//! and REST response models, and the outbound feed control messages.

pub mod aggs;
pub mod candle;
pub mod feed;
pub mod update;

use serde::Serialize;

pub use candle::{Candle, Granularity};
pub use update::{RawUpdate, UpdateTime};

/// Prefix of the per-minute aggregate channel (`AM.<SYMBOL>`).
const MINUTE_AGGREGATE_PREFIX: &str = "AM";

/// Returns the minute-aggregate channel name for `symbol`.
pub fn aggregate_channel(symbol: &str) -> String {
    format!("{MINUTE_AGGREGATE_PREFIX}.{}", symbol.to_uppercase())
}

/// A control message sent over the live feed connection.
#[derive(Debug, Serialize)]
pub struct FeedRequest {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
}

impl FeedRequest {
    /// Authenticates the connection with the provider API key.
    #[must_use]
    pub fn auth(api_key: &str) -> Self {
        Self {
            action: "auth".to_string(),
            params: Some(api_key.to_string()),
        }
    }

    /// Subscribes to minute aggregates for every symbol in `symbols`.
    #[must_use]
    pub fn subscribe(symbols: &[String]) -> Self {
        Self {
            action: "subscribe".to_string(),
            params: Some(channel_list(symbols)),
        }
    }

    /// Unsubscribes from minute aggregates for every symbol in `symbols`.
    #[must_use]
    pub fn unsubscribe(symbols: &[String]) -> Self {
        Self {
            action: "unsubscribe".to_string(),
            params: Some(channel_list(symbols)),
        }
    }

    /// Heartbeat keeping idle connections open.
    #[must_use]
    pub fn ping() -> Self {
        Self {
            action: "ping".to_string(),
            params: None,
        }
    }
}

fn channel_list(symbols: &[String]) -> String {
    symbols
        .iter()
        .map(|s| aggregate_channel(s))
        .collect::<Vec<_>>()
        .join(",")
}
