//! Live OHLC candle engine for a stock dashboard.
//!
//! Combines historical aggregates fetched over REST with a live
//! minute-aggregate WebSocket feed into one ordered, deduplicated candle
//! series per chart view, at a selectable granularity.

pub mod bucket;
pub mod config;
pub mod error;
pub mod history;
pub mod merger;
pub mod models;
pub mod series;
pub mod view;
pub mod websocket;

pub use error::{PulseError, Result};
