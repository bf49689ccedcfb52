//! Crate-level error types.
//!
//! [`PulseError`] unifies every error source (configuration, WebSocket,
//! HTTP, JSON) behind a single enum so callers can match on the variant they
//! care about while still using the `?` operator for easy propagation.
//!
//! The candle engine itself never returns these: malformed or mismatched
//! input is filtered and failed fetches degrade to "no update applied".

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PulseError>;

/// Top-level error type returned by all public I/O APIs.
#[derive(Debug, thiserror::Error)]
pub enum PulseError {
    /// Configuration could not be loaded from the environment.
    #[error("configuration error: {0}")]
    Config(String),

    /// A WebSocket operation (connect, send, receive) failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// An HTTP request to the market-data service failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A message did not have the expected shape.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The market-data service answered with an error payload.
    #[error("upstream error: {0}")]
    Upstream(String),
}
