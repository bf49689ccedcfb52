//! Application configuration loaded from environment variables.
//!
//! The market-data API key **must** be provided via `POLYGON_API_KEY`.
//!
//! Optional overrides:
//! - `POLYGON_WEBSOCKET_URL`: live aggregate feed endpoint
//! - `POLYGON_REST_URL`: REST base URL for history and market status
//! - `STOCKPULSE_RECONNECT_INITIAL_SECS` / `STOCKPULSE_RECONNECT_MAX_SECS`:
//!   bounds of the feed reconnect backoff

use std::time::Duration;

use crate::websocket::ReconnectPolicy;

/// Default delayed-stocks WebSocket endpoint.
const DEFAULT_WEBSOCKET_URL: &str = "wss://delayed.polygon.io/stocks";

/// Default REST base URL.
const DEFAULT_REST_URL: &str = "https://api.polygon.io";

/// Top-level application configuration.
#[derive(Debug)]
pub struct AppConfig {
    pub polygon: PolygonConfig,
    pub reconnect: ReconnectPolicy,
}

/// Market-data provider configuration values.
#[derive(Debug, Clone)]
pub struct PolygonConfig {
    pub websocket_url: String,
    pub rest_url: String,
    pub api_key: String,
}

/// Loads the application configuration from environment variables.
///
/// # Errors
///
/// Returns [`PulseError::Config`](crate::PulseError::Config) if
/// `POLYGON_API_KEY` is missing, or if a reconnect bound is not a positive
/// integer or the initial delay exceeds the maximum.
pub fn fetch_config() -> crate::Result<AppConfig> {
    let api_key = non_empty_var("POLYGON_API_KEY").ok_or_else(|| {
        crate::PulseError::Config("POLYGON_API_KEY is not set".to_string())
    })?;

    let websocket_url = non_empty_var("POLYGON_WEBSOCKET_URL")
        .unwrap_or_else(|| DEFAULT_WEBSOCKET_URL.to_string());
    let rest_url = non_empty_var("POLYGON_REST_URL")
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_REST_URL.to_string());

    let defaults = ReconnectPolicy::default();
    let initial = secs_var("STOCKPULSE_RECONNECT_INITIAL_SECS")?.unwrap_or(defaults.initial);
    let max = secs_var("STOCKPULSE_RECONNECT_MAX_SECS")?.unwrap_or(defaults.max);
    if initial > max {
        return Err(crate::PulseError::Config(format!(
            "reconnect initial delay {}s exceeds maximum {}s",
            initial.as_secs(),
            max.as_secs()
        )));
    }

    Ok(AppConfig {
        polygon: PolygonConfig {
            websocket_url,
            rest_url,
            api_key,
        },
        reconnect: ReconnectPolicy::new(initial, max),
    })
}

/// Returns the value of an environment variable if it exists and is non-empty.
fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

/// Parses an optional positive whole number of seconds.
fn secs_var(name: &str) -> crate::Result<Option<Duration>> {
    let Some(raw) = non_empty_var(name) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs))),
        _ => Err(crate::PulseError::Config(format!(
            "{name} must be a positive number of seconds, got {raw:?}"
        ))),
    }
}
