//! Historical OHLC fetches and market status over the REST API.
//!
//! [`HistorySource`] is the seam the view drives; [`HistoryClient`] is the
//! HTTP implementation. Responses are converted into bucket-aligned
//! [`Candle`]s with malformed rows dropped; ordering and deduplication are
//! left to the series store, since upstream ordering is not trusted.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::Result;
use crate::config::PolygonConfig;
use crate::merger::{BackfillRequest, SeedRequest};
use crate::models::aggs::{AggregatesResponse, MarketStatus, MarketStatusResponse};
use crate::models::{Candle, Granularity};

/// Maximum bars per aggregate page.
const PAGE_LIMIT: u32 = 5000;

/// Per-request timeout for REST calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Inclusive time window in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: i64,
    pub to: i64,
}

/// One history fetch: a symbol, a granularity and an optional window.
///
/// Without a window the provider's most recent
/// [`lookback_days`](Granularity::lookback_days) are requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub symbol: String,
    pub granularity: Granularity,
    pub range: Option<TimeRange>,
}

impl HistoryRequest {
    /// Requests the most recent page of history.
    #[must_use]
    pub fn latest(symbol: &str, granularity: Granularity) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            granularity,
            range: None,
        }
    }

    /// Requests one page of history ending just before `before`.
    #[must_use]
    pub fn before(symbol: &str, granularity: Granularity, before: i64) -> Self {
        let to = before - 1;
        let from = before - granularity.lookback_days() * SECONDS_PER_DAY;
        Self {
            symbol: symbol.to_uppercase(),
            granularity,
            range: Some(TimeRange { from, to }),
        }
    }
}

impl From<&SeedRequest> for HistoryRequest {
    fn from(request: &SeedRequest) -> Self {
        HistoryRequest::latest(&request.symbol, request.granularity)
    }
}

impl From<&BackfillRequest> for HistoryRequest {
    fn from(request: &BackfillRequest) -> Self {
        HistoryRequest::before(&request.symbol, request.granularity, request.before)
    }
}

/// Anything that can answer history requests.
pub trait HistorySource: Send + Sync + 'static {
    /// Fetches candles for `request`, in any order.
    fn fetch(&self, request: &HistoryRequest) -> impl Future<Output = Result<Vec<Candle>>> + Send;
}

/// REST client for aggregate history and market status.
#[derive(Debug, Clone)]
pub struct HistoryClient {
    http: reqwest::Client,
    rest_url: String,
    api_key: String,
}

impl HistoryClient {
    /// Builds a client from provider configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::Http`](crate::PulseError::Http) if the HTTP
    /// client cannot be constructed.
    pub fn new(config: &PolygonConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            rest_url: config.rest_url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// Builds the aggregate range request for `request` relative to `now`.
    ///
    /// Default windows use calendar dates; explicit windows use epoch
    /// milliseconds.
    ///
    /// # Errors
    ///
    /// Returns [`PulseError::Http`](crate::PulseError::Http) if the URL is
    /// invalid.
    pub fn aggregates_request(
        &self,
        request: &HistoryRequest,
        now: DateTime<Utc>,
    ) -> Result<reqwest::Request> {
        let (from, to) = match request.range {
            Some(range) => (
                (range.from * 1000).to_string(),
                (range.to * 1000).to_string(),
            ),
            None => {
                let start = now - chrono::Duration::days(request.granularity.lookback_days());
                (
                    start.format("%Y-%m-%d").to_string(),
                    now.format("%Y-%m-%d").to_string(),
                )
            }
        };
        let (multiplier, timespan) = request.granularity.range_spec();
        let url = format!(
            "{}/v2/aggs/ticker/{}/range/{multiplier}/{timespan}/{from}/{to}",
            self.rest_url,
            request.symbol.to_uppercase(),
        );

        let limit = PAGE_LIMIT.to_string();
        let built = self
            .http
            .get(url)
            .query(&[
                ("adjusted", "true"),
                ("sort", "asc"),
                ("limit", limit.as_str()),
                ("apiKey", self.api_key.as_str()),
            ])
            .build()?;
        Ok(built)
    }

    /// Fetches aggregate history, dropping bars without open or close.
    ///
    /// # Errors
    ///
    /// Returns a [`PulseError`](crate::PulseError) if the request fails, the
    /// service answers with a non-success status or an error payload, or
    /// the body cannot be parsed.
    pub async fn fetch_aggregates(&self, request: &HistoryRequest) -> Result<Vec<Candle>> {
        let http_request = self.aggregates_request(request, Utc::now())?;
        debug!(
            symbol = request.symbol,
            granularity = %request.granularity,
            range = ?request.range,
            "Fetching aggregate history"
        );

        let response = self.http.execute(http_request).await?.error_for_status()?;
        let body: AggregatesResponse = response.json().await?;

        if let Some(error) = body.error
            && body.results.is_empty()
        {
            return Err(crate::PulseError::Upstream(format!(
                "aggregates for {}: {error}",
                request.symbol
            )));
        }

        let total = body.results.len();
        let candles: Vec<Candle> = body
            .results
            .iter()
            .filter_map(|bar| bar.to_candle(request.granularity))
            .collect();
        if candles.len() < total {
            debug!(
                symbol = request.symbol,
                dropped = total - candles.len(),
                "Dropped malformed history bars"
            );
        }

        info!(
            symbol = request.symbol,
            granularity = %request.granularity,
            candles = candles.len(),
            "Fetched aggregate history"
        );
        Ok(candles)
    }

    /// Queries whether the market is currently open.
    ///
    /// # Errors
    ///
    /// Returns a [`PulseError`](crate::PulseError) if the request fails or
    /// the body cannot be parsed.
    pub async fn market_status(&self) -> Result<MarketStatus> {
        let response = self
            .http
            .get(format!("{}/v1/marketstatus/now", self.rest_url))
            .query(&[("apiKey", self.api_key.as_str())])
            .send()
            .await?
            .error_for_status()?;
        let body: MarketStatusResponse = response.json().await?;
        info!(market = ?body.market, server_time = ?body.server_time, "Fetched market status");
        Ok(body.market)
    }
}

impl HistorySource for HistoryClient {
    fn fetch(&self, request: &HistoryRequest) -> impl Future<Output = Result<Vec<Candle>>> + Send {
        self.fetch_aggregates(request)
    }
}
