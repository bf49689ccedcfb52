//! Shared test utilities: fixtures, candle builders and a scripted history source.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::{Semaphore, watch};

use stockpulse::history::{HistoryRequest, HistorySource};
use stockpulse::models::{Candle, Granularity, RawUpdate};
use stockpulse::view::SeriesSnapshot;
use stockpulse::{PulseError, Result};

pub const AGGREGATE_FRAME_JSON: &str = include_str!("../fixtures/aggregate_frame.json");
pub const AGGS_HISTORY_JSON: &str = include_str!("../fixtures/aggs_history.json");
pub const AGGS_ERROR_JSON: &str = include_str!("../fixtures/aggs_error.json");
pub const MARKET_STATUS_JSON: &str = include_str!("../fixtures/market_status.json");

/// How long async tests wait for a snapshot before failing.
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(2);

pub fn candle(time: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
    Candle::new(time, open, high, low, close)
}

/// A flat candle where every price equals `price`.
pub fn flat(time: i64, price: Decimal) -> Candle {
    Candle::new(time, price, price, price, price)
}

pub fn update(
    symbol: &str,
    granularity: Granularity,
    time: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
) -> RawUpdate {
    RawUpdate {
        symbol: symbol.to_string(),
        granularity,
        time: time.into(),
        open: Some(open),
        high: Some(high),
        low: Some(low),
        close: Some(close),
    }
}

/// Waits until a published snapshot satisfies `ready`.
pub async fn wait_for_snapshot<F>(
    snapshots: &mut watch::Receiver<SeriesSnapshot>,
    ready: F,
) -> SeriesSnapshot
where
    F: FnMut(&SeriesSnapshot) -> bool,
{
    let snapshot = tokio::time::timeout(SNAPSHOT_TIMEOUT, snapshots.wait_for(ready))
        .await
        .expect("timed out waiting for snapshot")
        .expect("view closed before snapshot");
    snapshot.clone()
}

/// History pages per granularity.
#[derive(Debug, Default, Clone)]
struct Pages {
    latest: Vec<Candle>,
    older: Vec<Candle>,
}

/// In-memory [`HistorySource`] with scripted pages.
///
/// Requests without a range get the `latest` page. Ranged requests get the
/// `older` candles inside the range. Fetches can be held back with
/// [`gated`](FakeHistory::gated) until [`release`](FakeHistory::release).
#[derive(Debug, Default)]
pub struct FakeHistory {
    pages: Mutex<HashMap<Granularity, Pages>>,
    requests: Mutex<Vec<HistoryRequest>>,
    failing: AtomicBool,
    gate: Option<Arc<Semaphore>>,
}

impl FakeHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch waits for a [`release`](Self::release) before answering.
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn with_latest(self, granularity: Granularity, candles: Vec<Candle>) -> Self {
        self.pages
            .lock()
            .unwrap()
            .entry(granularity)
            .or_default()
            .latest = candles;
        self
    }

    pub fn with_older(self, granularity: Granularity, candles: Vec<Candle>) -> Self {
        self.pages
            .lock()
            .unwrap()
            .entry(granularity)
            .or_default()
            .older = candles;
        self
    }

    pub fn failing(self) -> Self {
        self.failing.store(true, Ordering::SeqCst);
        self
    }

    /// Lets `fetches` gated fetches complete.
    pub fn release(&self, fetches: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(fetches);
        }
    }

    pub fn requests(&self) -> Vec<HistoryRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HistorySource for FakeHistory {
    fn fetch(&self, request: &HistoryRequest) -> impl Future<Output = Result<Vec<Candle>>> + Send {
        self.requests.lock().unwrap().push(request.clone());

        let pages = self
            .pages
            .lock()
            .unwrap()
            .get(&request.granularity)
            .cloned()
            .unwrap_or_default();
        let candles: Vec<Candle> = match request.range {
            None => pages.latest,
            Some(range) => pages
                .older
                .into_iter()
                .filter(|c| c.time >= range.from && c.time <= range.to)
                .collect(),
        };
        let failing = self.failing.load(Ordering::SeqCst);
        let gate = self.gate.clone();

        async move {
            if let Some(gate) = gate {
                gate.acquire().await.expect("gate closed").forget();
            }
            if failing {
                Err(PulseError::Upstream("scripted failure".to_string()))
            } else {
                Ok(candles)
            }
        }
    }
}
