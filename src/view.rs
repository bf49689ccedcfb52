//! Per-view driver tying the merger to history fetches and the live feed.
//!
//! [`StockView::open`] spawns one task per chart view. The task owns the
//! view's [`LiveMerger`] outright, so every mutation of the series happens
//! on that single task and no locking is needed. The renderer talks to it
//! through a [`ViewHandle`]: snapshots flow out on a watch channel, and
//! backfill / granularity switch / close requests flow in on a command
//! channel.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::history::{HistoryRequest, HistorySource};
use crate::merger::{BackfillOutcome, BackfillRequest, LiveMerger, SeedOutcome, SeedRequest};
use crate::models::aggs::MarketStatus;
use crate::models::{Candle, Granularity};
use crate::websocket::{FeedEvent, FeedHandle};

/// What the renderer receives after every change.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSnapshot {
    pub symbol: String,
    pub granularity: Granularity,
    /// Ascending by time, never mutated after publication.
    pub candles: Arc<[Candle]>,
}

/// Requests from the renderer to its view task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewCommand {
    /// The viewport is approaching the earliest loaded candle.
    Backfill,
    SwitchGranularity(Granularity),
    Close,
}

/// Renderer-side handle to a running view.
#[derive(Debug)]
pub struct ViewHandle {
    commands: mpsc::UnboundedSender<ViewCommand>,
    snapshots: watch::Receiver<SeriesSnapshot>,
    task: JoinHandle<()>,
}

impl ViewHandle {
    /// Returns a receiver that observes every published snapshot.
    pub fn snapshots(&self) -> watch::Receiver<SeriesSnapshot> {
        self.snapshots.clone()
    }

    /// Returns the latest published snapshot.
    pub fn current(&self) -> SeriesSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Asks for one page of older history. Ignored while a page is in flight.
    pub fn request_backfill(&self) {
        let _ = self.commands.send(ViewCommand::Backfill);
    }

    pub fn switch_granularity(&self, granularity: Granularity) {
        let _ = self.commands.send(ViewCommand::SwitchGranularity(granularity));
    }

    /// Tears the view down and waits for its task to finish.
    pub async fn close(self) {
        let _ = self.commands.send(ViewCommand::Close);
        if let Err(e) = self.task.await {
            warn!("View task ended abnormally: {e}");
        }
    }
}

/// A completed history fetch, tagged with the request it answers.
enum Fetched {
    Seed(SeedRequest, crate::Result<Vec<Candle>>),
    Backfill(BackfillRequest, crate::Result<Vec<Candle>>),
}

/// The state owned by one view task.
pub struct StockView<H: HistorySource> {
    symbol: String,
    merger: LiveMerger,
    history: Arc<H>,
    feed: FeedHandle,
    events: Option<broadcast::Receiver<FeedEvent>>,
    snapshots: watch::Sender<SeriesSnapshot>,
    fetches: FuturesUnordered<BoxFuture<'static, Fetched>>,
}

impl<H: HistorySource> StockView<H> {
    /// Opens a chart view for `symbol` at `granularity` and spawns its task.
    ///
    /// The live feed is joined before the history fetch starts so updates
    /// arriving in between are buffered rather than lost. While the market
    /// is closed the view is seeded from history only and never registers
    /// with the feed.
    pub fn open(
        symbol: &str,
        granularity: Granularity,
        history: Arc<H>,
        feed: &FeedHandle,
        market: MarketStatus,
    ) -> ViewHandle {
        let symbol = symbol.to_uppercase();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SeriesSnapshot {
            symbol: symbol.clone(),
            granularity,
            candles: Arc::from(Vec::new()),
        });

        let events = if market.is_closed() {
            info!(symbol, "Market closed, skipping live feed");
            None
        } else {
            Some(feed.subscribe_events())
        };

        let mut view = StockView {
            symbol,
            merger: LiveMerger::new(),
            history,
            feed: feed.clone(),
            events,
            snapshots: snapshot_tx,
            fetches: FuturesUnordered::new(),
        };
        view.start(granularity);

        ViewHandle {
            commands: cmd_tx,
            snapshots: snapshot_rx,
            task: tokio::spawn(view.run(cmd_rx)),
        }
    }

    fn is_live(&self) -> bool {
        self.events.is_some()
    }

    /// Subscribes the merger at `granularity` and queues the seed fetch.
    fn start(&mut self, granularity: Granularity) {
        let seed = self.merger.subscribe(&self.symbol, granularity);
        if self.is_live() {
            self.feed.track(&self.symbol, granularity);
        }
        self.queue_seed(seed);
        self.publish();
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ViewCommand>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(ViewCommand::Backfill) => self.backfill(),
                    Some(ViewCommand::SwitchGranularity(granularity)) => {
                        self.switch_granularity(granularity);
                    }
                    Some(ViewCommand::Close) | None => break,
                },

                event = next_event(&mut self.events) => self.handle_event(event),

                Some(done) = self.fetches.next(), if !self.fetches.is_empty() => {
                    self.handle_fetched(done);
                }
            }
        }

        self.teardown();
    }

    fn handle_event(&mut self, event: Result<FeedEvent, RecvError>) {
        match event {
            Ok(FeedEvent::Update(update)) => {
                if self.merger.on_update(&update).is_applied() {
                    self.publish();
                }
            }
            Ok(FeedEvent::Connected) => debug!(symbol = self.symbol, "Feed connected"),
            Ok(FeedEvent::Disconnected) => debug!(symbol = self.symbol, "Feed disconnected"),
            Err(RecvError::Lagged(missed)) => {
                warn!(symbol = self.symbol, missed, "View lagged behind the feed");
                if let Some(seed) = self.merger.resync() {
                    self.queue_seed(seed);
                }
            }
            Err(RecvError::Closed) => {
                warn!(symbol = self.symbol, "Feed closed, continuing without live updates");
                self.events = None;
            }
        }
    }

    fn handle_fetched(&mut self, done: Fetched) {
        match done {
            Fetched::Seed(request, result) => match self.merger.complete_seed(&request, result) {
                SeedOutcome::Stale => {}
                outcome => {
                    info!(symbol = self.symbol, ?outcome, "Series seeded");
                    self.publish();
                }
            },
            Fetched::Backfill(request, result) => {
                if let BackfillOutcome::Extended { added } =
                    self.merger.complete_backfill(&request, result)
                    && added > 0
                {
                    self.publish();
                }
            }
        }
    }

    fn backfill(&mut self) {
        match self.merger.begin_backfill() {
            Some(request) => {
                let fetch =
                    fetch_history(Arc::clone(&self.history), HistoryRequest::from(&request));
                self.fetches
                    .push(Box::pin(async move { Fetched::Backfill(request, fetch.await) }));
            }
            None => debug!(symbol = self.symbol, "Backfill request ignored"),
        }
    }

    fn switch_granularity(&mut self, granularity: Granularity) {
        let Some(current) = self.merger.subscription().map(|sub| sub.granularity()) else {
            return;
        };
        if current == granularity {
            return;
        }
        info!(symbol = self.symbol, from = %current, to = %granularity, "Switching granularity");
        // Track the new route before releasing the old one so the wire
        // subscription never drops to zero in between.
        self.start(granularity);
        if self.is_live() {
            self.feed.untrack(&self.symbol, current);
        }
    }

    fn queue_seed(&mut self, seed: SeedRequest) {
        let fetch = fetch_history(Arc::clone(&self.history), HistoryRequest::from(&seed));
        self.fetches
            .push(Box::pin(async move { Fetched::Seed(seed, fetch.await) }));
    }

    fn publish(&self) {
        let Some(sub) = self.merger.subscription() else {
            return;
        };
        self.snapshots.send_replace(SeriesSnapshot {
            symbol: self.symbol.clone(),
            granularity: sub.granularity(),
            candles: sub.store().snapshot(),
        });
    }

    /// Leaves the feed and drops the series; pending fetches are dropped
    /// with `self`, so their results never land anywhere.
    fn teardown(mut self) {
        if let Some(granularity) = self.merger.subscription().map(|sub| sub.granularity())
            && self.is_live()
        {
            self.feed.untrack(&self.symbol, granularity);
        }
        self.merger.unsubscribe();
        info!(
            symbol = self.symbol,
            cancelled_fetches = self.fetches.len(),
            "View closed"
        );
    }
}

/// Runs one history request on an owned handle to the source.
async fn fetch_history<H: HistorySource>(
    history: Arc<H>,
    request: HistoryRequest,
) -> crate::Result<Vec<Candle>> {
    history.fetch(&request).await
}

/// Waits for the next feed event, or forever when not attached to the feed.
async fn next_event(
    events: &mut Option<broadcast::Receiver<FeedEvent>>,
) -> Result<FeedEvent, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
