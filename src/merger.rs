//! Live update merger: the per-view subscription state machine.
//!
//! A [`LiveMerger`] is either [`Idle`](MergerState::Idle) or
//! [`Subscribed`](MergerState::Subscribed) to one (symbol, granularity)
//! pair, in which case it owns that pair's [`SeriesStore`]. Inbound
//! [`RawUpdate`]s are filtered, bucketed and folded into the series:
//!
//! - the first update seen in a bucket sets its `open`,
//! - `high`/`low` are running extrema across the bucket,
//! - `close` is the most recent update's close.
//!
//! Seeding and backfill results come back asynchronously. Each subscription
//! has a generation number and results requested under an older generation
//! are discarded, which is how a granularity switch or teardown cancels
//! work that is still in flight.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bucket::bucket_start;
use crate::models::{Candle, Granularity, RawUpdate};
use crate::series::SeriesStore;

/// Updates held while the initial history fetch is outstanding.
pub const MAX_PENDING_UPDATES: usize = 1024;

/// Current state of a [`LiveMerger`].
#[derive(Debug)]
pub enum MergerState {
    Idle,
    Subscribed(Subscription),
}

/// An active subscription and the series it owns.
#[derive(Debug)]
pub struct Subscription {
    symbol: String,
    granularity: Granularity,
    generation: u64,
    store: SeriesStore,
    seeded: bool,
    pending: VecDeque<Candle>,
    backfill_in_flight: bool,
}

impl Subscription {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    pub fn is_backfill_in_flight(&self) -> bool {
        self.backfill_in_flight
    }

    fn matches(&self, symbol: &str, granularity: Granularity) -> bool {
        self.granularity == granularity && self.symbol.eq_ignore_ascii_case(symbol)
    }
}

/// Asks the caller to fetch the initial history for a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedRequest {
    pub symbol: String,
    pub granularity: Granularity,
    pub generation: u64,
}

/// Asks the caller to fetch history strictly before `before`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillRequest {
    pub symbol: String,
    pub granularity: Granularity,
    pub generation: u64,
    /// Bucket start of the earliest candle currently loaded.
    pub before: i64,
}

/// Why an update was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotSubscribed,
    SymbolMismatch,
    GranularityMismatch,
    Malformed,
}

/// Result of [`LiveMerger::on_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update opened a new bucket.
    Inserted(Candle),
    /// The update was folded into an existing bucket.
    Merged(Candle),
    /// The update is held until the series is seeded.
    Buffered,
    Dropped(DropReason),
}

impl UpdateOutcome {
    /// Returns `true` if the series changed.
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Inserted(_) | UpdateOutcome::Merged(_))
    }
}

/// Result of [`LiveMerger::complete_seed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Seeded { candles: usize, replayed: usize },
    /// The fetch failed; the series starts empty with buffered updates applied.
    Failed { replayed: usize },
    /// The subscription the seed was requested for no longer exists.
    Stale,
}

/// Result of [`LiveMerger::complete_backfill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    Extended { added: usize },
    Failed,
    Stale,
}

/// Per-view owner of the live candle series.
#[derive(Debug)]
pub struct LiveMerger {
    state: MergerState,
    next_generation: u64,
}

impl Default for LiveMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveMerger {
    /// Creates an idle merger.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: MergerState::Idle,
            next_generation: 1,
        }
    }

    pub fn state(&self) -> &MergerState {
        &self.state
    }

    /// Returns the active subscription, if any.
    pub fn subscription(&self) -> Option<&Subscription> {
        match &self.state {
            MergerState::Subscribed(sub) => Some(sub),
            MergerState::Idle => None,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription().is_some()
    }

    /// Current immutable view of the series, or `None` while idle.
    pub fn snapshot(&self) -> Option<Arc<[Candle]>> {
        self.subscription().map(|sub| sub.store.snapshot())
    }

    /// Starts a subscription with a fresh, empty series.
    ///
    /// Any previous subscription is discarded first. The returned request
    /// must be answered with [`complete_seed`](Self::complete_seed).
    pub fn subscribe(&mut self, symbol: &str, granularity: Granularity) -> SeedRequest {
        if let MergerState::Subscribed(previous) = &self.state {
            info!(
                symbol = previous.symbol,
                granularity = %previous.granularity,
                "Replacing existing subscription"
            );
        }

        let generation = self.bump_generation();
        let symbol = symbol.to_uppercase();
        self.state = MergerState::Subscribed(Subscription {
            symbol: symbol.clone(),
            granularity,
            generation,
            store: SeriesStore::new(granularity),
            seeded: false,
            pending: VecDeque::new(),
            backfill_in_flight: false,
        });
        info!(symbol, %granularity, generation, "Subscribed merger");

        SeedRequest {
            symbol,
            granularity,
            generation,
        }
    }

    /// Drops the subscription and its series. No-op while idle.
    pub fn unsubscribe(&mut self) {
        if let MergerState::Subscribed(sub) = std::mem::replace(&mut self.state, MergerState::Idle)
        {
            info!(
                symbol = sub.symbol,
                granularity = %sub.granularity,
                candles = sub.store.len(),
                "Unsubscribed merger"
            );
        }
    }

    /// Replaces the series with an empty one at `granularity` for the same
    /// symbol. Returns `None` while idle.
    pub fn switch_granularity(&mut self, granularity: Granularity) -> Option<SeedRequest> {
        let symbol = self.subscription()?.symbol.clone();
        Some(self.subscribe(&symbol, granularity))
    }

    /// Re-requests the latest history for the current series without
    /// clearing it, after live updates were lost. Returns `None` while idle.
    ///
    /// Updates are buffered again until the new seed lands, and any seed or
    /// backfill still in flight becomes stale.
    pub fn resync(&mut self) -> Option<SeedRequest> {
        if !self.is_subscribed() {
            return None;
        }
        let generation = self.bump_generation();
        let MergerState::Subscribed(sub) = &mut self.state else {
            return None;
        };
        sub.generation = generation;
        sub.seeded = false;
        sub.backfill_in_flight = false;
        info!(
            symbol = sub.symbol,
            granularity = %sub.granularity,
            generation,
            "Resyncing series"
        );

        Some(SeedRequest {
            symbol: sub.symbol.clone(),
            granularity: sub.granularity,
            generation,
        })
    }

    /// Seeds the series from a history fetch, then replays updates that
    /// arrived while the fetch was outstanding.
    pub fn complete_seed(
        &mut self,
        request: &SeedRequest,
        result: crate::Result<Vec<Candle>>,
    ) -> SeedOutcome {
        let Some(sub) = self.current_mut(request.generation) else {
            debug!(
                symbol = request.symbol,
                generation = request.generation,
                "Discarding stale seed"
            );
            return SeedOutcome::Stale;
        };

        let candles = match result {
            Ok(batch) => Some(sub.store.merge_range(batch)),
            Err(e) => {
                warn!(
                    symbol = sub.symbol,
                    granularity = %sub.granularity,
                    "History seed failed: {e}"
                );
                None
            }
        };
        sub.seeded = true;

        let replayed = sub.pending.len();
        while let Some(tick) = sub.pending.pop_front() {
            apply_tick(&mut sub.store, tick);
        }

        match candles {
            Some(candles) => SeedOutcome::Seeded { candles, replayed },
            None => SeedOutcome::Failed { replayed },
        }
    }

    /// Applies one live update to the series.
    ///
    /// Updates for another symbol or granularity are dropped, as are
    /// updates missing `open`/`close` or with an unreadable time. None of
    /// these are errors.
    pub fn on_update(&mut self, update: &RawUpdate) -> UpdateOutcome {
        let MergerState::Subscribed(sub) = &mut self.state else {
            return UpdateOutcome::Dropped(DropReason::NotSubscribed);
        };

        if !sub.symbol.eq_ignore_ascii_case(&update.symbol) {
            return UpdateOutcome::Dropped(DropReason::SymbolMismatch);
        }
        if !sub.matches(&update.symbol, update.granularity) {
            debug!(
                symbol = update.symbol,
                expected = %sub.granularity,
                got = %update.granularity,
                "Dropping update for other granularity"
            );
            return UpdateOutcome::Dropped(DropReason::GranularityMismatch);
        }

        let Some(tick) = update.to_tick() else {
            debug!(symbol = update.symbol, time = ?update.time, "Dropping malformed update");
            return UpdateOutcome::Dropped(DropReason::Malformed);
        };

        if !sub.seeded {
            if sub.pending.len() >= MAX_PENDING_UPDATES {
                sub.pending.pop_front();
                warn!(symbol = sub.symbol, "Pending update buffer full, dropping oldest");
            }
            sub.pending.push_back(tick);
            return UpdateOutcome::Buffered;
        }

        apply_tick(&mut sub.store, tick)
    }

    /// Claims the backfill slot and describes the page to fetch.
    ///
    /// Returns `None` while idle, before seeding, when the series is empty,
    /// or while another backfill is in flight.
    pub fn begin_backfill(&mut self) -> Option<BackfillRequest> {
        let MergerState::Subscribed(sub) = &mut self.state else {
            return None;
        };
        if !sub.seeded || sub.backfill_in_flight {
            return None;
        }
        let before = sub.store.earliest()?.time;

        sub.backfill_in_flight = true;
        debug!(symbol = sub.symbol, before, "Backfill started");
        Some(BackfillRequest {
            symbol: sub.symbol.clone(),
            granularity: sub.granularity,
            generation: sub.generation,
            before,
        })
    }

    /// Applies a backfill page and releases the backfill slot.
    ///
    /// Only candles older than the current earliest candle are added. A
    /// failed fetch leaves the series untouched.
    pub fn complete_backfill(
        &mut self,
        request: &BackfillRequest,
        result: crate::Result<Vec<Candle>>,
    ) -> BackfillOutcome {
        let Some(sub) = self.current_mut(request.generation) else {
            debug!(
                symbol = request.symbol,
                generation = request.generation,
                "Discarding stale backfill"
            );
            return BackfillOutcome::Stale;
        };
        sub.backfill_in_flight = false;

        match result {
            Ok(batch) => {
                let added = sub.store.backfill(batch);
                debug!(symbol = sub.symbol, added, "Backfill applied");
                BackfillOutcome::Extended { added }
            }
            Err(e) => {
                warn!(
                    symbol = sub.symbol,
                    before = request.before,
                    "Backfill fetch failed: {e}"
                );
                BackfillOutcome::Failed
            }
        }
    }

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn current_mut(&mut self, generation: u64) -> Option<&mut Subscription> {
        match &mut self.state {
            MergerState::Subscribed(sub) if sub.generation == generation => Some(sub),
            _ => None,
        }
    }
}

/// Folds a validated tick into its bucket.
fn apply_tick(store: &mut SeriesStore, tick: Candle) -> UpdateOutcome {
    let Some(bucket) = bucket_start(tick.time, store.granularity()) else {
        return UpdateOutcome::Dropped(DropReason::Malformed);
    };

    match store.get(bucket).copied() {
        Some(existing) => {
            let merged = Candle {
                time: bucket,
                open: existing.open,
                high: existing.high.max(tick.high),
                low: existing.low.min(tick.low),
                close: tick.close,
            };
            store.upsert(merged);
            UpdateOutcome::Merged(merged)
        }
        None => {
            let candle = Candle { time: bucket, ..tick };
            store.upsert(candle);
            UpdateOutcome::Inserted(candle)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use crate::PulseError;

    fn update(symbol: &str, granularity: Granularity, time: i64, ohlc: [Decimal; 4]) -> RawUpdate {
        RawUpdate {
            symbol: symbol.to_string(),
            granularity,
            time: time.into(),
            open: Some(ohlc[0]),
            high: Some(ohlc[1]),
            low: Some(ohlc[2]),
            close: Some(ohlc[3]),
        }
    }

    fn seeded(symbol: &str, granularity: Granularity, batch: Vec<Candle>) -> LiveMerger {
        let mut merger = LiveMerger::new();
        let request = merger.subscribe(symbol, granularity);
        merger.complete_seed(&request, Ok(batch));
        merger
    }

    #[test]
    fn starts_idle_and_drops_updates() {
        let mut merger = LiveMerger::new();
        assert!(matches!(merger.state(), MergerState::Idle));
        let outcome = merger.on_update(&update("AAPL", Granularity::Min1, 60, [dec!(1); 4]));
        assert_eq!(outcome, UpdateOutcome::Dropped(DropReason::NotSubscribed));
        assert!(merger.snapshot().is_none());
    }

    #[test]
    fn subscribe_normalizes_symbol() {
        let mut merger = LiveMerger::new();
        let request = merger.subscribe("aapl", Granularity::Min5);
        assert_eq!(request.symbol, "AAPL");
        assert_eq!(merger.subscription().unwrap().symbol(), "AAPL");
    }

    #[test]
    fn symbol_mismatch_is_dropped() {
        let mut merger = seeded("AAPL", Granularity::Min1, vec![]);
        let outcome = merger.on_update(&update("MSFT", Granularity::Min1, 60, [dec!(1); 4]));
        assert_eq!(outcome, UpdateOutcome::Dropped(DropReason::SymbolMismatch));
        assert!(merger.snapshot().unwrap().is_empty());
    }

    #[test]
    fn malformed_update_is_not_zero_filled() {
        let mut merger = seeded("AAPL", Granularity::Min1, vec![]);
        let mut bad = update("AAPL", Granularity::Min1, 60, [dec!(1); 4]);
        bad.open = None;
        assert_eq!(
            merger.on_update(&bad),
            UpdateOutcome::Dropped(DropReason::Malformed)
        );
        assert!(merger.snapshot().unwrap().is_empty());
    }

    #[test]
    fn new_bucket_appends() {
        let mut merger = seeded("AAPL", Granularity::Min1, vec![]);
        let first = update("AAPL", Granularity::Min1, 65, [dec!(1), dec!(2), dec!(1), dec!(2)]);
        merger.on_update(&first);
        let next = update("AAPL", Granularity::Min1, 125, [dec!(2), dec!(3), dec!(2), dec!(3)]);
        let outcome = merger.on_update(&next);
        assert!(matches!(outcome, UpdateOutcome::Inserted(c) if c.time == 120));
        assert_eq!(merger.snapshot().unwrap().len(), 2);
    }

    #[test]
    fn out_of_order_update_lands_in_its_own_bucket() {
        let mut merger = seeded(
            "AAPL",
            Granularity::Min1,
            vec![
                Candle::new(60, dec!(1), dec!(2), dec!(1), dec!(2)),
                Candle::new(120, dec!(2), dec!(3), dec!(2), dec!(3)),
            ],
        );
        let late = update("AAPL", Granularity::Min1, 70, [dec!(9), dec!(9), dec!(0.5), dec!(1.5)]);
        let outcome = merger.on_update(&late);
        assert_eq!(
            outcome,
            UpdateOutcome::Merged(Candle::new(60, dec!(1), dec!(9), dec!(0.5), dec!(1.5)))
        );
        let latest = *merger.subscription().unwrap().store().latest().unwrap();
        assert_eq!(latest, Candle::new(120, dec!(2), dec!(3), dec!(2), dec!(3)));
    }

    #[test]
    fn updates_before_seed_are_replayed_on_top() {
        let mut merger = LiveMerger::new();
        let request = merger.subscribe("AAPL", Granularity::Min1);
        let early = update("AAPL", Granularity::Min1, 130, [dec!(5), dec!(7), dec!(4), dec!(6)]);
        let outcome = merger.on_update(&early);
        assert_eq!(outcome, UpdateOutcome::Buffered);

        let history = vec![Candle::new(120, dec!(5.5), dec!(6), dec!(5), dec!(5.8))];
        let outcome = merger.complete_seed(&request, Ok(history));
        assert_eq!(outcome, SeedOutcome::Seeded { candles: 1, replayed: 1 });

        let snapshot = merger.snapshot().unwrap();
        assert_eq!(*snapshot, [Candle::new(120, dec!(5.5), dec!(7), dec!(4), dec!(6))]);
    }

    #[test]
    fn pending_buffer_is_bounded() {
        let mut merger = LiveMerger::new();
        let request = merger.subscribe("AAPL", Granularity::Min1);
        for i in 0..(MAX_PENDING_UPDATES as i64 + 10) {
            merger.on_update(&update("AAPL", Granularity::Min1, i * 60, [dec!(1); 4]));
        }
        let outcome = merger.complete_seed(&request, Ok(vec![]));
        assert_eq!(
            outcome,
            SeedOutcome::Seeded {
                candles: 0,
                replayed: MAX_PENDING_UPDATES
            }
        );
        assert_eq!(merger.snapshot().unwrap()[0].time, 10 * 60);
    }

    #[test]
    fn failed_seed_still_replays() {
        let mut merger = LiveMerger::new();
        let request = merger.subscribe("AAPL", Granularity::Min1);
        merger.on_update(&update("AAPL", Granularity::Min1, 60, [dec!(1); 4]));
        let outcome = merger.complete_seed(
            &request,
            Err(PulseError::Upstream("boom".to_string())),
        );
        assert_eq!(outcome, SeedOutcome::Failed { replayed: 1 });
        assert_eq!(merger.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn switch_discards_series_and_stale_seed() {
        let mut merger = LiveMerger::new();
        let first = merger.subscribe("AAPL", Granularity::Min1);
        let second = merger.switch_granularity(Granularity::Hour1).unwrap();
        assert!(second.generation > first.generation);
        assert_eq!(second.symbol, "AAPL");

        let stale = merger.complete_seed(
            &first,
            Ok(vec![Candle::new(60, dec!(1), dec!(1), dec!(1), dec!(1))]),
        );
        assert_eq!(stale, SeedOutcome::Stale);
        assert!(merger.snapshot().unwrap().is_empty());
        assert_eq!(
            merger.subscription().unwrap().granularity(),
            Granularity::Hour1
        );
    }

    #[test]
    fn switch_while_idle_does_nothing() {
        let mut merger = LiveMerger::new();
        assert!(merger.switch_granularity(Granularity::Day1).is_none());
    }

    #[test]
    fn unsubscribe_returns_to_idle() {
        let seed = vec![Candle::new(60, dec!(1), dec!(1), dec!(1), dec!(1))];
        let mut merger = seeded("AAPL", Granularity::Min1, seed);
        merger.unsubscribe();
        assert!(!merger.is_subscribed());
        assert!(merger.snapshot().is_none());
        merger.unsubscribe();
    }

    #[test]
    fn backfill_is_serialized() {
        let seed = vec![Candle::new(600, dec!(1), dec!(1), dec!(1), dec!(1))];
        let mut merger = seeded("AAPL", Granularity::Min1, seed);
        let request = merger.begin_backfill().unwrap();
        assert_eq!(request.before, 600);
        assert!(merger.begin_backfill().is_none());

        merger.complete_backfill(&request, Ok(vec![]));
        assert!(merger.begin_backfill().is_some());
    }

    #[test]
    fn backfill_needs_a_seeded_non_empty_series() {
        let mut merger = LiveMerger::new();
        assert!(merger.begin_backfill().is_none());
        let request = merger.subscribe("AAPL", Granularity::Min1);
        assert!(merger.begin_backfill().is_none());
        merger.complete_seed(&request, Ok(vec![]));
        assert!(merger.begin_backfill().is_none());
    }

    #[test]
    fn failed_backfill_leaves_series_and_releases_slot() {
        let seed = vec![Candle::new(600, dec!(1), dec!(1), dec!(1), dec!(1))];
        let mut merger = seeded("AAPL", Granularity::Min1, seed.clone());
        let request = merger.begin_backfill().unwrap();
        let outcome =
            merger.complete_backfill(&request, Err(PulseError::Upstream("503".to_string())));
        assert_eq!(outcome, BackfillOutcome::Failed);
        assert_eq!(&*merger.snapshot().unwrap(), seed.as_slice());
        assert!(!merger.subscription().unwrap().is_backfill_in_flight());
    }

    #[test]
    fn backfill_after_teardown_is_stale() {
        let seed = vec![Candle::new(600, dec!(1), dec!(1), dec!(1), dec!(1))];
        let mut merger = seeded("AAPL", Granularity::Min1, seed);
        let request = merger.begin_backfill().unwrap();
        merger.unsubscribe();
        let outcome = merger.complete_backfill(
            &request,
            Ok(vec![Candle::new(540, dec!(1), dec!(1), dec!(1), dec!(1))]),
        );
        assert_eq!(outcome, BackfillOutcome::Stale);
    }
}
