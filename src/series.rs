//! Canonical, deduplicated candle series for one (symbol, granularity).
//!
//! Candles are kept in a [`BTreeMap`] keyed by bucket start, so lookup and
//! upsert are O(log n) and iteration is always ascending with no duplicate
//! times.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::bucket::bucket_start;
use crate::models::{Candle, Granularity};

/// What an [`SeriesStore::upsert`] did to the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// No candle existed at this time.
    Inserted,
    /// A different candle at this time was replaced.
    Replaced,
    /// An identical candle was already present.
    Unchanged,
    /// The time has no representable bucket; nothing was stored.
    OutOfRange,
}

impl Upsert {
    /// Returns `true` if the series content changed.
    pub fn is_change(self) -> bool {
        matches!(self, Upsert::Inserted | Upsert::Replaced)
    }
}

/// Ordered candle storage for a single granularity.
#[derive(Debug, Clone)]
pub struct SeriesStore {
    granularity: Granularity,
    candles: BTreeMap<i64, Candle>,
}

impl SeriesStore {
    /// Creates an empty series.
    #[must_use]
    pub fn new(granularity: Granularity) -> Self {
        Self {
            granularity,
            candles: BTreeMap::new(),
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Returns the candle whose bucket contains `time`.
    pub fn get(&self, time: i64) -> Option<&Candle> {
        self.candles.get(&bucket_start(time, self.granularity)?)
    }

    pub fn earliest(&self) -> Option<&Candle> {
        self.candles.values().next()
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.candles.values().next_back()
    }

    /// Inserts `candle`, replacing any candle in the same bucket
    /// (last write wins).
    ///
    /// A time that is not on a bucket boundary is moved to the start of its
    /// bucket first, so the series never holds two candles for one bucket.
    pub fn upsert(&mut self, mut candle: Candle) -> Upsert {
        let Some(aligned) = bucket_start(candle.time, self.granularity) else {
            debug!(time = candle.time, "Rejecting candle outside the bucketable range");
            return Upsert::OutOfRange;
        };
        if aligned != candle.time {
            debug!(
                time = candle.time,
                aligned,
                granularity = %self.granularity,
                "Aligning candle to bucket start"
            );
            candle.time = aligned;
        }

        match self.candles.insert(aligned, candle) {
            None => Upsert::Inserted,
            Some(previous) if previous == candle => Upsert::Unchanged,
            Some(_) => Upsert::Replaced,
        }
    }

    /// Upserts every candle in `batch`; the result is the union keyed by
    /// time. Input order does not matter.
    ///
    /// Returns how many buckets were inserted or changed, so merging an
    /// already-ingested batch again returns `0`.
    pub fn merge_range<I>(&mut self, batch: I) -> usize
    where
        I: IntoIterator<Item = Candle>,
    {
        batch
            .into_iter()
            .map(|candle| self.upsert(candle))
            .filter(|outcome| outcome.is_change())
            .count()
    }

    /// Fills history strictly before the current earliest candle.
    ///
    /// Candles at or after the earliest known bucket are ignored, so a
    /// backfill page can never overwrite the live edge. On an empty series
    /// this is the same as [`merge_range`](Self::merge_range).
    ///
    /// Returns the number of candles added.
    pub fn backfill<I>(&mut self, batch: I) -> usize
    where
        I: IntoIterator<Item = Candle>,
    {
        let Some(cutoff) = self.earliest().map(|c| c.time) else {
            return self.merge_range(batch);
        };

        let granularity = self.granularity;
        batch
            .into_iter()
            .filter(|candle| {
                bucket_start(candle.time, granularity).is_some_and(|bucket| bucket < cutoff)
            })
            .map(|candle| self.upsert(candle))
            .filter(|outcome| outcome.is_change())
            .count()
    }

    /// Returns an immutable ascending copy of the series for rendering.
    pub fn snapshot(&self) -> Arc<[Candle]> {
        self.candles.values().copied().collect()
    }
}
