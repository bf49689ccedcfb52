//! Mapping raw timestamps onto fixed-width candle buckets.
//!
//! All arithmetic is on UTC epoch seconds, so buckets never drift across
//! daylight-saving transitions. Daily buckets start at 00:00 UTC.

use crate::models::Granularity;

/// Returns the start of the bucket containing `timestamp` (unix seconds).
///
/// Uses Euclidean division so pre-epoch timestamps still round down.
/// A timestamp already on a boundary is returned unchanged. Returns `None`
/// when the bucket start is not representable as an `i64`.
pub fn bucket_start(timestamp: i64, granularity: Granularity) -> Option<i64> {
    let interval = granularity.interval_secs();
    timestamp.div_euclid(interval).checked_mul(interval)
}

/// Returns the exclusive end of the bucket containing `timestamp`.
pub fn bucket_end(timestamp: i64, granularity: Granularity) -> Option<i64> {
    bucket_start(timestamp, granularity)?.checked_add(granularity.interval_secs())
}

/// Returns `true` if `timestamp` is a bucket boundary for `granularity`.
pub fn is_aligned(timestamp: i64, granularity: Granularity) -> bool {
    timestamp.rem_euclid(granularity.interval_secs()) == 0
}
