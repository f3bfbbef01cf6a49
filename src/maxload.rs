//! Max-load of a hash function over a key set: `max_y |{x in S : h(x) = y}|`.

use std::collections::HashMap;

use crate::error::Result;
use crate::key::KeySlice;
use crate::matrix::BucketHasher;
use crate::space_saving::{Snapshot, SpaceSaving};

/// Streams `keys` through `hasher` into a Space-Saving tracker of the given capacity.
///
/// Keys are hashed `chunk_size` at a time through the batch path.
pub fn track_max_load<H: BucketHasher + ?Sized>(
    hasher: &H,
    keys: KeySlice<'_>,
    capacity: usize,
    chunk_size: usize,
) -> Result<SpaceSaving> {
    let mut tracker = SpaceSaving::new(capacity);
    let mut buckets = Vec::with_capacity(chunk_size.min(keys.len()));
    for chunk in keys.chunks(chunk_size) {
        buckets.clear();
        hasher.hash_many_into(chunk, &mut buckets)?;
        tracker.ingest_batch(&buckets);
    }
    Ok(tracker)
}

/// Approximate max-load: the tracker's upper bound and its final table.
pub fn estimate_max_load<H: BucketHasher + ?Sized>(
    hasher: &H,
    keys: KeySlice<'_>,
    capacity: usize,
    chunk_size: usize,
) -> Result<(u64, Snapshot)> {
    let tracker = track_max_load(hasher, keys, capacity, chunk_size)?;
    Ok((tracker.upper_bound(), tracker.snapshot()))
}

/// Exact max-load, counting every observed bucket.
///
/// Memory grows with the number of distinct buckets hit, up to `min(|S|, 2^l)`.
pub fn exact_max_load<H: BucketHasher + ?Sized>(hasher: &H, keys: KeySlice<'_>) -> Result<u64> {
    let buckets = hasher.hash_many(keys)?;
    let mut counts: HashMap<u64, u64> = HashMap::with_capacity(buckets.len());
    for bucket in buckets {
        *counts.entry(bucket).or_insert(0) += 1;
    }
    Ok(counts.into_values().max().unwrap_or(0))
}
