//! Space-Saving estimation of the heaviest bucket.
//!
//! Tracking all 2^l bucket counts is infeasible for large l, so [`SpaceSaving`] keeps at most
//! `k` candidate buckets. When a new bucket arrives and the table is full, the candidate with
//! the smallest count is evicted and the newcomer inherits that count (plus one) together with
//! an error bound equal to it. For every tracked bucket
//!
//! ```text
//! count - error <= true count <= count
//! ```
//!
//! The reported upper bound is the largest tracked count. It can understate the true max load
//! when the heaviest bucket was evicted and never came back; this is the accuracy traded for
//! O(k) memory, not a failure.
//!
//! The minimum is found through a binary heap with lazy deletion: every update pushes a fresh
//! `(count, bucket)` entry and outdated entries are skipped when popped.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::hash::BuildHasherDefault;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::trace;
use xxhash_rust::xxh3::Xxh3;

type BucketMap<V> = HashMap<u64, V, BuildHasherDefault<Xxh3>>;

// Heap entries allowed beyond 2k before stale ones are dropped.
const COMPACT_SLACK: usize = 64;

/// Estimated occurrences of one tracked bucket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Counter {
    /// Observed plus inherited occurrences; never below the true count.
    pub count: u64,
    /// Maximum overcount, inherited from the bucket this one displaced.
    pub error: u64,
}

impl Counter {
    /// Occurrences that are certain to have happened.
    pub fn guaranteed(&self) -> u64 {
        self.count - self.error
    }
}

/// Point-in-time view of a tracker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Snapshot {
    /// Largest tracked count, 0 if nothing is tracked.
    pub upper_bound: u64,
    pub entries: BTreeMap<u64, Counter>,
}

/// Occupancy of the candidate table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fill {
    Empty,
    Filling,
    /// `k` buckets are tracked and new ones evict the minimum.
    Saturated,
}

pub struct SpaceSaving {
    capacity: usize,
    table: BucketMap<Counter>,
    heap: BinaryHeap<Reverse<(u64, u64)>>,
    max_count: u64,
}

impl SpaceSaving {
    /// Creates a tracker holding at most `capacity` buckets.
    ///
    /// A capacity of 0 gives a tracker that ignores its input and always reports 0.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            table: BucketMap::with_capacity_and_hasher(capacity, Default::default()),
            heap: BinaryHeap::with_capacity(2 * capacity),
            max_count: 0,
        }
    }

    /// Records one occurrence of `bucket`.
    pub fn ingest(&mut self, bucket: u64) {
        if self.capacity == 0 {
            return;
        }

        if let Some(counter) = self.table.get_mut(&bucket) {
            counter.count += 1;
            let count = counter.count;
            self.push(count, bucket);
            return;
        }

        if self.table.len() < self.capacity {
            self.table.insert(bucket, Counter { count: 1, error: 0 });
            self.push(1, bucket);
            return;
        }

        let (min_count, evicted) = self.pop_min();
        self.table.remove(&evicted);
        let counter = Counter {
            count: min_count + 1,
            error: min_count,
        };
        self.table.insert(bucket, counter);
        self.push(counter.count, bucket);
    }

    /// Records every bucket in order; same result as calling [`Self::ingest`] on each.
    pub fn ingest_batch(&mut self, buckets: &[u64]) {
        for &bucket in buckets {
            self.ingest(bucket);
        }
    }

    /// Like [`Self::ingest_batch`], walking the input `chunk_size` items at a time.
    ///
    /// The chunk size only affects throughput, never the result.
    pub fn ingest_chunked(&mut self, buckets: &[u64], chunk_size: usize) {
        for chunk in buckets.chunks(chunk_size.max(1)) {
            self.ingest_batch(chunk);
        }
    }

    fn push(&mut self, count: u64, bucket: u64) {
        self.max_count = self.max_count.max(count);
        self.heap.push(Reverse((count, bucket)));
        if self.heap.len() > 2 * self.capacity + COMPACT_SLACK {
            self.compact();
        }
    }

    /// Rebuilds the heap from the table, dropping every stale entry.
    fn compact(&mut self) {
        let before = self.heap.len();
        self.heap = self
            .table
            .iter()
            .map(|(&bucket, counter)| Reverse((counter.count, bucket)))
            .collect();
        trace!(before, after = self.heap.len(), "space-saving heap compacted");
    }

    /// Pops heap entries until one matches the table, returning `(count, bucket)`.
    fn pop_min(&mut self) -> (u64, u64) {
        while let Some(Reverse((count, bucket))) = self.heap.pop() {
            if self.table.get(&bucket).map(|c| c.count) == Some(count) {
                return (count, bucket);
            }
        }
        // every tracked bucket has its current state in the heap
        unreachable!("space-saving heap has no entry for a non-empty table")
    }

    /// Largest tracked count.
    pub fn upper_bound(&self) -> u64 {
        self.max_count
    }

    pub fn get(&self, bucket: u64) -> Option<Counter> {
        self.table.get(&bucket).copied()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fill(&self) -> Fill {
        match self.table.len() {
            0 => Fill::Empty,
            n if n < self.capacity => Fill::Filling,
            _ => Fill::Saturated,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            upper_bound: self.max_count,
            entries: self.table.iter().map(|(&b, &c)| (b, c)).collect(),
        }
    }
}

impl Extend<u64> for SpaceSaving {
    fn extend<I: IntoIterator<Item = u64>>(&mut self, iter: I) {
        for bucket in iter {
            self.ingest(bucket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn true_counts(stream: &[u64]) -> HashMap<u64, u64> {
        let mut counts = HashMap::new();
        for &b in stream {
            *counts.entry(b).or_insert(0) += 1;
        }
        counts
    }

    /// Space-Saving without a heap: linear scan for the minimum with the same tie-breaking.
    fn naive(stream: &[u64], k: usize) -> BTreeMap<u64, Counter> {
        let mut table: BTreeMap<u64, Counter> = BTreeMap::new();
        if k == 0 {
            return table;
        }
        for &b in stream {
            if let Some(c) = table.get_mut(&b) {
                c.count += 1;
            } else if table.len() < k {
                table.insert(b, Counter { count: 1, error: 0 });
            } else {
                let (&victim, &min) = table
                    .iter()
                    .min_by_key(|(bucket, c)| (c.count, **bucket))
                    .unwrap();
                table.remove(&victim);
                table.insert(
                    b,
                    Counter {
                        count: min.count + 1,
                        error: min.count,
                    },
                );
            }
        }
        table
    }

    fn skewed_stream(seed: u64, len: usize, domain: u64) -> Vec<u64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len)
            .map(|_| {
                // squaring biases towards small bucket ids
                let x: f64 = rng.gen();
                ((x * x) * domain as f64) as u64
            })
            .collect()
    }

    #[test]
    fn test_hand_traced_stream() {
        let mut ss = SpaceSaving::new(2);
        ss.ingest_batch(&[7, 7, 3, 9, 3, 5]);

        let snapshot = ss.snapshot();
        let expected: BTreeMap<u64, Counter> = [
            (3, Counter { count: 3, error: 2 }),
            (5, Counter { count: 3, error: 2 }),
        ]
        .into_iter()
        .collect();
        assert_eq!(snapshot.entries, expected);
        assert_eq!(snapshot.upper_bound, 3);
        assert_eq!(snapshot.entries, naive(&[7, 7, 3, 9, 3, 5], 2));
    }

    #[test]
    fn test_step_by_step_states() {
        let mut ss = SpaceSaving::new(2);
        assert_eq!(ss.fill(), Fill::Empty);

        ss.ingest(7);
        assert_eq!(ss.get(7), Some(Counter { count: 1, error: 0 }));
        assert_eq!(ss.fill(), Fill::Filling);
        ss.ingest(7);
        assert_eq!(ss.get(7), Some(Counter { count: 2, error: 0 }));
        ss.ingest(3);
        assert_eq!(ss.fill(), Fill::Saturated);

        // 3 holds the minimum count, so 9 replaces it
        ss.ingest(9);
        assert_eq!(ss.get(3), None);
        assert_eq!(ss.get(9), Some(Counter { count: 2, error: 1 }));

        // (2, 7) and (2, 9) tie, the smaller id goes
        ss.ingest(3);
        assert_eq!(ss.get(7), None);
        assert_eq!(ss.get(3), Some(Counter { count: 3, error: 2 }));
        assert_eq!(ss.fill(), Fill::Saturated);
    }

    #[test]
    fn test_zero_capacity() {
        let mut ss = SpaceSaving::new(0);
        ss.ingest_batch(&[1, 2, 3, 3]);
        assert_eq!(ss.upper_bound(), 0);
        assert_eq!(ss.snapshot(), Snapshot::default());
        assert!(ss.is_empty());
    }

    #[test]
    fn test_empty_snapshot() {
        let ss = SpaceSaving::new(10);
        assert_eq!(ss.snapshot().upper_bound, 0);
        assert!(ss.snapshot().entries.is_empty());
    }

    #[test]
    fn test_exact_when_capacity_covers_domain() {
        let stream = skewed_stream(1, 5_000, 200);
        let mut ss = SpaceSaving::new(200);
        ss.extend(stream.iter().copied());
        let counts = true_counts(&stream);
        for (bucket, counter) in ss.snapshot().entries {
            assert_eq!(counter.error, 0);
            assert_eq!(counter.count, counts[&bucket]);
        }
        assert_eq!(ss.upper_bound(), *counts.values().max().unwrap());
    }

    #[test]
    fn test_heap_stays_bounded() {
        let mut ss = SpaceSaving::new(16);
        for i in 0..100_000u64 {
            ss.ingest(i % 40);
            assert!(ss.heap.len() <= 2 * 16 + COMPACT_SLACK);
        }
        assert_eq!(ss.len(), 16);
    }

    #[test]
    fn test_heavy_bucket_survives() {
        let mut stream = skewed_stream(9, 20_000, 1 << 20);
        for i in 0..2_000 {
            stream[i * 10] = 424_242;
        }
        let mut ss = SpaceSaving::new(64);
        ss.ingest_batch(&stream);
        let tracked = ss.get(424_242).expect("heavy bucket evicted");
        let truth = true_counts(&stream)[&424_242];
        assert!(tracked.guaranteed() <= truth && truth <= tracked.count);
        assert!(ss.upper_bound() >= truth);
    }

    proptest! {
        #[test]
        fn prop_bounds_hold(stream in proptest::collection::vec(0u64..50, 0..400), k in 1usize..20) {
            let mut ss = SpaceSaving::new(k);
            ss.ingest_batch(&stream);
            let counts = true_counts(&stream);
            let snapshot = ss.snapshot();
            for (bucket, counter) in &snapshot.entries {
                let truth = counts.get(bucket).copied().unwrap_or(0);
                prop_assert!(counter.count >= truth);
                prop_assert!(counter.count - counter.error <= truth);
            }
            let max = snapshot.entries.values().map(|c| c.count).max().unwrap_or(0);
            prop_assert_eq!(snapshot.upper_bound, max);
            prop_assert!(snapshot.entries.len() <= k);
            prop_assert_eq!(snapshot.entries.len(), counts.len().min(k));
        }

        #[test]
        fn prop_matches_naive_scan(stream in proptest::collection::vec(0u64..30, 0..300), k in 0usize..12) {
            let mut ss = SpaceSaving::new(k);
            ss.ingest_batch(&stream);
            prop_assert_eq!(ss.snapshot().entries, naive(&stream, k));
        }

        #[test]
        fn prop_capacity_reached_and_kept(stream in proptest::collection::vec(0u64..1000, 1..500), k in 1usize..30) {
            let mut ss = SpaceSaving::new(k);
            let mut distinct = std::collections::HashSet::new();
            for &b in &stream {
                ss.ingest(b);
                distinct.insert(b);
                if distinct.len() >= k {
                    prop_assert_eq!(ss.len(), k);
                    prop_assert_eq!(ss.fill(), Fill::Saturated);
                }
            }
        }

        #[test]
        fn prop_chunking_invariant(seed in any::<u64>(), k in 1usize..64) {
            let stream = skewed_stream(seed, 2_000, 500);
            let mut reference = SpaceSaving::new(k);
            reference.ingest_batch(&stream);
            for chunk in [1, 100, stream.len()] {
                let mut ss = SpaceSaving::new(k);
                ss.ingest_chunked(&stream, chunk);
                prop_assert_eq!(ss.snapshot(), reference.snapshot());
            }
        }
    }
}
