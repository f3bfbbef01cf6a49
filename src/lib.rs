//! Empirical max-load of random linear hash functions over F2.
//!
//! A [`BitMatrixHash`] maps u-bit keys to l-bit bucket ids through a random binary matrix.
//! [`SpaceSaving`] tracks the heaviest buckets of a key stream in bounded memory and yields an
//! upper bound on the max-load, and [`TrialRunner`] repeats this over many independent hashes
//! to estimate how often the max-load reaches `ceil(r · ln n / ln ln n)`.
//!
//! ```
//! use f2maxload::{KeySource, KeySet, TrialConfig, TrialRunner};
//!
//! let keys = KeySet::from_u64s(32, 0..4096).unwrap();
//! let runner = TrialRunner::new(TrialConfig::new(32, 8, 16, 256).with_seed(7)).unwrap();
//! let report = runner.run(&KeySource::Fixed(keys), &[1.0, 2.0]).unwrap();
//! assert_eq!(report.completed, 16);
//! ```

mod error;
mod key;
mod matrix;
mod maxload;
mod sampling;
mod space_saving;
mod trial;

pub use error::{Error, Result};
pub use key::{word_count, BitKey, KeySet, KeySlice, WORD_BITS};
pub use matrix::{BitMatrixHash, BucketHasher, HashMatrix, MAX_OUTPUT_BITS};
pub use maxload::{estimate_max_load, exact_max_load, track_max_load};
pub use sampling::Distribution;
pub use space_saving::{Counter, Fill, Snapshot, SpaceSaving};
pub use trial::{
    derive_seeds, threshold, KeySource, TailEstimate, TrialConfig, TrialReport, TrialRunner,
    TrialSeeds, DEFAULT_CHUNK_SIZE,
};
