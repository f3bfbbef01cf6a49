//! Monte-Carlo trials: how often does a random linear hash overload a bucket?
//!
//! Each trial draws a fresh matrix (and, for generated key sources, a fresh key set), estimates
//! the max-load with a Space-Saving tracker and compares it against
//! `T(l, r) = ceil(r · ln n / ln ln n)` with `n = 2^l`. The fraction of trials reaching `T` is
//! the empirical tail probability.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::key::{fits, KeySet};
use crate::matrix::{BitMatrixHash, BucketHasher, MAX_OUTPUT_BITS};
use crate::maxload::track_max_load;
use crate::sampling::Distribution;
use crate::space_saving::SpaceSaving;

/// Keys hashed per batch unless configured otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 16_384;

/// `ceil(r · ln n / ln ln n)` for `n = 2^l`, floored at 0.
///
/// For `l = 1` (`ln ln n < 0`) or `r <= 0` the quotient is not positive, the threshold is 0 and
/// every trial reaches it. `r` must be finite.
pub fn threshold(l: usize, r: f64) -> Result<u64> {
    if l == 0 {
        return Err(Error::config("l must be positive"));
    }
    if !r.is_finite() {
        return Err(Error::config(format!("r must be finite, got {r}")));
    }
    let ln_n = l as f64 * std::f64::consts::LN_2;
    let t = (r * ln_n / ln_n.ln()).ceil();
    Ok(if t > 0.0 { t as u64 } else { 0 })
}

/// Parameters shared by every trial of a run.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrialConfig {
    /// Key width in bits.
    pub u: usize,
    /// Bucket id width in bits; the table has 2^l buckets.
    pub l: usize,
    pub trials: usize,
    /// Space-Saving table size k.
    pub capacity: usize,
    pub chunk_size: usize,
    /// Worker threads; 0 runs on the current rayon pool.
    pub threads: usize,
    /// Master seed all per-trial seeds are derived from.
    pub seed: u64,
}

impl TrialConfig {
    pub fn new(u: usize, l: usize, trials: usize, capacity: usize) -> Self {
        Self {
            u,
            l,
            trials,
            capacity,
            chunk_size: DEFAULT_CHUNK_SIZE,
            threads: 0,
            seed: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.u == 0 || self.l == 0 {
            return Err(Error::config(format!(
                "u and l must be positive, got u={}, l={}",
                self.u, self.l
            )));
        }
        if self.l > MAX_OUTPUT_BITS {
            return Err(Error::config(format!(
                "l must be at most {MAX_OUTPUT_BITS}, got {}",
                self.l
            )));
        }
        if self.trials == 0 {
            return Err(Error::config("trial count must be positive"));
        }
        if self.capacity == 0 {
            return Err(Error::config("capacity k must be positive"));
        }
        if self.chunk_size == 0 {
            return Err(Error::config("chunk size must be positive"));
        }
        Ok(())
    }
}

/// Where a trial's keys come from.
#[derive(Clone, Debug)]
pub enum KeySource {
    /// The same key set for every trial; only the hash varies.
    Fixed(KeySet),
    /// `count` keys drawn afresh in every trial from the trial's own key seed.
    Generated {
        distribution: Distribution,
        count: usize,
    },
}

impl KeySource {
    fn validate(&self, u: usize) -> Result<()> {
        match self {
            Self::Fixed(keys) => {
                if keys.bits() > u && keys.iter().any(|key| !fits(key, u)) {
                    return Err(Error::Domain { bits: u });
                }
                Ok(())
            }
            Self::Generated { distribution, .. } => distribution.validate(u),
        }
    }
}

/// Seeds of one trial.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrialSeeds {
    pub hash: u64,
    pub keys: u64,
}

/// Draws one `(hash, keys)` seed pair per trial from a generator seeded with `master`.
pub fn derive_seeds(master: u64, trials: usize) -> Vec<TrialSeeds> {
    let mut rng = StdRng::seed_from_u64(master);
    (0..trials)
        .map(|_| TrialSeeds {
            hash: rng.gen(),
            keys: rng.gen(),
        })
        .collect()
}

/// Empirical tail probability for one threshold multiplier.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TailEstimate {
    pub r: f64,
    pub threshold: u64,
    /// Completed trials whose estimated max-load reached the threshold.
    pub exceed_count: usize,
    /// `exceed_count / completed`, 0 when no trial completed.
    pub probability: f64,
}

/// Outcome of [`TrialRunner::run`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrialReport {
    pub u: usize,
    pub l: usize,
    pub trials: usize,
    pub completed: usize,
    /// True if cancellation skipped at least one trial.
    pub cancelled: bool,
    /// Estimated max-load per trial number; `None` for skipped trials.
    pub max_loads: Vec<Option<u64>>,
    pub tail: Vec<TailEstimate>,
}

impl TrialReport {
    pub fn completed_max_loads(&self) -> impl Iterator<Item = u64> + '_ {
        self.max_loads.iter().flatten().copied()
    }

    /// Tail probability recorded for `r`, if `r` was part of the run.
    pub fn probability(&self, r: f64) -> Option<f64> {
        self.tail.iter().find(|t| t.r == r).map(|t| t.probability)
    }

    /// Serializes the report with bincode.
    #[cfg(feature = "serde")]
    pub fn save<W: std::io::Write>(&self, mut writer: W) -> std::io::Result<()> {
        bincode::serialize_into(&mut writer, &self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    /// Loads a report written by [`Self::save`].
    #[cfg(feature = "serde")]
    pub fn load<R: std::io::Read>(mut reader: R) -> std::io::Result<Self> {
        let report: TrialReport = bincode::deserialize_from(&mut reader)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        if report.max_loads.len() != report.trials {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "trial report has a mismatched result count",
            ));
        }
        Ok(report)
    }
}

/// Runs independent max-load trials in parallel.
pub struct TrialRunner {
    config: TrialConfig,
    cancel: Arc<AtomicBool>,
    finished: Arc<AtomicUsize>,
}

impl TrialRunner {
    pub fn new(config: TrialConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn config(&self) -> &TrialConfig {
        &self.config
    }

    /// Flag that stops trials which have not started yet. Running trials finish.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Counter of trials finished by the current run; reset when a run starts.
    pub fn progress_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.finished)
    }

    /// Runs every trial and aggregates exceedances for each `r`.
    ///
    /// The key source and all thresholds are checked before any trial starts.
    pub fn run(&self, source: &KeySource, r_values: &[f64]) -> Result<TrialReport> {
        let cfg = &self.config;
        source.validate(cfg.u)?;
        let thresholds = r_values
            .iter()
            .map(|&r| threshold(cfg.l, r).map(|t| (r, t)))
            .collect::<Result<Vec<_>>>()?;

        info!(
            u = cfg.u,
            l = cfg.l,
            trials = cfg.trials,
            capacity = cfg.capacity,
            fixed_keys = matches!(source, KeySource::Fixed(_)),
            "starting max-load trials"
        );

        let seeds = derive_seeds(cfg.seed, cfg.trials);
        self.finished.store(0, Ordering::Relaxed);
        let max_loads = self.execute(source, &seeds)?;

        let completed = max_loads.iter().flatten().count();
        let cancelled = completed < cfg.trials;
        if cancelled {
            warn!(completed, trials = cfg.trials, "run cancelled");
        }

        let tail: Vec<TailEstimate> = thresholds
            .into_iter()
            .map(|(r, threshold)| {
                let exceed_count = max_loads
                    .iter()
                    .flatten()
                    .filter(|&&load| load >= threshold)
                    .count();
                let probability = if completed == 0 {
                    0.0
                } else {
                    exceed_count as f64 / completed as f64
                };
                TailEstimate {
                    r,
                    threshold,
                    exceed_count,
                    probability,
                }
            })
            .collect();

        for t in &tail {
            info!(
                r = t.r,
                threshold = t.threshold,
                exceed = t.exceed_count,
                p = t.probability,
                "tail estimate"
            );
        }

        Ok(TrialReport {
            u: cfg.u,
            l: cfg.l,
            trials: cfg.trials,
            completed,
            cancelled,
            max_loads,
            tail,
        })
    }

    fn execute(&self, source: &KeySource, seeds: &[TrialSeeds]) -> Result<Vec<Option<u64>>> {
        let work = || {
            seeds
                .par_iter()
                .enumerate()
                .map(|(trial, &seeds)| -> Result<Option<u64>> {
                    if self.cancel.load(Ordering::Relaxed) {
                        return Ok(None);
                    }
                    let max_load = self.run_trial(source, seeds)?;
                    self.finished.fetch_add(1, Ordering::Relaxed);
                    debug!(trial, max_load, "trial finished");
                    Ok(Some(max_load))
                })
                .collect::<Result<Vec<_>>>()
        };

        if self.config.threads == 0 {
            return work();
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.threads)
            .build()
            .map_err(|e| Error::WorkerPool(e.to_string()))?;
        pool.install(work)
    }

    /// Runs a single trial and returns its estimated max-load.
    pub fn run_trial(&self, source: &KeySource, seeds: TrialSeeds) -> Result<u64> {
        let cfg = &self.config;
        let hasher = BitMatrixHash::new(cfg.l, cfg.u, seeds.hash)?;
        match source {
            KeySource::Fixed(keys) => {
                let tracker =
                    track_max_load(&hasher, keys.as_slice(), cfg.capacity, cfg.chunk_size)?;
                Ok(tracker.upper_bound())
            }
            KeySource::Generated {
                distribution,
                count,
            } => {
                let mut rng = StdRng::seed_from_u64(seeds.keys);
                let mut tracker = SpaceSaving::new(cfg.capacity);
                let batch = cfg.chunk_size.min(*count);
                let mut keys = KeySet::with_capacity(cfg.u, batch);
                let mut buckets = Vec::with_capacity(batch);
                let mut remaining = *count;
                while remaining > 0 {
                    let n = remaining.min(cfg.chunk_size);
                    keys.clear();
                    keys.extend_sampled(distribution, n, &mut rng)?;
                    buckets.clear();
                    hasher.hash_many_into(keys.as_slice(), &mut buckets)?;
                    tracker.ingest_batch(&buckets);
                    remaining -= n;
                }
                Ok(tracker.upper_bound())
            }
        }
    }
}
