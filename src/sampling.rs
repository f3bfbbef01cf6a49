//! Key distributions over F2^u.
//!
//! Every sampler takes the generator explicitly, so a key set is fully determined by its seed.

use std::fmt;
use std::str::FromStr;

use rand::seq::index;
use rand::Rng;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::key::{last_word_mask, set_bit, word_count, BitKey, KeySet};

/// How the bits of a key are drawn.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Distribution {
    /// Uniform over F2^u.
    Uniform,
    /// Independent bits, each set with probability `p`.
    Bernoulli { p: f64 },
    /// Uniform over the keys with exactly `k` bits set.
    HammingWeight { k: usize },
    /// Two-state chain from bit 0 upwards: bit 0 is a fair coin, then bit `i` is set with
    /// probability `p1` if bit `i - 1` is set and `p0` otherwise.
    Markov { p0: f64, p1: f64 },
}

impl Distribution {
    /// Looks a distribution up by name and binds its parameters.
    ///
    /// Names are case-insensitive: `uniform`, `bernoulli` (`p`), `hamming_weight` or `hamming`
    /// (`k`), `markov` (`p0`, `p1`).
    pub fn from_name(name: &str, params: &[(&str, f64)]) -> Result<Self> {
        let dist = match name.to_ascii_lowercase().as_str() {
            "uniform" => {
                let [] = bind_params(name, params, [])?;
                Self::Uniform
            }
            "bernoulli" => {
                let [p] = bind_params(name, params, ["p"])?;
                Self::Bernoulli { p }
            }
            "hamming_weight" | "hamming" => {
                let [k] = bind_params(name, params, ["k"])?;
                if !(k.is_finite() && k >= 0.0 && k.fract() == 0.0) {
                    return Err(Error::config(format!(
                        "k must be a non-negative integer, got {k}"
                    )));
                }
                Self::HammingWeight { k: k as usize }
            }
            "markov" => {
                let [p0, p1] = bind_params(name, params, ["p0", "p1"])?;
                Self::Markov { p0, p1 }
            }
            _ => return Err(Error::UnknownDistribution(name.to_owned())),
        };
        dist.check_probabilities()?;
        Ok(dist)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Uniform => "uniform",
            Self::Bernoulli { .. } => "bernoulli",
            Self::HammingWeight { .. } => "hamming_weight",
            Self::Markov { .. } => "markov",
        }
    }

    fn check_probabilities(&self) -> Result<()> {
        let check = |label: &str, p: f64| {
            if (0.0..=1.0).contains(&p) {
                Ok(())
            } else {
                Err(Error::config(format!("{label} must be in [0, 1], got {p}")))
            }
        };
        match *self {
            Self::Uniform | Self::HammingWeight { .. } => Ok(()),
            Self::Bernoulli { p } => check("p", p),
            Self::Markov { p0, p1 } => check("p0", p0).and(check("p1", p1)),
        }
    }

    /// Checks that keys of width `bits` can be drawn.
    pub fn validate(&self, bits: usize) -> Result<()> {
        if bits == 0 {
            return Err(Error::config("u must be positive"));
        }
        self.check_probabilities()?;
        match *self {
            Self::HammingWeight { k } if k > bits => Err(Error::config(format!(
                "k must be in [0, u], got k={k}, u={bits}"
            ))),
            _ => Ok(()),
        }
    }

    /// Writes one key of width `bits` into `out`, which must hold at least `ceil(bits / 64)`
    /// words. Assumes [`Self::validate`] passed for `bits`.
    pub(crate) fn fill<R: Rng + ?Sized>(&self, bits: usize, rng: &mut R, out: &mut [u64]) {
        let out = &mut out[..word_count(bits)];
        out.fill(0);
        match *self {
            Self::Uniform => {
                for word in out.iter_mut() {
                    *word = rng.gen();
                }
                if let Some(last) = out.last_mut() {
                    *last &= last_word_mask(bits);
                }
            }
            Self::Bernoulli { p } => {
                for i in 0..bits {
                    if rng.gen::<f64>() < p {
                        set_bit(out, i);
                    }
                }
            }
            Self::HammingWeight { k } => {
                for i in index::sample(rng, bits, k) {
                    set_bit(out, i);
                }
            }
            Self::Markov { p0, p1 } => {
                let mut prev = rng.gen::<f64>() < 0.5;
                if prev {
                    set_bit(out, 0);
                }
                for i in 1..bits {
                    let p = if prev { p1 } else { p0 };
                    prev = rng.gen::<f64>() < p;
                    if prev {
                        set_bit(out, i);
                    }
                }
            }
        }
    }

    /// Draws a single key.
    pub fn sample<R: Rng + ?Sized>(&self, bits: usize, rng: &mut R) -> Result<BitKey> {
        self.validate(bits)?;
        let mut words = vec![0; word_count(bits)];
        self.fill(bits, rng, &mut words);
        BitKey::from_words(words, bits)
    }
}

fn bind_params<const N: usize>(
    name: &str,
    params: &[(&str, f64)],
    keys: [&str; N],
) -> Result<[f64; N]> {
    let mut values = [None; N];
    for &(key, value) in params {
        let Some(slot) = keys.iter().position(|k| k.eq_ignore_ascii_case(key)) else {
            return Err(Error::config(format!(
                "unexpected parameter '{key}' for distribution '{name}'"
            )));
        };
        values[slot] = Some(value);
    }
    let mut bound = [0.0; N];
    for (i, value) in values.into_iter().enumerate() {
        bound[i] = value.ok_or_else(|| {
            Error::config(format!(
                "missing parameter '{}' for distribution '{name}'",
                keys[i]
            ))
        })?;
    }
    Ok(bound)
}

impl FromStr for Distribution {
    type Err = Error;

    /// Parses `name` or `name:key=value,key=value`, e.g. `markov:p0=0.7,p1=0.2`.
    fn from_str(s: &str) -> Result<Self> {
        let (name, rest) = s.split_once(':').unwrap_or((s, ""));
        let mut params = Vec::new();
        for pair in rest.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::config(format!("expected key=value, got '{pair}'")))?;
            let value: f64 = value.trim().parse().map_err(|_| {
                Error::config(format!("parameter '{}' is not a number: '{value}'", key.trim()))
            })?;
            params.push((key.trim(), value));
        }
        Self::from_name(name.trim(), &params)
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Uniform => write!(f, "uniform"),
            Self::Bernoulli { p } => write!(f, "bernoulli:p={p}"),
            Self::HammingWeight { k } => write!(f, "hamming_weight:k={k}"),
            Self::Markov { p0, p1 } => write!(f, "markov:p0={p0},p1={p1}"),
        }
    }
}

impl KeySet {
    /// Draws `count` keys of width `bits`.
    pub fn generate<R: Rng + ?Sized>(
        distribution: &Distribution,
        bits: usize,
        count: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let mut set = Self::with_capacity(bits, count);
        set.extend_sampled(distribution, count, rng)?;
        Ok(set)
    }

    /// Appends `count` freshly drawn keys.
    pub fn extend_sampled<R: Rng + ?Sized>(
        &mut self,
        distribution: &Distribution,
        count: usize,
        rng: &mut R,
    ) -> Result<()> {
        let bits = self.bits();
        distribution.validate(bits)?;
        for _ in 0..count {
            self.push_with(|slot| distribution.fill(bits, rng, slot));
        }
        Ok(())
    }
}
