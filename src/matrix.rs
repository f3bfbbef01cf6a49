//! Linear hash functions over F2.
//!
//! A [`BitMatrixHash`] holds a random `l × u` binary matrix `M` and maps a u-bit key `x` to
//! the l-bit bucket id `M·x`, where bit `i` of the result is the parity of `row_i & x`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::key::{fits, last_word_mask, word_count, KeySlice};

/// Largest supported output width; bucket ids are `u64`.
pub const MAX_OUTPUT_BITS: usize = 64;

fn check_dimensions(l: usize, u: usize) -> Result<()> {
    if l == 0 || u == 0 {
        return Err(Error::config(format!(
            "l and u must be positive, got l={l}, u={u}"
        )));
    }
    if l > MAX_OUTPUT_BITS {
        return Err(Error::config(format!(
            "l must be at most {MAX_OUTPUT_BITS}, got {l}"
        )));
    }
    Ok(())
}

/// Hashes u-bit keys to bucket ids in [0, 2^l).
///
/// Implementors only need [`BucketHasher::hash_one`]; the batch methods fall back to calling it
/// once per key.
pub trait BucketHasher {
    /// Input width u in bits.
    fn input_bits(&self) -> usize;

    /// Output width l in bits.
    fn output_bits(&self) -> usize;

    /// Hashes one key given as little-endian words.
    fn hash_one(&self, key: &[u64]) -> Result<u64>;

    /// Appends the bucket id of every key to `out`.
    ///
    /// Either all keys are hashed or none are: on error `out` is left as it was.
    fn hash_many_into(&self, keys: KeySlice<'_>, out: &mut Vec<u64>) -> Result<()> {
        let start = out.len();
        out.reserve(keys.len());
        for key in keys.iter() {
            match self.hash_one(key) {
                Ok(bucket) => out.push(bucket),
                Err(e) => {
                    out.truncate(start);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn hash_many(&self, keys: KeySlice<'_>) -> Result<Vec<u64>> {
        let mut out = Vec::with_capacity(keys.len());
        self.hash_many_into(keys, &mut out)?;
        Ok(out)
    }
}

/// The `l × u` matrix of a linear hash, one packed row per output bit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashMatrix {
    l: usize,
    u: usize,
    stride: usize,
    rows: Vec<u64>,
}

impl HashMatrix {
    /// Draws `l` independent uniform rows from F2^u.
    pub fn random<R: Rng + ?Sized>(l: usize, u: usize, rng: &mut R) -> Result<Self> {
        check_dimensions(l, u)?;
        let stride = word_count(u);
        let mask = last_word_mask(u);
        let mut rows = vec![0u64; l * stride];
        for row in rows.chunks_exact_mut(stride) {
            for word in row.iter_mut() {
                *word = rng.gen();
            }
            row[stride - 1] &= mask;
        }
        Ok(Self { l, u, stride, rows })
    }

    /// Builds a matrix from explicit rows, row `i` producing output bit `i`.
    pub fn from_rows<W: AsRef<[u64]>>(u: usize, rows: &[W]) -> Result<Self> {
        check_dimensions(rows.len(), u)?;
        let stride = word_count(u);
        let mut packed = Vec::with_capacity(rows.len() * stride);
        for row in rows {
            let row = row.as_ref();
            if !fits(row, u) {
                return Err(Error::Domain { bits: u });
            }
            let used = row.len().min(stride);
            packed.extend_from_slice(&row[..used]);
            packed.extend(std::iter::repeat(0).take(stride - used));
        }
        Ok(Self {
            l: rows.len(),
            u,
            stride,
            rows: packed,
        })
    }

    pub fn l(&self) -> usize {
        self.l
    }

    pub fn u(&self) -> usize {
        self.u
    }

    pub fn row(&self, i: usize) -> &[u64] {
        &self.rows[i * self.stride..(i + 1) * self.stride]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u64]> {
        self.rows.chunks_exact(self.stride)
    }

    /// Column `j` as an l-bit word: bit `i` is entry `(i, j)` of the matrix.
    pub fn column(&self, j: usize) -> u64 {
        let (word, shift) = (j / 64, j % 64);
        self.rows()
            .enumerate()
            .fold(0, |acc, (i, row)| acc | (((row[word] >> shift) & 1) << i))
    }
}

/// A random linear hash `h(x) = M·x` over F2.
///
/// Single keys are hashed straight from the definition, one popcount parity per row. Batches go
/// through per-byte column tables: for byte position `b` and byte value `v`, `tables[b][v]` is the
/// XOR of the columns selected by the set bits of `v`, so a key costs one lookup per byte
/// instead of `l` row scans.
#[derive(Clone, Debug)]
pub struct BitMatrixHash {
    matrix: HashMatrix,
    tables: Vec<[u64; 256]>,
}

impl BitMatrixHash {
    /// Creates a hash with a matrix drawn from a generator seeded with `seed`.
    pub fn new(l: usize, u: usize, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::from_rng(l, u, &mut rng)
    }

    pub fn from_rng<R: Rng + ?Sized>(l: usize, u: usize, rng: &mut R) -> Result<Self> {
        Ok(Self::from_matrix(HashMatrix::random(l, u, rng)?))
    }

    /// Builds a hash from `l` explicit rows of width `u`.
    pub fn from_rows<W: AsRef<[u64]>>(l: usize, u: usize, rows: &[W]) -> Result<Self> {
        if rows.len() != l {
            return Err(Error::config(format!(
                "expected {l} rows, got {}",
                rows.len()
            )));
        }
        Ok(Self::from_matrix(HashMatrix::from_rows(u, rows)?))
    }

    pub fn from_matrix(matrix: HashMatrix) -> Self {
        let tables = byte_tables(&matrix);
        Self { matrix, tables }
    }

    pub fn matrix(&self) -> &HashMatrix {
        &self.matrix
    }

    /// Hashes a key that fits in one word.
    pub fn hash_u64(&self, key: u64) -> Result<u64> {
        self.hash_one(&[key])
    }

    #[inline]
    fn hash_packed(&self, key: &[u64]) -> u64 {
        let mut bucket = 0;
        for (tables, &word) in self.tables.chunks(8).zip(key) {
            for (k, table) in tables.iter().enumerate() {
                bucket ^= table[((word >> (8 * k)) & 0xff) as usize];
            }
        }
        bucket
    }
}

fn byte_tables(matrix: &HashMatrix) -> Vec<[u64; 256]> {
    let u = matrix.u();
    (0..(u + 7) / 8)
        .map(|b| {
            let mut columns = [0u64; 8];
            for (bit, column) in columns.iter_mut().enumerate() {
                let j = 8 * b + bit;
                if j < u {
                    *column = matrix.column(j);
                }
            }
            let mut table = [0u64; 256];
            for v in 1..256usize {
                table[v] = table[v & (v - 1)] ^ columns[v.trailing_zeros() as usize];
            }
            table
        })
        .collect()
}

impl BucketHasher for BitMatrixHash {
    fn input_bits(&self) -> usize {
        self.matrix.u
    }

    fn output_bits(&self) -> usize {
        self.matrix.l
    }

    fn hash_one(&self, key: &[u64]) -> Result<u64> {
        if !fits(key, self.matrix.u) {
            return Err(Error::Domain {
                bits: self.matrix.u,
            });
        }
        let mut bucket = 0u64;
        for (i, row) in self.matrix.rows().enumerate() {
            let parity = row
                .iter()
                .zip(key)
                .fold(0u32, |acc, (r, x)| acc ^ (r & x).count_ones())
                & 1;
            bucket |= (parity as u64) << i;
        }
        Ok(bucket)
    }

    fn hash_many_into(&self, keys: KeySlice<'_>, out: &mut Vec<u64>) -> Result<()> {
        let u = self.matrix.u;
        if keys.bits() > u && keys.iter().any(|key| !fits(key, u)) {
            return Err(Error::Domain { bits: u });
        }
        out.reserve(keys.len());
        out.extend(keys.iter().map(|key| self.hash_packed(key)));
        Ok(())
    }
}
