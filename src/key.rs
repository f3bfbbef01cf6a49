//! Key representation for u-bit inputs.
//!
//! A key in [0, 2^u) is stored as `ceil(u / 64)` little-endian 64-bit words: word 0 holds
//! bits 0..64, word 1 bits 64..128 and so on. Bits at and above `u` in the final word are
//! always zero. [`BitKey`] owns a single key, [`KeySet`] packs many keys of the same width
//! into one flat buffer and [`KeySlice`] borrows a contiguous run of them.

use std::fmt;
use std::slice::ChunksExact;

use crate::error::{Error, Result};

pub const WORD_BITS: usize = 64;

/// Number of 64-bit words needed to hold `bits` bits.
pub const fn word_count(bits: usize) -> usize {
    (bits + WORD_BITS - 1) / WORD_BITS
}

/// Mask of the valid bits in the final word of a `bits`-wide value.
pub(crate) const fn last_word_mask(bits: usize) -> u64 {
    match bits % WORD_BITS {
        0 => u64::MAX,
        r => (1u64 << r) - 1,
    }
}

/// Returns true if the little-endian value held in `words` is below 2^bits.
pub(crate) fn fits(words: &[u64], bits: usize) -> bool {
    let n = word_count(bits);
    if words.iter().skip(n).any(|&w| w != 0) {
        return false;
    }
    match n.checked_sub(1).and_then(|last| words.get(last)) {
        Some(&last) => last & !last_word_mask(bits) == 0,
        None => true,
    }
}

#[inline]
pub(crate) fn set_bit(words: &mut [u64], i: usize) {
    words[i / WORD_BITS] |= 1u64 << (i % WORD_BITS);
}

/// A single key of a fixed bit width.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BitKey {
    bits: usize,
    words: Vec<u64>,
}

impl BitKey {
    /// The all-zero key of the given width.
    pub fn zero(bits: usize) -> Self {
        Self {
            bits,
            words: vec![0; word_count(bits)],
        }
    }

    /// Packs little-endian words into a key of width `bits`.
    ///
    /// Shorter inputs are zero-extended, longer inputs are accepted as long as the extra
    /// words are zero. Fails with [`Error::Domain`] if the value is not below 2^bits.
    pub fn from_words(mut words: Vec<u64>, bits: usize) -> Result<Self> {
        if !fits(&words, bits) {
            return Err(Error::Domain { bits });
        }
        words.resize(word_count(bits), 0);
        Ok(Self { bits, words })
    }

    pub fn from_u64(value: u64, bits: usize) -> Result<Self> {
        Self::from_words(vec![value], bits)
    }

    pub fn from_u128(value: u128, bits: usize) -> Result<Self> {
        Self::from_words(vec![value as u64, (value >> 64) as u64], bits)
    }

    /// Packs a little-endian byte string into a key of width `bits`.
    pub fn from_le_bytes(bytes: &[u8], bits: usize) -> Result<Self> {
        let mut words = vec![0u64; word_count(bytes.len() * 8)];
        for (i, &b) in bytes.iter().enumerate() {
            words[i / 8] |= (b as u64) << (8 * (i % 8));
        }
        Self::from_words(words, bits)
    }

    /// Parses a hexadecimal literal, with or without a `0x` prefix. Underscores are ignored.
    pub fn parse_hex(text: &str, bits: usize) -> Result<Self> {
        let trimmed = text.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        let mut words = Vec::new();
        let mut nibble = 0usize;
        for c in digits.chars().rev() {
            if c == '_' {
                continue;
            }
            let Some(value) = c.to_digit(16) else {
                return Err(Error::InvalidKey(text.to_owned()));
            };
            let word = nibble / 16;
            if word == words.len() {
                words.push(0);
            }
            words[word] |= (value as u64) << (4 * (nibble % 16));
            nibble += 1;
        }
        if nibble == 0 {
            return Err(Error::InvalidKey(text.to_owned()));
        }
        Self::from_words(words, bits)
    }

    /// Unpacks the key into `ceil(bits / 8)` little-endian bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out: Vec<u8> = self.words.iter().flat_map(|w| w.to_le_bytes()).collect();
        out.truncate((self.bits + 7) / 8);
        out
    }

    /// Returns the key as a `u64` if it fits in one word.
    pub fn to_u64(&self) -> Option<u64> {
        if self.words.iter().skip(1).any(|&w| w != 0) {
            return None;
        }
        Some(self.words.first().copied().unwrap_or(0))
    }

    /// Returns the key as a `u128` if it fits in two words.
    pub fn to_u128(&self) -> Option<u128> {
        if self.words.iter().skip(2).any(|&w| w != 0) {
            return None;
        }
        let lo = self.words.first().copied().unwrap_or(0) as u128;
        let hi = self.words.get(1).copied().unwrap_or(0) as u128;
        Some(lo | (hi << 64))
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn as_words(&self) -> &[u64] {
        &self.words
    }

    pub fn into_words(self) -> Vec<u64> {
        self.words
    }

    pub fn bit(&self, i: usize) -> bool {
        i < self.bits && (self.words[i / WORD_BITS] >> (i % WORD_BITS)) & 1 == 1
    }

    /// Hamming weight of the key.
    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

impl AsRef<[u64]> for BitKey {
    fn as_ref(&self) -> &[u64] {
        &self.words
    }
}

impl fmt::LowerHex for BitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut words = self.words.iter().rev().skip_while(|&&w| w == 0);
        match words.next() {
            None => f.write_str("0"),
            Some(top) => {
                write!(f, "{:x}", top)?;
                for w in words {
                    write!(f, "{:016x}", w)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for BitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self)
    }
}

/// Many keys of one width, packed back to back with a fixed word stride.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySet {
    bits: usize,
    stride: usize,
    words: Vec<u64>,
}

impl KeySet {
    pub fn new(bits: usize) -> Self {
        Self::with_capacity(bits, 0)
    }

    pub fn with_capacity(bits: usize, keys: usize) -> Self {
        let stride = word_count(bits).max(1);
        Self {
            bits,
            stride,
            words: Vec::with_capacity(stride * keys),
        }
    }

    /// Builds a set from single-word values, rejecting any value that needs more than `bits` bits.
    pub fn from_u64s<I: IntoIterator<Item = u64>>(bits: usize, values: I) -> Result<Self> {
        let mut set = Self::new(bits);
        for value in values {
            set.push(&[value])?;
        }
        Ok(set)
    }

    /// Appends a key given as little-endian words.
    pub fn push(&mut self, key: &[u64]) -> Result<()> {
        if !fits(key, self.bits) {
            return Err(Error::Domain { bits: self.bits });
        }
        let used = key.len().min(self.stride);
        self.words.extend_from_slice(&key[..used]);
        self.words.extend(std::iter::repeat(0).take(self.stride - used));
        Ok(())
    }

    pub fn push_key(&mut self, key: &BitKey) -> Result<()> {
        self.push(key.as_words())
    }

    /// Appends a zeroed slot and lets `fill` write the key in place.
    ///
    /// `fill` must leave the slot below 2^bits.
    pub(crate) fn push_with<F: FnOnce(&mut [u64])>(&mut self, fill: F) {
        let start = self.words.len();
        self.words.resize(start + self.stride, 0);
        fill(&mut self.words[start..]);
        debug_assert!(fits(&self.words[start..], self.bits));
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn len(&self) -> usize {
        self.words.len() / self.stride
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&[u64]> {
        self.as_slice().get(index)
    }

    pub fn key(&self, index: usize) -> Option<BitKey> {
        self.get(index).map(|words| BitKey {
            bits: self.bits,
            words: words[..word_count(self.bits)].to_vec(),
        })
    }

    pub fn iter(&self) -> ChunksExact<'_, u64> {
        self.as_slice().iter()
    }

    pub fn as_slice(&self) -> KeySlice<'_> {
        KeySlice {
            bits: self.bits,
            stride: self.stride,
            words: &self.words,
        }
    }

    /// Splits the set into runs of at most `keys_per_chunk` keys.
    pub fn chunks(&self, keys_per_chunk: usize) -> impl Iterator<Item = KeySlice<'_>> {
        self.as_slice().chunks(keys_per_chunk)
    }
}

/// A borrowed run of packed keys.
#[derive(Clone, Copy, Debug)]
pub struct KeySlice<'a> {
    bits: usize,
    stride: usize,
    words: &'a [u64],
}

impl<'a> KeySlice<'a> {
    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn len(&self) -> usize {
        self.words.len() / self.stride
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&'a [u64]> {
        let start = index.checked_mul(self.stride)?;
        self.words.get(start..start.checked_add(self.stride)?)
    }

    pub fn iter(&self) -> ChunksExact<'a, u64> {
        self.words.chunks_exact(self.stride)
    }

    pub fn chunks(self, keys_per_chunk: usize) -> impl Iterator<Item = KeySlice<'a>> {
        let Self { bits, stride, words } = self;
        words
            .chunks(keys_per_chunk.max(1).saturating_mul(stride))
            .map(move |words| KeySlice { bits, stride, words })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_word_count_and_mask() {
        assert_eq!(word_count(1), 1);
        assert_eq!(word_count(64), 1);
        assert_eq!(word_count(65), 2);
        assert_eq!(word_count(200), 4);
        assert_eq!(last_word_mask(64), u64::MAX);
        assert_eq!(last_word_mask(200), (1u64 << 8) - 1);
    }

    #[test]
    fn test_domain_check() {
        assert!(BitKey::from_u64(255, 8).is_ok());
        assert_eq!(BitKey::from_u64(256, 8), Err(Error::Domain { bits: 8 }));
        // extra zero words are fine, extra set words are not
        assert!(BitKey::from_words(vec![1, 0, 0], 64).is_ok());
        assert!(BitKey::from_words(vec![1, 1], 64).is_err());
        assert!(BitKey::from_u128(1u128 << 100, 101).is_ok());
        assert!(BitKey::from_u128(1u128 << 100, 100).is_err());
    }

    #[test]
    fn test_multi_word_layout() {
        let key = BitKey::from_u128((7u128 << 64) | 5, 130).unwrap();
        assert_eq!(key.as_words(), &[5, 7, 0]);
        assert!(key.bit(0));
        assert!(!key.bit(1));
        assert!(key.bit(66));
        assert_eq!(key.count_ones(), 5);
    }

    #[test]
    fn test_hex_parse_and_format() {
        let key = BitKey::parse_hex("0x1_0000_0000_0000_0000", 65).unwrap();
        assert_eq!(key.as_words(), &[0, 1]);
        assert_eq!(key.to_string(), "0x10000000000000000");
        assert_eq!(format!("{:x}", BitKey::zero(100)), "0");
        assert!(matches!(BitKey::parse_hex("0xfg", 8), Err(Error::InvalidKey(_))));
        assert!(matches!(BitKey::parse_hex("", 8), Err(Error::InvalidKey(_))));
        assert_eq!(BitKey::parse_hex("1ff", 8), Err(Error::Domain { bits: 8 }));
    }

    #[test]
    fn test_key_set_push_and_chunks() {
        let mut set = KeySet::new(130);
        set.push(&[1]).unwrap();
        set.push(&[2, 3, 1]).unwrap();
        assert!(set.push(&[0, 0, 4]).is_err());
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(1), Some(&[2u64, 3, 1][..]));
        assert_eq!(set.get(2), None);

        let set = KeySet::from_u64s(10, 0..25).unwrap();
        let sizes: Vec<usize> = set.chunks(10).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        let flattened: Vec<u64> = set.chunks(7).flat_map(|c| c.iter().map(|k| k[0])).collect();
        assert_eq!(flattened, (0..25).collect::<Vec<_>>());
        assert!(KeySet::from_u64s(4, [16]).is_err());
    }

    #[test]
    fn test_oversized_chunks_and_indices() {
        let mut set = KeySet::new(100);
        for i in 0..50u64 {
            set.push(&[i, 1]).unwrap();
        }
        let chunks: Vec<KeySlice<'_>> = set.chunks(usize::MAX).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 50);
        assert_eq!(set.get(usize::MAX), None);
        assert_eq!(set.get(usize::MAX / 2), None);
    }

    proptest! {
        #[test]
        fn prop_bytes_round_trip(bits in 1usize..300, seed in proptest::collection::vec(any::<u8>(), 38)) {
            let len = (bits + 7) / 8;
            let mut bytes = seed[..len].to_vec();
            if bits % 8 != 0 {
                bytes[len - 1] &= (1u8 << (bits % 8)) - 1;
            }
            let key = BitKey::from_le_bytes(&bytes, bits).unwrap();
            prop_assert_eq!(key.to_le_bytes(), bytes);
            prop_assert_eq!(key.as_words().len(), word_count(bits));
        }

        #[test]
        fn prop_u128_round_trip(value in any::<u128>(), bits in 128usize..260) {
            let key = BitKey::from_u128(value, bits).unwrap();
            prop_assert_eq!(key.to_u128(), Some(value));
            let reparsed = BitKey::parse_hex(&key.to_string(), bits).unwrap();
            prop_assert_eq!(reparsed, key);
        }

        #[test]
        fn prop_u64_masking(value in any::<u64>(), bits in 1usize..64) {
            let masked = value & ((1u64 << bits) - 1);
            prop_assert_eq!(BitKey::from_u64(masked, bits).unwrap().to_u64(), Some(masked));
            prop_assert_eq!(BitKey::from_u64(value, bits).is_ok(), value == masked);
        }
    }
}
