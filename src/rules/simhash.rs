//! Locality-sensitive content fingerprint.
//!
//! Text is lowercased, stripped down to word characters (plus markup angle
//! brackets and CJK ideographs), cut into overlapping character shingles,
//! and each shingle hash votes on the bits of a 64-bit fingerprint. Similar
//! documents end up with fingerprints at a small Hamming distance.

use std::hash::BuildHasher;

use ahash::RandomState;
use once_cell::sync::Lazy;

/// Shingle width used across the crate unless a rule overrides it.
pub const DEFAULT_TOKEN_SIZE: usize = 4;

/// Fixed-seed hasher: fingerprints must agree across processes so knowledge
/// base exports stay comparable.
static SHINGLE_HASHER: Lazy<RandomState> =
    Lazy::new(|| RandomState::with_seeds(0x51_7c_c1_b7, 0x27_22_0a_95, 0xfe_6e_63_57, 0x81_ae_e0_4d));

/// 64-bit locality-sensitive fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Simhash {
    value: u64,
}

impl Simhash {
    /// Fingerprints `text` with the default shingle width.
    pub fn of(text: &str) -> Self {
        Self::with_token_size(text, DEFAULT_TOKEN_SIZE)
    }

    /// Fingerprints `text` with an explicit shingle width.
    pub fn with_token_size(text: &str, token_size: usize) -> Self {
        let filtered: Vec<char> = text
            .to_lowercase()
            .chars()
            .filter(|c| {
                c.is_alphanumeric()
                    || *c == '_'
                    || *c == '<'
                    || *c == '>'
                    || ('\u{4e00}'..='\u{9fcc}').contains(c)
            })
            .collect();

        if filtered.is_empty() {
            return Self { value: 0 };
        }

        let mut votes = [0i32; 64];
        let mut vote = |shingle: &[char]| {
            let shingle: String = shingle.iter().collect();
            let hash = SHINGLE_HASHER.hash_one(shingle.as_str());
            for (bit, vote) in votes.iter_mut().enumerate() {
                if hash >> bit & 1 == 1 {
                    *vote += 1;
                } else {
                    *vote -= 1;
                }
            }
        };

        if filtered.len() <= token_size {
            vote(&filtered);
        } else {
            for shingle in filtered.windows(token_size.max(1)) {
                vote(shingle);
            }
        }

        let mut value = 0u64;
        for (bit, vote) in votes.iter().enumerate() {
            if *vote > 0 {
                value |= 1 << bit;
            }
        }
        Self { value }
    }

    /// Rebuilds a fingerprint from its stored value.
    pub fn from_value(value: u64) -> Self {
        Self { value }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Number of differing fingerprint bits.
    pub fn distance(&self, other: &Simhash) -> u32 {
        (self.value ^ other.value).count_ones()
    }
}
