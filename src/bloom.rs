use serde::{Deserialize, Serialize};

use crate::types::{Flag, Id};

/// Fixed 64-bit bloom filter over `u64` keys (series ids or flags).
///
/// One mixed hash sets one of 64 bit positions. The guarantee is
/// soundness only: `contains` never returns false after `add`. A filter
/// holding many distinct keys saturates and admits most probes; in
/// practice index records carry one series id per chunk and a handful of
/// flag values, so the word stays sparse enough to prune.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bloom(pub u64);

// Finalizer of splitmix64. Enough avalanche that sequential ids do not
// cluster into the same bit positions.
fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

impl Bloom {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn add(&mut self, key: u64) {
        self.0 |= 1u64 << (mix(key) & 63);
    }

    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        self.0 & (1u64 << (mix(key) & 63)) != 0
    }

    #[must_use]
    pub const fn union(a: Self, b: Self) -> Self {
        Self(a.0 | b.0)
    }

    /// True if any of the queried ids may be present.
    #[must_use]
    pub fn contains_any(&self, keys: &[Id]) -> bool {
        keys.iter().any(|&k| self.contains(k))
    }

    /// Flag-mask admission for chunk-level flag blooms: a mask of 0 admits
    /// everything; otherwise at least the mask itself must have been seen.
    #[must_use]
    pub fn passes_flag(&self, mask: Flag) -> bool {
        mask == 0 || self.contains(u64::from(mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_false_negative() {
        let mut b = Bloom::empty();
        for id in 0..64u64 {
            b.add(id);
        }
        for id in 0..64u64 {
            assert!(b.contains(id));
        }
    }

    #[test]
    fn union_preserves_membership() {
        let mut a = Bloom::empty();
        let mut b = Bloom::empty();
        a.add(1);
        b.add(1_000_003);
        let u = Bloom::union(a, b);
        assert!(u.contains(1));
        assert!(u.contains(1_000_003));
    }

    #[test]
    fn few_keys_keep_false_positives_rare() {
        let mut b = Bloom::empty();
        for id in [3u64, 17, 991, 4_242] {
            b.add(id);
        }
        // at most 4 of 64 bits are set, so foreign keys rarely pass
        let hits = (1_000_000..1_004_000u64).filter(|&k| b.contains(k)).count();
        let rate = hits as f64 / 4_000.0;
        assert!(rate < 0.2, "false positive rate {rate} too high for a 4-key filter");
    }

    #[test]
    fn sparse_filter_rejects_most() {
        let mut b = Bloom::empty();
        b.add(42);
        let hits = (0..4_000u64).filter(|&k| k != 42 && b.contains(k)).count();
        assert!(hits < 200, "single-key filter hit {hits} of 4000 foreign keys");
    }
}
