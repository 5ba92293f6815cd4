use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::RandomState;

/// Source of blinding masks and image placement offsets.
pub trait RandomSource: Send + Sync {
    fn next_u32(&self) -> u32;

    /// Uniform-enough value in `0..bound`; `bound == 0` yields 0.
    fn below(&self, bound: u32) -> u32 {
        if bound == 0 {
            return 0;
        }
        ((u64::from(self.next_u32()) * u64::from(bound)) >> 32) as u32
    }
}

/// Process-seeded hasher over a running counter.
pub struct HashRandom {
    state: RandomState,
    counter: AtomicU64,
}

impl HashRandom {
    pub fn new() -> Self {
        Self {
            state: RandomState::new(),
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for HashRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for HashRandom {
    fn next_u32(&self) -> u32 {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let hash = BuildHasher::hash_one(&self.state, n);
        (hash ^ (hash >> 32)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_below_respects_bound() {
        let rng = HashRandom::new();
        for bound in [1_u32, 2, 7, 64] {
            for _ in 0..100 {
                assert!(rng.below(bound) < bound);
            }
        }
        assert_eq!(rng.below(0), 0);
    }

    #[test]
    fn test_values_vary() {
        let rng = HashRandom::new();
        let first = rng.next_u32();
        assert!((0..16).any(|_| rng.next_u32() != first));
    }
}
