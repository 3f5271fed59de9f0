//! Uniform random choice among eligible agents.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Pick one candidate uniformly at random. `None` when empty.
pub fn choose_uniform<'a, T, R>(candidates: &'a [T], rng: &mut R) -> Option<&'a T>
where
    R: Rng + ?Sized,
{
    candidates.choose(rng)
}

/// Shared random source for SNAT agent selection.
pub struct SnatSelector {
    rng: Mutex<StdRng>,
}

impl SnatSelector {
    /// Seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic sequence for a fixed seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn from_seed_option(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(seed),
            None => Self::from_entropy(),
        }
    }

    pub fn choose<'a, T>(&self, candidates: &'a [T]) -> Option<&'a T> {
        // A poisoned lock still holds a usable generator.
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        choose_uniform(candidates, &mut *rng)
    }
}

impl Default for SnatSelector {
    fn default() -> Self {
        Self::from_entropy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_candidates_yield_none() {
        let selector = SnatSelector::seeded(1);
        let empty: [u32; 0] = [];
        assert!(selector.choose(&empty).is_none());
    }

    #[test]
    fn single_candidate_always_chosen() {
        let selector = SnatSelector::from_entropy();
        for _ in 0..20 {
            assert_eq!(selector.choose(&["a1"]), Some(&"a1"));
        }
    }

    #[test]
    fn same_seed_same_sequence() {
        let candidates = ["a1", "a2", "a3", "a4"];
        let first = SnatSelector::seeded(42);
        let second = SnatSelector::seeded(42);
        for _ in 0..50 {
            assert_eq!(first.choose(&candidates), second.choose(&candidates));
        }
    }

    #[test]
    fn every_candidate_is_reachable() {
        let candidates = ["a1", "a2", "a3"];
        let selector = SnatSelector::seeded(7);
        let mut counts: HashMap<&str, u32> = HashMap::new();
        for _ in 0..3000 {
            let pick = selector.choose(&candidates).unwrap();
            *counts.entry(*pick).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        // Roughly uniform: each well above a third of its expectation.
        assert!(counts.values().all(|&c| c > 500));
    }
}
