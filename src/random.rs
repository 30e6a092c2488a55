//! Process-scoped seeded random number generator.
//!
//! All sampling routines take the generator explicitly so simulations stay
//! deterministic and testable: for the same seed the drawn sequence is
//! identical run to run.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seeded uniform/normal generator owned by the engine.
#[derive(Debug)]
pub struct RandomGenerator {
    rng: StdRng,
    seed: u32,
}

impl RandomGenerator {
    /// Create with the given seed.
    #[must_use]
    pub fn new(seed: u32) -> Self {
        Self {
            rng: StdRng::seed_from_u64(u64::from(seed)),
            seed,
        }
    }

    /// Reseed, restarting the sequence.
    pub fn reset(&mut self, seed: u32) {
        self.rng = StdRng::seed_from_u64(u64::from(seed));
        self.seed = seed;
    }

    /// The active seed.
    #[must_use]
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Uniform sample in `[lo, hi)`.
    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.rng.gen::<f64>()
    }

    /// Standard normal sample (Box-Muller).
    pub fn normal(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1: f64 = self.rng.gen::<f64>().max(f64::MIN_POSITIVE);
        let u2: f64 = self.rng.gen();
        let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
        mean + std_dev * z
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_determinism_per_seed() {
        let mut a = RandomGenerator::new(42);
        let mut b = RandomGenerator::new(42);
        for _ in 0..16 {
            assert_eq!(a.uniform(0.0, 1.0), b.uniform(0.0, 1.0));
        }
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut gen = RandomGenerator::new(7);
        let first = gen.uniform(0.0, 1.0);
        gen.uniform(0.0, 1.0);
        gen.reset(7);
        assert_eq!(gen.uniform(0.0, 1.0), first);
    }
}
