//! Seeded random number generation.
//!
//! RULE: Nothing in the generator may call any platform RNG.
//! All randomness flows through a `RandomSource` derived from the
//! single master seed in the configuration.
//!
//! Two stream policies exist:
//!   - per-member: every member gets its own stream, seeded from
//!     (master_seed XOR member_index * golden ratio). Output is
//!     reproducible no matter how tasks are scheduled.
//!   - shared: one stream behind a mutex, one lock per draw. Every
//!     draw is valid but the sequence seen by a member depends on
//!     how tasks interleave.

use rand::{Rng, RngCore, SeedableRng};
use rand_distr::StandardNormal;
use rand_pcg::Pcg64Mcg;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// The draws the cohort generator and the alias sampler rely on.
pub trait RandomSource {
    /// Integer in `[min, max]`. Panics if `max < min`.
    fn uniform_int(&mut self, min: i64, max: i64) -> i64;

    /// Integer in `[min, max)`. Panics if `max <= min`.
    fn uniform_i64_range(&mut self, min: i64, max: i64) -> i64;

    /// Real drawn from Normal(mean, sd).
    fn normal(&mut self, mean: f64, sd: f64) -> f64;

    /// Real in `[0.0, 1.0)`.
    fn next_f64(&mut self) -> f64;

    /// Bernoulli trial: returns true with probability p.
    fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Timestamp drawn uniformly from the closed interval `[min, max]`.
    fn range_date(&mut self, min: i64, max: i64) -> i64 {
        self.uniform_int(min, max)
    }
}

/// A single deterministic stream.
#[derive(Debug, Clone)]
pub struct CohortRng {
    inner: Pcg64Mcg,
}

impl CohortRng {
    pub fn seed_from_u64(seed: u64) -> Self {
        Self {
            inner: Pcg64Mcg::seed_from_u64(seed),
        }
    }

    /// Stream for a stable index under a master seed. The index must
    /// mean the same thing across runs for output to be reproducible.
    pub fn derived(master_seed: u64, index: u64) -> Self {
        let derived_seed = master_seed ^ index.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self::seed_from_u64(derived_seed)
    }

    /// Draw a raw u64 (full range).
    pub fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }
}

impl RandomSource for CohortRng {
    fn uniform_int(&mut self, min: i64, max: i64) -> i64 {
        assert!(max >= min, "uniform_int: max ({max}) < min ({min})");
        self.inner.gen_range(min..=max)
    }

    fn uniform_i64_range(&mut self, min: i64, max: i64) -> i64 {
        assert!(max > min, "uniform_i64_range: empty range [{min}, {max})");
        self.inner.gen_range(min..max)
    }

    fn normal(&mut self, mean: f64, sd: f64) -> f64 {
        let z: f64 = self.inner.sample(StandardNormal);
        z * sd + mean
    }

    fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }
}

/// One stream shared by every task; each draw takes the lock once.
#[derive(Debug, Clone)]
pub struct SharedRng {
    inner: Arc<Mutex<CohortRng>>,
}

impl SharedRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CohortRng::seed_from_u64(seed))),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut CohortRng) -> T) -> T {
        // A panic while holding the lock leaves the PCG state intact.
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

impl RandomSource for SharedRng {
    fn uniform_int(&mut self, min: i64, max: i64) -> i64 {
        self.with(|r| r.uniform_int(min, max))
    }

    fn uniform_i64_range(&mut self, min: i64, max: i64) -> i64 {
        self.with(|r| r.uniform_i64_range(min, max))
    }

    fn normal(&mut self, mean: f64, sd: f64) -> f64 {
        self.with(|r| r.normal(mean, sd))
    }

    fn next_f64(&mut self) -> f64 {
        self.with(|r| r.next_f64())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RngMode {
    #[default]
    PerMember,
    Shared,
}

/// Hands out the random stream a generation task should use.
#[derive(Debug, Clone)]
pub enum SeedBank {
    PerMember { master_seed: u64 },
    Shared(SharedRng),
}

impl SeedBank {
    pub fn new(master_seed: u64, mode: RngMode) -> Self {
        match mode {
            RngMode::PerMember => Self::PerMember { master_seed },
            RngMode::Shared => Self::Shared(SharedRng::new(master_seed)),
        }
    }

    pub fn for_member(&self, index: u64) -> MemberRng {
        match self {
            Self::PerMember { master_seed } => {
                MemberRng::Owned(CohortRng::derived(*master_seed, index))
            }
            Self::Shared(shared) => MemberRng::Shared(shared.clone()),
        }
    }
}

/// The stream owned by one generation task.
#[derive(Debug)]
pub enum MemberRng {
    Owned(CohortRng),
    Shared(SharedRng),
}

impl RandomSource for MemberRng {
    fn uniform_int(&mut self, min: i64, max: i64) -> i64 {
        match self {
            Self::Owned(r) => r.uniform_int(min, max),
            Self::Shared(r) => r.uniform_int(min, max),
        }
    }

    fn uniform_i64_range(&mut self, min: i64, max: i64) -> i64 {
        match self {
            Self::Owned(r) => r.uniform_i64_range(min, max),
            Self::Shared(r) => r.uniform_i64_range(min, max),
        }
    }

    fn normal(&mut self, mean: f64, sd: f64) -> f64 {
        match self {
            Self::Owned(r) => r.normal(mean, sd),
            Self::Shared(r) => r.normal(mean, sd),
        }
    }

    fn next_f64(&mut self) -> f64 {
        match self {
            Self::Owned(r) => r.next_f64(),
            Self::Shared(r) => r.next_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = CohortRng::seed_from_u64(12345);
        let mut b = CohortRng::seed_from_u64(12345);
        for _ in 0..1_000 {
            assert_eq!(a.uniform_int(-50, 50), b.uniform_int(-50, 50));
            assert_eq!(a.next_f64().to_bits(), b.next_f64().to_bits());
            assert_eq!(a.normal(3.0, 2.0).to_bits(), b.normal(3.0, 2.0).to_bits());
        }
    }

    #[test]
    fn derived_streams_differ_by_index() {
        let mut a = CohortRng::derived(42, 0);
        let mut b = CohortRng::derived(42, 1);
        let xs: Vec<u64> = (0..8).map(|_| a.next_u64()).collect();
        let ys: Vec<u64> = (0..8).map(|_| b.next_u64()).collect();
        assert_ne!(xs, ys);
    }

    #[test]
    fn uniform_int_is_inclusive() {
        let mut rng = CohortRng::seed_from_u64(7);
        let mut seen = [false; 3];
        for _ in 0..10_000 {
            let v = rng.uniform_int(0, 2);
            assert!((0..=2).contains(&v));
            seen[v as usize] = true;
        }
        assert!(seen.iter().all(|s| *s), "every value in [0, 2] should appear");
        assert_eq!(rng.uniform_int(5, 5), 5);
    }

    #[test]
    fn uniform_i64_range_excludes_max() {
        let mut rng = CohortRng::seed_from_u64(9);
        for _ in 0..10_000 {
            let v = rng.uniform_i64_range(10, 13);
            assert!((10..13).contains(&v));
        }
    }

    #[test]
    #[should_panic(expected = "max")]
    fn uniform_int_panics_on_inverted_range() {
        let mut rng = CohortRng::seed_from_u64(1);
        rng.uniform_int(3, 2);
    }

    #[test]
    fn normal_matches_requested_moments() {
        let mut rng = CohortRng::seed_from_u64(2024);
        let n = 200_000;
        let draws: Vec<f64> = (0..n).map(|_| rng.normal(5.0, 2.0)).collect();
        let mean = draws.iter().sum::<f64>() / n as f64;
        let var = draws.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        assert!((mean - 5.0).abs() < 0.05, "mean {mean:.4}");
        assert!((var.sqrt() - 2.0).abs() < 0.05, "sd {:.4}", var.sqrt());
    }

    #[test]
    fn zero_sd_normal_returns_mean() {
        let mut rng = CohortRng::seed_from_u64(3);
        for _ in 0..100 {
            assert_eq!(rng.normal(2.0, 0.0), 2.0);
        }
    }

    #[test]
    fn shared_rng_clones_draw_from_one_stream() {
        let mut a = SharedRng::new(77);
        let mut b = a.clone();
        let mut reference = CohortRng::seed_from_u64(77);
        let x = a.next_f64();
        let y = b.next_f64();
        assert_eq!(x.to_bits(), reference.next_f64().to_bits());
        assert_eq!(y.to_bits(), reference.next_f64().to_bits());
    }

    #[test]
    fn per_member_bank_is_reproducible() {
        let bank = SeedBank::new(99, RngMode::PerMember);
        let mut a = bank.for_member(17);
        let mut b = bank.for_member(17);
        for _ in 0..100 {
            assert_eq!(a.uniform_int(0, 1_000_000), b.uniform_int(0, 1_000_000));
        }
    }
}
