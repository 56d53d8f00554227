//! Constant-time sampling from a discrete weighted distribution.
//!
//! Vose's alias method: O(n) build, two draws per sample. See
//! <http://www.keithschwarz.com/darts-dice-coins/> for the derivation.

use crate::{
    error::{CohortError, CohortResult},
    rng::RandomSource,
};

#[derive(Debug, Clone)]
pub struct AliasSampler {
    prob: Vec<f64>,
    alias: Vec<usize>,
}

impl AliasSampler {
    /// Build from non-negative weights. Weights need not sum to 1.
    pub fn new(weights: &[f64]) -> CohortResult<Self> {
        let n = weights.len();
        if n == 0 {
            return Err(CohortError::InvalidDistribution(
                "weight vector is empty".into(),
            ));
        }
        if let Some((i, w)) = weights
            .iter()
            .enumerate()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(CohortError::InvalidDistribution(format!(
                "weight {i} is {w}; weights must be finite and non-negative"
            )));
        }
        let sum: f64 = weights.iter().sum();
        if sum <= 0.0 || !sum.is_finite() {
            return Err(CohortError::InvalidDistribution(format!(
                "weights must have a positive finite sum, got {sum}"
            )));
        }

        let scale = n as f64 / sum;
        let mut p: Vec<f64> = weights.iter().map(|w| w * scale).collect();
        let mut prob = vec![0.0; n];
        let mut alias: Vec<usize> = (0..n).collect();

        let mut small = Vec::with_capacity(n);
        let mut large = Vec::with_capacity(n);
        for (i, pi) in p.iter().enumerate() {
            if *pi < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        while let (Some(&l), Some(&g)) = (small.last(), large.last()) {
            small.pop();
            large.pop();
            prob[l] = p[l];
            alias[l] = g;
            p[g] = (p[g] + p[l]) - 1.0;
            if p[g] < 1.0 {
                small.push(g);
            } else {
                large.push(g);
            }
        }

        // Whatever is left is within rounding error of 1.
        for i in large.into_iter().chain(small) {
            prob[i] = 1.0;
        }

        Ok(Self { prob, alias })
    }

    /// Build from integer frequencies (e.g. counts per code).
    pub fn from_frequencies(freqs: &[u64]) -> CohortResult<Self> {
        let weights: Vec<f64> = freqs.iter().map(|f| *f as f64).collect();
        Self::new(&weights)
    }

    pub fn len(&self) -> usize {
        self.prob.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prob.is_empty()
    }

    /// Draw one index.
    pub fn sample<R: RandomSource + ?Sized>(&self, rng: &mut R) -> usize {
        let i = rng.uniform_int(0, self.prob.len() as i64 - 1) as usize;
        if rng.next_f64() < self.prob[i] {
            i
        } else {
            self.alias[i]
        }
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.prob
    }

    pub fn aliases(&self) -> &[usize] {
        &self.alias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::CohortRng;

    const WEIGHTS: [f64; 7] = [0.125, 0.2, 0.1, 0.25, 0.1, 0.1, 0.125];

    #[test]
    fn observed_frequencies_converge_to_weights() {
        let sampler = AliasSampler::new(&WEIGHTS).unwrap();
        let mut rng = CohortRng::seed_from_u64(0x0ddc_0ffe_ebad_f00d);
        let rounds = 10_000_000;
        let mut counts = [0u64; 7];
        for _ in 0..rounds {
            counts[sampler.sample(&mut rng)] += 1;
        }
        let total: f64 = WEIGHTS.iter().sum();
        for (i, c) in counts.iter().enumerate() {
            let observed = *c as f64 / rounds as f64;
            let expected = WEIGHTS[i] / total;
            assert!(
                (observed - expected).abs() <= 0.001,
                "index {i}: observed {observed:.5}, expected {expected:.5}"
            );
        }
    }

    #[test]
    fn same_seed_same_draws() {
        let sampler = AliasSampler::new(&WEIGHTS).unwrap();
        let run = |seed| {
            let mut rng = CohortRng::seed_from_u64(seed);
            (0..10_000).map(|_| sampler.sample(&mut rng)).collect::<Vec<_>>()
        };
        assert_eq!(run(1), run(1));
        assert_ne!(run(1), run(2));
    }

    #[test]
    fn tables_are_total_for_any_weight_vector() {
        let mut rng = CohortRng::seed_from_u64(5);
        for n in 1..64 {
            let weights: Vec<f64> = (0..n)
                .map(|i| if i % 5 == 0 { 0.0 } else { rng.next_f64() * 10.0 })
                .chain(std::iter::once(1.0))
                .collect();
            let sampler = AliasSampler::new(&weights).unwrap();
            assert_eq!(sampler.len(), weights.len());
            for (p, a) in sampler.probabilities().iter().zip(sampler.aliases()) {
                assert!((0.0..=1.0).contains(p), "prob {p} out of [0, 1]");
                assert!(*a < weights.len(), "alias {a} out of range");
            }
        }
    }

    #[test]
    fn zero_weight_is_never_drawn() {
        let sampler = AliasSampler::new(&[0.0, 3.0, 0.0, 1.0]).unwrap();
        let mut rng = CohortRng::seed_from_u64(11);
        for _ in 0..100_000 {
            let i = sampler.sample(&mut rng);
            assert!(i == 1 || i == 3, "drew zero-weight index {i}");
        }
    }

    #[test]
    fn single_weight_always_returns_zero() {
        let sampler = AliasSampler::new(&[42.0]).unwrap();
        let mut rng = CohortRng::seed_from_u64(3);
        assert!((0..100).all(|_| sampler.sample(&mut rng) == 0));
    }

    #[test]
    fn frequencies_are_normalised() {
        let sampler = AliasSampler::from_frequencies(&[1, 1, 2]).unwrap();
        let mut rng = CohortRng::seed_from_u64(8);
        let rounds = 400_000;
        let hits = (0..rounds).filter(|_| sampler.sample(&mut rng) == 2).count();
        let observed = hits as f64 / rounds as f64;
        assert!((observed - 0.5).abs() < 0.01, "observed {observed:.4}");
    }

    #[test]
    fn degenerate_weights_are_rejected() {
        for weights in [vec![], vec![0.5, -0.1], vec![0.0, 0.0, 0.0], vec![f64::NAN]] {
            assert!(
                matches!(
                    AliasSampler::new(&weights),
                    Err(CohortError::InvalidDistribution(_))
                ),
                "{weights:?} should be rejected"
            );
        }
    }
}
