//! # Resampling Scheduler
//!
//! Draws the observation index sets the selection executor runs on. Three
//! schemes are supported: subsampling without replacement at a fraction τ,
//! bootstrap draws of size `n` with replacement, and complementary pairs
//! (two disjoint half-samples per iteration, for exchangeability-based
//! error bounds).
//!
//! Every draw is a pure function of `(seed, draw index)`: each index gets its
//! own `StdRng` stream, so the plan is identical no matter how many workers
//! later consume it and draws never share mutable state.

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// How resamples are drawn from the `n` observations.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResamplingScheme {
    /// `⌊τ·n⌋` observations without replacement per resample.
    Subsampling { tau: f64 },
    /// `n` observations with replacement per resample.
    Bootstrap,
    /// K/2 iterations, each yielding two disjoint half-samples of size
    /// `⌊n/2⌋`. Requires an even resample count.
    ComplementaryPairs,
}

#[derive(Error, Debug)]
pub enum ResampleError {
    #[error("the number of resamples K must be positive")]
    ZeroResamples,

    #[error("complementary pairs need an even number of resamples, got K = {k}")]
    OddPairCount { k: usize },

    #[error("cannot resample from zero observations")]
    NoObservations,

    #[error("subsampling fraction tau = {tau} is outside the open interval (0, 1)")]
    TauOutOfRange { tau: f64 },

    #[error(
        "stratum {stratum} has {size} observation(s), which rounds to an empty draw; \
         merge strata or raise tau"
    )]
    EmptyStratumDraw { stratum: usize, size: usize },

    #[error("stratification key has {len} entries for {n} observations")]
    StrataLengthMismatch { len: usize, n: usize },
}

/// Pluggable balancing rule: maps every observation to a stratum so that
/// draws preserve stratum proportions. Implementations must be stateless
/// with respect to draws (the plan generator calls them from many seeds).
pub trait BalancingRule: Send + Sync {
    /// Per-observation stratum labels, or `None` for simple random draws.
    fn strata(&self) -> Option<&[usize]>;
}

/// Simple random sampling; no stratification.
pub struct SimpleRandom;

impl BalancingRule for SimpleRandom {
    fn strata(&self) -> Option<&[usize]> {
        None
    }
}

/// Stratified sampling over a fixed key (outcome class, cluster label,
/// confounder, ...).
pub struct Stratified {
    strata: Vec<usize>,
}

impl Stratified {
    pub fn new(strata: Vec<usize>) -> Self {
        Self { strata }
    }
}

impl BalancingRule for Stratified {
    fn strata(&self) -> Option<&[usize]> {
        Some(&self.strata)
    }
}

/// One resample: an index set, plus the id of its complementary pair when
/// drawn under [`ResamplingScheme::ComplementaryPairs`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Resample {
    pub indices: Vec<usize>,
    pub pair: Option<usize>,
}

/// The full, deterministic schedule of K draws.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResamplingPlan {
    pub draws: Vec<Resample>,
    pub seed: u64,
}

impl ResamplingPlan {
    /// Generates K draws under `scheme`, honouring the balancing rule.
    /// Fails fast on any τ/stratum combination that would round a stratum
    /// draw to zero.
    pub fn generate(
        k: usize,
        n: usize,
        scheme: ResamplingScheme,
        rule: &dyn BalancingRule,
        seed: u64,
    ) -> Result<Self, ResampleError> {
        if k == 0 {
            return Err(ResampleError::ZeroResamples);
        }
        if n == 0 {
            return Err(ResampleError::NoObservations);
        }
        let strata = rule.strata();
        if let Some(s) = strata {
            if s.len() != n {
                return Err(ResampleError::StrataLengthMismatch { len: s.len(), n });
            }
        }

        let mut draws = Vec::with_capacity(k);
        match scheme {
            ResamplingScheme::Subsampling { tau } => {
                if !(tau > 0.0 && tau < 1.0) {
                    return Err(ResampleError::TauOutOfRange { tau });
                }
                for i in 0..k {
                    let mut rng = rng_for_draw(seed, i);
                    draws.push(Resample {
                        indices: draw_subsample(n, tau, strata, &mut rng)?,
                        pair: None,
                    });
                }
            }
            ResamplingScheme::Bootstrap => {
                for i in 0..k {
                    let mut rng = rng_for_draw(seed, i);
                    draws.push(Resample {
                        indices: draw_bootstrap(n, strata, &mut rng),
                        pair: None,
                    });
                }
            }
            ResamplingScheme::ComplementaryPairs => {
                if k % 2 != 0 {
                    return Err(ResampleError::OddPairCount { k });
                }
                for i in 0..k / 2 {
                    let mut rng = rng_for_draw(seed, i);
                    let (a, b) = draw_complementary_pair(n, strata, &mut rng)?;
                    draws.push(Resample {
                        indices: a,
                        pair: Some(i),
                    });
                    draws.push(Resample {
                        indices: b,
                        pair: Some(i),
                    });
                }
            }
        }
        Ok(Self { draws, seed })
    }

    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }
}

/// Independent rng stream per draw index.
fn rng_for_draw(seed: u64, index: usize) -> StdRng {
    // Golden-ratio increment keeps the streams well separated even for
    // adjacent indices.
    let stream = seed ^ (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    StdRng::seed_from_u64(stream)
}

/// Draws `⌊τ·stratum_size⌋` observations without replacement from each
/// stratum (one implicit stratum when unstratified).
pub fn draw_subsample(
    n: usize,
    tau: f64,
    strata: Option<&[usize]>,
    rng: &mut StdRng,
) -> Result<Vec<usize>, ResampleError> {
    let mut indices = Vec::new();
    for (stratum, members) in stratum_members(n, strata) {
        let size = (tau * members.len() as f64).floor() as usize;
        if size == 0 {
            return Err(ResampleError::EmptyStratumDraw {
                stratum,
                size: members.len(),
            });
        }
        for pick in sample(rng, members.len(), size).into_iter() {
            indices.push(members[pick]);
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

/// Draws `stratum_size` observations with replacement from each stratum.
pub fn draw_bootstrap(n: usize, strata: Option<&[usize]>, rng: &mut StdRng) -> Vec<usize> {
    let mut indices = Vec::with_capacity(n);
    for (_, members) in stratum_members(n, strata) {
        for _ in 0..members.len() {
            indices.push(members[rng.gen_range(0..members.len())]);
        }
    }
    indices.sort_unstable();
    indices
}

/// Draws two mutually exclusive half-samples, `⌊stratum_size/2⌋` from each
/// stratum per half. Their union need not cover all observations.
pub fn draw_complementary_pair(
    n: usize,
    strata: Option<&[usize]>,
    rng: &mut StdRng,
) -> Result<(Vec<usize>, Vec<usize>), ResampleError> {
    let mut first = Vec::new();
    let mut second = Vec::new();
    for (stratum, members) in stratum_members(n, strata) {
        let half = members.len() / 2;
        if half == 0 {
            return Err(ResampleError::EmptyStratumDraw {
                stratum,
                size: members.len(),
            });
        }
        let picks = sample(rng, members.len(), 2 * half).into_vec();
        for &pick in &picks[..half] {
            first.push(members[pick]);
        }
        for &pick in &picks[half..] {
            second.push(members[pick]);
        }
    }
    first.sort_unstable();
    second.sort_unstable();
    Ok((first, second))
}

/// Observation indices grouped by stratum, in stable label order.
fn stratum_members(n: usize, strata: Option<&[usize]>) -> Vec<(usize, Vec<usize>)> {
    match strata {
        None => vec![(0, (0..n).collect())],
        Some(labels) => {
            let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            for (idx, &label) in labels.iter().enumerate() {
                groups.entry(label).or_default().push(idx);
            }
            groups.into_iter().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsample_preserves_stratum_fractions_exactly() {
        // 12 observations in stratum 0, 8 in stratum 1.
        let strata: Vec<usize> = (0..20).map(|i| usize::from(i >= 12)).collect();
        for &tau in &[0.3, 0.5, 0.77] {
            let mut rng = StdRng::seed_from_u64(7);
            let draw = draw_subsample(20, tau, Some(&strata), &mut rng).unwrap();
            let in_first = draw.iter().filter(|&&i| i < 12).count();
            let in_second = draw.len() - in_first;
            assert_eq!(in_first, (tau * 12.0).floor() as usize);
            assert_eq!(in_second, (tau * 8.0).floor() as usize);
        }
    }

    #[test]
    fn subsample_rejects_stratum_rounding_to_zero() {
        let strata = vec![0, 0, 0, 1];
        let mut rng = StdRng::seed_from_u64(1);
        let err = draw_subsample(4, 0.5, Some(&strata), &mut rng).unwrap_err();
        assert!(matches!(
            err,
            ResampleError::EmptyStratumDraw { stratum: 1, size: 1 }
        ));
    }

    #[test]
    fn complementary_pairs_are_disjoint() {
        let mut rng = StdRng::seed_from_u64(3);
        let (a, b) = draw_complementary_pair(11, None, &mut rng).unwrap();
        assert_eq!(a.len(), 5);
        assert_eq!(b.len(), 5);
        assert!(a.iter().all(|i| !b.contains(i)));
    }

    #[test]
    fn plan_is_deterministic_in_seed() {
        let rule = SimpleRandom;
        let scheme = ResamplingScheme::Subsampling { tau: 0.5 };
        let one = ResamplingPlan::generate(8, 30, scheme, &rule, 99).unwrap();
        let two = ResamplingPlan::generate(8, 30, scheme, &rule, 99).unwrap();
        for (a, b) in one.draws.iter().zip(&two.draws) {
            assert_eq!(a.indices, b.indices);
        }
        let three = ResamplingPlan::generate(8, 30, scheme, &rule, 100).unwrap();
        assert!(
            one.draws
                .iter()
                .zip(&three.draws)
                .any(|(a, b)| a.indices != b.indices)
        );
    }

    #[test]
    fn plan_rejects_odd_pair_count() {
        let err = ResamplingPlan::generate(
            5,
            10,
            ResamplingScheme::ComplementaryPairs,
            &SimpleRandom,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, ResampleError::OddPairCount { k: 5 }));
    }

    #[test]
    fn bootstrap_draw_has_full_size_per_stratum() {
        let strata = vec![0, 0, 0, 1, 1];
        let mut rng = StdRng::seed_from_u64(5);
        let draw = draw_bootstrap(5, Some(&strata), &mut rng);
        assert_eq!(draw.len(), 5);
        assert_eq!(draw.iter().filter(|&&i| i < 3).count(), 3);
    }
}
