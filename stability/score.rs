//! # Stability Scoring and Error Control
//!
//! The closed forms behind calibration. Both knobs are pluggable: the
//! expected-false-positive (PFER) bound is selected by [`PferMethod`], and
//! the stability score is a [`ScoreStrategy`] implementation, with the
//! binomial consensus score shipped as the default.
//!
//! The consensus score measures how far the observed selection proportions
//! depart from the null of all-equal selection probabilities. Under the
//! null, every candidate's selection count is `Binomial(K, q/N)` with `q`
//! the expected number of selected candidates; candidates whose observed
//! proportion sits in an a-priori unlikely class (stably selected, stably
//! unselected) contribute large `−log` probabilities, so uniform selection
//! scores near zero and strongly separated selection scores high.

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use statrs::distribution::{Binomial, DiscreteCDF};

/// Which expected-false-positive bound to apply at each (λ, π) point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PferMethod {
    /// Meinshausen–Bühlmann complexity bound, `q²/(N·(2π−1))`.
    MeinshausenBuhlmann,
    /// Shah–Samworth exchangeability bound for complementary-pair
    /// resampling, `q²/(N·2(2π−1−1/(2K)))`.
    ShahSamworth,
}

/// Upper bound on the expected number of falsely selected candidates at
/// threshold `pi`, given `q` (expected selected count at the grid row), `N`
/// candidates, and `k` valid resamples. Points where the bound degenerates
/// return `+∞` and can never be feasible.
pub fn pfer_bound(method: PferMethod, q: f64, n_candidates: usize, pi: f64, k: usize) -> f64 {
    if n_candidates == 0 || !q.is_finite() {
        return f64::INFINITY;
    }
    let n = n_candidates as f64;
    let denom = match method {
        PferMethod::MeinshausenBuhlmann => 2.0 * pi - 1.0,
        PferMethod::ShahSamworth => {
            if k == 0 {
                return f64::INFINITY;
            }
            2.0 * (2.0 * pi - 1.0 - 1.0 / (2.0 * k as f64))
        }
    };
    if denom <= 0.0 {
        return f64::INFINITY;
    }
    (q * q) / (n * denom)
}

/// Pluggable stability score. Higher means more informative, less uniform
/// selection.
pub trait ScoreStrategy: Send + Sync {
    /// Scores one grid row's candidate proportions at threshold `pi`,
    /// computed over `k_valid` successful resamples.
    fn score(&self, proportions: ArrayView1<'_, f64>, pi: f64, k_valid: u32) -> f64;
}

/// Default score: negative log-likelihood of the observed
/// stable-in / stable-out / unstable classification under the equiprobable
/// binomial null.
pub struct ConsensusScore;

impl ScoreStrategy for ConsensusScore {
    fn score(&self, proportions: ArrayView1<'_, f64>, pi: f64, k_valid: u32) -> f64 {
        let n = proportions.len();
        if n == 0 || k_valid == 0 {
            return 0.0;
        }
        let k = u64::from(k_valid);
        let q: f64 = proportions.sum();
        let p_null = (q / n as f64).clamp(1e-12, 1.0 - 1e-12);
        let Ok(null) = Binomial::new(p_null, k) else {
            return 0.0;
        };

        // Count thresholds equivalent to the proportion classes.
        let hi = (pi * k as f64).ceil() as u64;
        let lo = ((1.0 - pi) * k as f64).floor() as u64;
        let p_in = if hi == 0 { 1.0 } else { 1.0 - null.cdf(hi - 1) };
        let p_out = null.cdf(lo);
        let p_mid = (1.0 - p_in - p_out).max(f64::MIN_POSITIVE);

        let mut score = 0.0;
        for &prop in proportions {
            let class_probability = if prop >= pi {
                p_in
            } else if prop <= 1.0 - pi {
                p_out
            } else {
                p_mid
            };
            score -= class_probability.max(1e-300).ln();
        }
        score
    }
}

/// The full calibration surface over (grid row, threshold) points. Masked
/// (infeasible or undefined) points keep their score and bound for
/// diagnostics; only `feasible` gates the arg-max.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoreSurface {
    /// NaN on undefined rows; persisted through sentinel encoding.
    #[serde(with = "crate::data::portable_grid")]
    pub scores: Array2<f64>,
    /// `+∞` where the bound degenerates; persisted through sentinel
    /// encoding.
    #[serde(with = "crate::data::portable_grid")]
    pub pfer: Array2<f64>,
    pub feasible: Array2<bool>,
}

impl ScoreSurface {
    pub fn n_rows(&self) -> usize {
        self.scores.nrows()
    }

    pub fn n_thresholds(&self) -> usize {
        self.scores.ncols()
    }

    pub fn any_feasible(&self) -> bool {
        self.feasible.iter().any(|&f| f)
    }
}
