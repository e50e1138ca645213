//! # Calibration
//!
//! Scores every (grid row, threshold) pair of the aggregated proportions,
//! masks out points that violate the PFER ceiling or sit on undefined rows,
//! and picks the unmasked point of maximal stability score. The whole
//! surface survives in the result for diagnostics.
//!
//! The calibrator moves `Unscored → Scored → (Optimum | Infeasible)` in one
//! consuming call: [`Calibrator::run`] takes `self`, so a finished
//! calibration cannot be mutated. Re-optimising with different bounds or
//! thresholds means building a new calibrator over the same proportions.

use crate::aggregate::Proportions;
use crate::grid::LambdaGrid;
use crate::score::{PferMethod, ScoreStrategy, ScoreSurface, pfer_bound};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("threshold grid is empty")]
    EmptyThresholds,

    #[error("proportions cover {props_rows} grid rows but the grid has {grid_rows}")]
    RowCountMismatch {
        props_rows: usize,
        grid_rows: usize,
    },

    #[error(
        "manual optimum ({row}, {threshold}) is out of range for a {n_rows} × {n_thresholds} surface"
    )]
    OverrideOutOfRange {
        row: usize,
        threshold: usize,
        n_rows: usize,
        n_thresholds: usize,
    },

    #[error("manual optimum points at grid row {row}, whose proportions are undefined")]
    OverrideUndefinedRow { row: usize },
}

/// Terminal state of a calibration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationOutcome {
    /// The unmasked point of maximal score (or the caller's override).
    Optimum { row: usize, threshold: usize },
    /// Every point violated the PFER ceiling or sat on an undefined row.
    /// Surfaced as-is; never silently replaced by an unconstrained optimum.
    Infeasible,
}

/// The score surface plus the selected point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub surface: ScoreSurface,
    pub outcome: CalibrationOutcome,
}

/// One-shot calibration over a fixed proportions tensor.
pub struct Calibrator<'a> {
    proportions: &'a Proportions,
    grid: &'a LambdaGrid,
    thresholds: &'a [f64],
    pfer_max: f64,
    method: PferMethod,
    strategy: &'a dyn ScoreStrategy,
}

impl<'a> Calibrator<'a> {
    pub fn new(
        proportions: &'a Proportions,
        grid: &'a LambdaGrid,
        thresholds: &'a [f64],
        pfer_max: f64,
        method: PferMethod,
        strategy: &'a dyn ScoreStrategy,
    ) -> Result<Self, CalibrationError> {
        if thresholds.is_empty() {
            return Err(CalibrationError::EmptyThresholds);
        }
        if proportions.n_rows() != grid.n_rows() {
            return Err(CalibrationError::RowCountMismatch {
                props_rows: proportions.n_rows(),
                grid_rows: grid.n_rows(),
            });
        }
        Ok(Self {
            proportions,
            grid,
            thresholds,
            pfer_max,
            method,
            strategy,
        })
    }

    /// Scores the surface and selects the arg-max under the PFER ceiling.
    pub fn run(self) -> CalibrationResult {
        let surface = self.score_surface();
        let outcome = self.select_optimum(&surface);
        if outcome == CalibrationOutcome::Infeasible {
            log::warn!(
                "no grid point satisfies the PFER ceiling {}; calibration is infeasible",
                self.pfer_max
            );
        }
        CalibrationResult { surface, outcome }
    }

    /// Scores the surface but takes the caller's point instead of the
    /// arg-max, bypassing the ranking entirely.
    pub fn run_with_override(
        self,
        row: usize,
        threshold: usize,
    ) -> Result<CalibrationResult, CalibrationError> {
        if row >= self.grid.n_rows() || threshold >= self.thresholds.len() {
            return Err(CalibrationError::OverrideOutOfRange {
                row,
                threshold,
                n_rows: self.grid.n_rows(),
                n_thresholds: self.thresholds.len(),
            });
        }
        if !self.proportions.row_defined(row) {
            return Err(CalibrationError::OverrideUndefinedRow { row });
        }
        let surface = self.score_surface();
        Ok(CalibrationResult {
            surface,
            outcome: CalibrationOutcome::Optimum { row, threshold },
        })
    }

    fn score_surface(&self) -> ScoreSurface {
        let n_rows = self.grid.n_rows();
        let n_thresholds = self.thresholds.len();
        let mut scores = Array2::from_elem((n_rows, n_thresholds), f64::NAN);
        let mut pfer = Array2::from_elem((n_rows, n_thresholds), f64::INFINITY);
        let mut feasible = Array2::from_elem((n_rows, n_thresholds), false);

        for r in 0..n_rows {
            if !self.proportions.row_defined(r) {
                log::warn!("grid row {r} has no valid resamples; its proportions are undefined");
                continue;
            }
            let row = self.proportions.row(r);
            let k_valid = self.proportions.valid[r];
            let q: f64 = row.sum();
            for (t, &pi) in self.thresholds.iter().enumerate() {
                let bound = pfer_bound(self.method, q, row.len(), pi, k_valid as usize);
                scores[[r, t]] = self.strategy.score(row.view(), pi, k_valid);
                pfer[[r, t]] = bound;
                feasible[[r, t]] = bound <= self.pfer_max;
            }
        }
        ScoreSurface {
            scores,
            pfer,
            feasible,
        }
    }

    /// Arg-max over unmasked points. Ties prefer the lexicographically
    /// smaller penalty row (the simpler model), then the smaller threshold.
    fn select_optimum(&self, surface: &ScoreSurface) -> CalibrationOutcome {
        let mut best: Option<(usize, usize, f64)> = None;
        for r in 0..surface.n_rows() {
            for t in 0..surface.n_thresholds() {
                if !surface.feasible[[r, t]] {
                    continue;
                }
                let score = surface.scores[[r, t]];
                if !score.is_finite() {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((best_r, best_t, best_score)) => {
                        if score > best_score {
                            true
                        } else if score < best_score {
                            false
                        } else {
                            match compare_lambda_rows(self.grid, r, best_r) {
                                std::cmp::Ordering::Less => true,
                                std::cmp::Ordering::Greater => false,
                                std::cmp::Ordering::Equal => {
                                    self.thresholds[t] < self.thresholds[best_t]
                                }
                            }
                        }
                    }
                };
                if better {
                    best = Some((r, t, score));
                }
            }
        }
        match best {
            Some((row, threshold, _)) => CalibrationOutcome::Optimum { row, threshold },
            None => CalibrationOutcome::Infeasible,
        }
    }
}

fn compare_lambda_rows(grid: &LambdaGrid, a: usize, b: usize) -> std::cmp::Ordering {
    let row_a = grid.row(a);
    let row_b = grid.row(b);
    for (va, vb) in row_a.iter().zip(row_b.iter()) {
        match va.total_cmp(vb) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}
