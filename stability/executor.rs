//! # Selection Executor
//!
//! Runs the plugged-in estimator over the whole penalty grid for a single
//! resample. Owns the two per-resample disciplines:
//!
//! - warm starts: consecutive grid rows sharing the same active-block mask
//!   reuse the previous row's solver state as an initial point; any template
//!   change forces a cold start. Sequencing is strictly within one resample,
//!   so resamples stay independent and parallelisable.
//! - degenerate-variance guard: columns that are constant on the subsample
//!   are perturbed with a small amount of noise before fitting and forcibly
//!   excluded from the selection afterwards, keeping them semantically
//!   "never selectable" without crashing the solver.

use crate::data::Dataset;
use crate::estimator::{Estimator, FitInput, SelectionPattern, SolverState};
use crate::grid::{LambdaGrid, SequentialTemplate};
use ndarray::{Array2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("resample index {index} is out of range for {n_obs} observations")]
    IndexOutOfRange { index: usize, n_obs: usize },

    #[error(
        "estimator output at grid row {row} has the wrong shape: expected {expected} \
         candidate columns, found {found}"
    )]
    OutputShapeMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("estimator returned an asymmetric or non-zero-diagonal adjacency at grid row {row}")]
    MalformedAdjacency { row: usize },
}

/// Degenerate-variance guard settings.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GuardSettings {
    /// Perturbation noise standard deviation, as a fraction of the smallest
    /// non-zero column standard deviation of the subsample.
    pub noise_scale: f64,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self { noise_scale: 1e-2 }
    }
}

/// The selection outcome of one resample: one pattern per grid row, plus the
/// columns the degenerate-variance guard had to perturb.
#[derive(Clone, Debug)]
pub struct ResampleSelection {
    pub rows: Vec<SelectionPattern>,
    pub perturbed: Vec<usize>,
}

/// Fits every grid row on the given resample and returns the per-row binary
/// selections. Estimator convergence failures surface as
/// [`SelectionPattern::Invalid`] rows; only structural problems (bad
/// indices, malformed estimator output) are hard errors.
pub fn run_resample(
    data: &Dataset,
    indices: &[usize],
    grid: &LambdaGrid,
    template: &SequentialTemplate,
    estimator: &dyn Estimator,
    guard: &GuardSettings,
    seed: u64,
) -> Result<ResampleSelection, ExecError> {
    let n_obs = data.n_obs();
    if let Some(&bad) = indices.iter().find(|&&i| i >= n_obs) {
        return Err(ExecError::IndexOutOfRange { index: bad, n_obs });
    }

    let mut x_sub = data.x().select(Axis(0), indices);
    let y_sub = data.y().map(|y| y.select(Axis(0), indices));

    let perturbed = apply_degenerate_guard(&mut x_sub, guard, seed);
    if perturbed.len() == x_sub.ncols() {
        // Every column was constant; nothing can be estimated on this draw.
        log::warn!("resample is constant in every column; marking all grid rows invalid");
        return Ok(ResampleSelection {
            rows: vec![SelectionPattern::Invalid; grid.n_rows()],
            perturbed,
        });
    }

    let expected = estimator.output().n_candidates();
    let mut rows = Vec::with_capacity(grid.n_rows());
    let mut warm: Option<SolverState> = None;
    let mut prev_active: Option<Vec<bool>> = None;

    for r in 0..grid.n_rows() {
        let active = template.row(r);
        // A template change means the previous solver state describes a
        // different active-block structure; discard it.
        if prev_active.as_deref() != Some(active.as_slice()) {
            warm = None;
        }

        let outcome = estimator.fit(FitInput {
            x: x_sub.view(),
            y: y_sub.as_ref().map(Array2::view),
            penalty: grid.row(r),
            active: &active,
            warm: warm.as_ref(),
        });

        let mut pattern = outcome.selected;
        validate_pattern(&pattern, estimator.output().n_vars(), expected, r)?;

        // Non-finite coefficients alongside a "converged" pattern are a
        // degenerate fit; demote to the invalid sentinel.
        if let Some(coefficients) = &outcome.coefficients {
            if coefficients.iter().any(|c| !c.is_finite()) {
                log::warn!("non-finite coefficients at grid row {r}; marking the row invalid");
                pattern = SelectionPattern::Invalid;
            }
        }

        if pattern.is_invalid() {
            warm = None;
        } else {
            scrub_perturbed(&mut pattern, &perturbed);
            warm = outcome.state;
        }
        prev_active = Some(active);
        rows.push(pattern);
    }

    Ok(ResampleSelection { rows, perturbed })
}

/// Perturbs zero-variance columns in place and returns their indices.
fn apply_degenerate_guard(
    x_sub: &mut Array2<f64>,
    guard: &GuardSettings,
    seed: u64,
) -> Vec<usize> {
    let m = x_sub.nrows() as f64;
    let sds: Vec<f64> = (0..x_sub.ncols())
        .map(|j| {
            let col = x_sub.column(j);
            let mean = col.sum() / m;
            (col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / m).sqrt()
        })
        .collect();
    let perturbed: Vec<usize> = sds
        .iter()
        .enumerate()
        .filter(|&(_, &sd)| sd == 0.0)
        .map(|(j, _)| j)
        .collect();
    if perturbed.is_empty() || perturbed.len() == sds.len() {
        return perturbed;
    }

    let min_sd = sds
        .iter()
        .copied()
        .filter(|&sd| sd > 0.0)
        .fold(f64::INFINITY, f64::min);
    let Ok(noise) = Normal::new(0.0, guard.noise_scale * min_sd) else {
        return perturbed;
    };
    let mut rng = StdRng::seed_from_u64(seed ^ 0xA5A5_5A5A_DEAD_BEEF);
    for &j in &perturbed {
        for v in x_sub.column_mut(j) {
            *v += noise.sample(&mut rng);
        }
    }
    log::warn!(
        "degenerate-variance guard perturbed {} constant column(s): {:?}",
        perturbed.len(),
        perturbed
    );
    perturbed
}

/// Forces perturbed columns out of the selection: a column that was constant
/// on the subsample is never reported as selected, and no edge may touch it.
fn scrub_perturbed(pattern: &mut SelectionPattern, perturbed: &[usize]) {
    match pattern {
        SelectionPattern::Features(selected) => {
            for &j in perturbed {
                selected[j] = false;
            }
        }
        SelectionPattern::Edges(adjacency) => {
            for &j in perturbed {
                adjacency.row_mut(j).fill(false);
                adjacency.column_mut(j).fill(false);
            }
        }
        SelectionPattern::Invalid => {}
    }
}

fn validate_pattern(
    pattern: &SelectionPattern,
    n_vars: usize,
    n_candidates: usize,
    row: usize,
) -> Result<(), ExecError> {
    match pattern {
        SelectionPattern::Features(selected) => {
            if selected.len() != n_vars {
                return Err(ExecError::OutputShapeMismatch {
                    row,
                    expected: n_candidates,
                    found: selected.len(),
                });
            }
        }
        SelectionPattern::Edges(adjacency) => {
            if adjacency.nrows() != n_vars || adjacency.ncols() != n_vars {
                return Err(ExecError::OutputShapeMismatch {
                    row,
                    expected: n_candidates,
                    found: adjacency.nrows() * adjacency.ncols() / 2,
                });
            }
            for i in 0..n_vars {
                if adjacency[[i, i]] {
                    return Err(ExecError::MalformedAdjacency { row });
                }
                for j in (i + 1)..n_vars {
                    if adjacency[[i, j]] != adjacency[[j, i]] {
                        return Err(ExecError::MalformedAdjacency { row });
                    }
                }
            }
        }
        SelectionPattern::Invalid => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Family;
    use crate::estimator::{FitOutcome, OutputShape};
    use crate::grid::{GridSpec, build};
    use ndarray::{Array1, Array2};
    use std::sync::Mutex;

    /// Selects every feature and records the warm-start states it saw.
    struct SelectAll {
        p: usize,
        warm_seen: Mutex<Vec<bool>>,
    }

    impl Estimator for SelectAll {
        fn output(&self) -> OutputShape {
            OutputShape::Features(self.p)
        }

        fn fit(&self, input: FitInput<'_>) -> FitOutcome {
            self.warm_seen.lock().unwrap().push(input.warm.is_some());
            FitOutcome {
                selected: SelectionPattern::Features(Array1::from_elem(self.p, true)),
                coefficients: None,
                state: Some(SolverState::default()),
            }
        }
    }

    fn dataset_with_constant_column() -> Dataset {
        let mut x = Array2::zeros((6, 3));
        for i in 0..6 {
            x[[i, 0]] = i as f64;
            x[[i, 1]] = 3.0; // constant
            x[[i, 2]] = (i as f64) * 0.5 + 1.0;
        }
        Dataset::new(x, None, None).unwrap()
    }

    #[test]
    fn constant_column_is_never_selected() {
        let data = dataset_with_constant_column();
        let spec = GridSpec {
            n_points: 2,
            ..GridSpec::default()
        };
        let (grid, template) = build(&data, Family::Graphical, &spec).unwrap();
        let estimator = SelectAll {
            p: 3,
            warm_seen: Mutex::new(Vec::new()),
        };
        let indices: Vec<usize> = (0..6).collect();
        let result = run_resample(
            &data,
            &indices,
            &grid,
            &template,
            &estimator,
            &GuardSettings::default(),
            17,
        )
        .unwrap();
        assert_eq!(result.perturbed, vec![1]);
        for row in &result.rows {
            match row {
                SelectionPattern::Features(selected) => {
                    assert!(selected[0]);
                    assert!(!selected[1]);
                    assert!(selected[2]);
                }
                other => panic!("unexpected pattern {other:?}"),
            }
        }
    }

    #[test]
    fn warm_start_resets_on_template_change() {
        let x = Array2::from_shape_fn((8, 4), |(i, j)| {
            ((i * 7 + j * 3) % 5) as f64 + 0.2 * i as f64
        });
        let data = Dataset::new(x, None, Some(vec![0, 0, 1, 1])).unwrap();
        let spec = GridSpec {
            n_points: 3,
            ..GridSpec::default()
        };
        let (grid, template) = build(&data, Family::Graphical, &spec).unwrap();
        assert_eq!(grid.n_rows(), 6);
        let estimator = SelectAll {
            p: 4,
            warm_seen: Mutex::new(Vec::new()),
        };
        let indices: Vec<usize> = (0..8).collect();
        run_resample(
            &data,
            &indices,
            &grid,
            &template,
            &estimator,
            &GuardSettings::default(),
            3,
        )
        .unwrap();
        // Cold start at each block boundary, warm within a block.
        let warm_seen = estimator.warm_seen.into_inner().unwrap();
        assert_eq!(warm_seen, vec![false, true, true, false, true, true]);
    }

    #[test]
    fn non_finite_coefficients_demote_to_invalid() {
        struct Degenerate;
        impl Estimator for Degenerate {
            fn output(&self) -> OutputShape {
                OutputShape::Features(2)
            }
            fn fit(&self, _input: FitInput<'_>) -> FitOutcome {
                FitOutcome {
                    selected: SelectionPattern::Features(Array1::from_elem(2, true)),
                    coefficients: Some(ndarray::array![1.0, f64::INFINITY]),
                    state: None,
                }
            }
        }
        let x = Array2::from_shape_fn((5, 2), |(i, j)| (i + j) as f64 + 0.3);
        let data = Dataset::new(x, None, None).unwrap();
        let spec = GridSpec {
            n_points: 1,
            ..GridSpec::default()
        };
        let (grid, template) = build(&data, Family::Graphical, &spec).unwrap();
        let result = run_resample(
            &data,
            &[0, 1, 2, 3],
            &grid,
            &template,
            &Degenerate,
            &GuardSettings::default(),
            0,
        )
        .unwrap();
        assert!(result.rows[0].is_invalid());
    }

    #[test]
    fn out_of_range_index_is_a_hard_error() {
        let data = dataset_with_constant_column();
        let spec = GridSpec {
            n_points: 1,
            ..GridSpec::default()
        };
        let (grid, template) = build(&data, Family::Graphical, &spec).unwrap();
        let estimator = SelectAll {
            p: 3,
            warm_seen: Mutex::new(Vec::new()),
        };
        let err = run_resample(
            &data,
            &[0, 99],
            &grid,
            &template,
            &estimator,
            &GuardSettings::default(),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, ExecError::IndexOutOfRange { index: 99, .. }));
    }
}
