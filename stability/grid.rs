//! # Penalty Grid and Block Template Construction
//!
//! Builds the sparsity-parameter grid the executor traverses and the
//! sequential template that schedules which variable block is actively
//! calibrated at each grid row of a multi-block graphical problem.
//!
//! Default grids are geometric sequences descending from an analytically
//! derived λ_max (the smallest penalty that selects nothing) to a small
//! fraction of it. Callers may supply an explicit sequence instead, and a
//! length-1 sequence fixes that axis rather than searching it.

use crate::data::{Dataset, Family};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("a penalty grid needs at least one value")]
    EmptyGrid,

    #[error("penalty values must be positive and finite; found {value}")]
    BadPenaltyValue { value: f64 },

    #[error("min_ratio = {min_ratio} must lie in (0, 1]")]
    BadMinRatio { min_ratio: f64 },

    #[error("selection-frequency thresholds must lie in (0.5, 1); found {value}")]
    ThresholdOutOfRange { value: f64 },

    #[error("threshold grid is empty")]
    EmptyThresholds,

    #[error("family {family:?} derives its grid from an outcome, but the dataset has no `Y`")]
    MissingOutcome { family: Family },
}

/// Caller-facing grid configuration. `explicit` overrides the derived
/// geometric sequence; `joint` switches a multi-block problem from
/// block-sequential to all-blocks-active calibration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GridSpec {
    pub n_points: usize,
    pub min_ratio: f64,
    pub explicit: Option<Vec<f64>>,
    pub joint: bool,
    /// Penalty pinned onto the non-active blocks of a sequential template
    /// row. Weak, so held-fixed blocks stay dense while one block is
    /// calibrated.
    pub weak_penalty: f64,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            n_points: 20,
            min_ratio: 1e-2,
            explicit: None,
            joint: false,
            weak_penalty: 0.1,
        }
    }
}

/// The penalty grid: one row per grid point, one column per block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LambdaGrid {
    values: Array2<f64>,
}

impl LambdaGrid {
    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_blocks(&self) -> usize {
        self.values.ncols()
    }

    pub fn row(&self, r: usize) -> ndarray::ArrayView1<'_, f64> {
        self.values.row(r)
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }
}

/// Boolean schedule, rows × blocks: which block is actively calibrated at
/// each grid row. Non-joint multi-block templates have exactly one active
/// block per row; joint templates are all-true.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequentialTemplate {
    active: Array2<bool>,
}

impl SequentialTemplate {
    pub fn row(&self, r: usize) -> Vec<bool> {
        self.active.row(r).to_vec()
    }

    pub fn active(&self) -> &Array2<bool> {
        &self.active
    }
}

/// Smallest penalty that selects zero features in the lasso family:
/// `max_j |x_jᵀ y_c| / n` over predictors and outcome columns.
pub fn lambda_max_regression(x: ArrayView2<'_, f64>, y: ArrayView2<'_, f64>) -> f64 {
    let n = x.nrows() as f64;
    let mut max = 0.0_f64;
    for j in 0..x.ncols() {
        let col = x.column(j);
        for c in 0..y.ncols() {
            let dot: f64 = col.iter().zip(y.column(c).iter()).map(|(a, b)| a * b).sum();
            max = max.max(dot.abs() / n);
        }
    }
    max
}

/// Smallest penalty that yields an empty graph in the graphical lasso: the
/// largest absolute off-diagonal entry of the sample covariance, restricted
/// to the given columns.
pub fn lambda_max_graphical(x: ArrayView2<'_, f64>, columns: &[usize]) -> f64 {
    let n = x.nrows() as f64;
    let means: Vec<f64> = columns
        .iter()
        .map(|&j| x.column(j).sum() / n)
        .collect();
    let mut max = 0.0_f64;
    for (a, &ja) in columns.iter().enumerate() {
        for (b, &jb) in columns.iter().enumerate().skip(a + 1) {
            let cov: f64 = x
                .column(ja)
                .iter()
                .zip(x.column(jb).iter())
                .map(|(u, v)| (u - means[a]) * (v - means[b]))
                .sum::<f64>()
                / n;
            max = max.max(cov.abs());
        }
    }
    max
}

/// Geometrically spaced sequence descending from `lambda_max` to
/// `lambda_max · min_ratio`. A single point disables calibration over the
/// axis (the axis is fixed, not searched).
pub fn geometric_sequence(
    lambda_max: f64,
    n_points: usize,
    min_ratio: f64,
) -> Result<Array1<f64>, GridError> {
    if n_points == 0 {
        return Err(GridError::EmptyGrid);
    }
    if !(lambda_max.is_finite() && lambda_max > 0.0) {
        return Err(GridError::BadPenaltyValue { value: lambda_max });
    }
    if !(min_ratio > 0.0 && min_ratio <= 1.0) {
        return Err(GridError::BadMinRatio { min_ratio });
    }
    if n_points == 1 {
        return Ok(Array1::from_elem(1, lambda_max));
    }
    let step = min_ratio.ln() / (n_points - 1) as f64;
    Ok(Array1::from_iter(
        (0..n_points).map(|i| lambda_max * (step * i as f64).exp()),
    ))
}

/// Builds the penalty grid and the sequential template for `data`.
///
/// Single-block problems get a rows×1 grid with an all-true template.
/// Multi-block problems expand to `n_blocks × n_points` rows: row `r`
/// activates exactly the block under calibration and pins every other block
/// at the weak penalty, iterating blocks in natural order. `joint` mode
/// instead varies all blocks together with an all-true template.
pub fn build(
    data: &Dataset,
    family: Family,
    spec: &GridSpec,
) -> Result<(LambdaGrid, SequentialTemplate), GridError> {
    let n_blocks = data.n_blocks();
    let base = |columns: &[usize]| -> Result<Array1<f64>, GridError> {
        if let Some(values) = &spec.explicit {
            if values.is_empty() {
                return Err(GridError::EmptyGrid);
            }
            for &v in values {
                if !(v.is_finite() && v > 0.0) {
                    return Err(GridError::BadPenaltyValue { value: v });
                }
            }
            return Ok(Array1::from_vec(values.clone()));
        }
        let lambda_max = match family {
            Family::Gaussian | Family::Binomial | Family::Cox => {
                let y = data
                    .y()
                    .ok_or(GridError::MissingOutcome { family })?;
                lambda_max_regression(data.x().view(), y.view())
            }
            Family::Graphical | Family::Clustering => {
                lambda_max_graphical(data.x().view(), columns)
            }
        };
        geometric_sequence(lambda_max, spec.n_points, spec.min_ratio)
    };

    if n_blocks == 1 {
        let seq = base(&(0..data.n_vars()).collect::<Vec<_>>())?;
        let rows = seq.len();
        let values = seq.into_shape_with_order((rows, 1)).map_err(|_| GridError::EmptyGrid)?;
        let active = Array2::from_elem((rows, 1), true);
        return Ok((
            LambdaGrid { values },
            SequentialTemplate { active },
        ));
    }

    // Per-block sequences, derived from each block's own columns.
    let mut block_seqs = Vec::with_capacity(n_blocks);
    for b in 0..n_blocks {
        let columns: Vec<usize> = data
            .blocks()
            .map(|labels| {
                labels
                    .iter()
                    .enumerate()
                    .filter(|&(_, &l)| l == b)
                    .map(|(j, _)| j)
                    .collect()
            })
            .unwrap_or_default();
        block_seqs.push(base(&columns)?);
    }

    if spec.joint {
        let rows = block_seqs.iter().map(|seq| seq.len()).min().unwrap_or(0);
        if rows == 0 {
            return Err(GridError::EmptyGrid);
        }
        let mut values = Array2::zeros((rows, n_blocks));
        for r in 0..rows {
            for (b, seq) in block_seqs.iter().enumerate() {
                values[[r, b]] = seq[r];
            }
        }
        let active = Array2::from_elem((rows, n_blocks), true);
        return Ok((
            LambdaGrid { values },
            SequentialTemplate { active },
        ));
    }

    let rows: usize = block_seqs.iter().map(|seq| seq.len()).sum();
    let mut values = Array2::from_elem((rows, n_blocks), spec.weak_penalty);
    let mut active = Array2::from_elem((rows, n_blocks), false);
    let mut r = 0;
    for (b, seq) in block_seqs.iter().enumerate() {
        for &lambda in seq {
            values[[r, b]] = lambda;
            active[[r, b]] = true;
            r += 1;
        }
    }
    Ok((
        LambdaGrid { values },
        SequentialTemplate { active },
    ))
}

/// Default selection-frequency thresholds: π ∈ {0.60, 0.61, ..., 0.90}.
pub fn default_threshold_grid() -> Vec<f64> {
    (0..=30).map(|i| 0.60 + 0.01 * i as f64).collect()
}

/// Validates a caller-supplied threshold grid.
pub fn validate_thresholds(thresholds: &[f64]) -> Result<(), GridError> {
    if thresholds.is_empty() {
        return Err(GridError::EmptyThresholds);
    }
    for &pi in thresholds {
        if !(pi > 0.5 && pi < 1.0) {
            return Err(GridError::ThresholdOutOfRange { value: pi });
        }
    }
    Ok(())
}
