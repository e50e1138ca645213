//! # Estimator Plugin Contract
//!
//! The single external collaborator the core consumes. An estimator fits one
//! penalty row on one subsample and reports which features (or edges) it
//! selected. Convergence failures are reported through the
//! [`SelectionPattern::Invalid`] sentinel rather than an error, so one bad
//! fit never aborts the batch.
//!
//! Dispatch between built-in estimator families is by explicit tag
//! ([`EstimatorKind`]) through a registry; there is no runtime signature
//! introspection.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Shape of an estimator's selection output: a per-feature indicator or a
/// symmetric zero-diagonal adjacency over `p` variables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputShape {
    Features(usize),
    Edges(usize),
}

impl OutputShape {
    /// Number of distinct selectable candidates: `p` features, or
    /// `p(p-1)/2` edges.
    pub fn n_candidates(&self) -> usize {
        match *self {
            OutputShape::Features(p) => p,
            OutputShape::Edges(p) => p * (p - 1) / 2,
        }
    }

    pub fn n_vars(&self) -> usize {
        match *self {
            OutputShape::Features(p) | OutputShape::Edges(p) => p,
        }
    }
}

/// Binary selection outcome of one fit. `Invalid` is the sentinel for a fit
/// that failed to converge or returned degenerate coefficients; it is
/// excluded from the aggregation denominator, never counted as
/// "selected = none".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SelectionPattern {
    /// One indicator per candidate feature.
    Features(Array1<bool>),
    /// Symmetric adjacency with a zero diagonal.
    Edges(Array2<bool>),
    Invalid,
}

impl SelectionPattern {
    pub fn is_invalid(&self) -> bool {
        matches!(self, SelectionPattern::Invalid)
    }
}

/// Internal model state an estimator may hand back for warm-starting the
/// next grid row: an estimated covariance/precision matrix, fitted
/// coefficients, or both. Threaded functionally through the grid traversal
/// of one resample; never shared across resamples.
#[derive(Clone, Debug, Default)]
pub struct SolverState {
    pub precision: Option<Array2<f64>>,
    pub coefficients: Option<Array1<f64>>,
}

/// Everything an estimator sees for one fit.
pub struct FitInput<'a> {
    /// Subsampled observations, `m × p`.
    pub x: ArrayView2<'a, f64>,
    /// Subsampled outcomes, where the family has them.
    pub y: Option<ArrayView2<'a, f64>>,
    /// Per-block penalty values for this grid row.
    pub penalty: ArrayView1<'a, f64>,
    /// Which blocks are actively calibrated at this row; held-fixed blocks
    /// carry the weak penalty in `penalty`.
    pub active: &'a [bool],
    /// State from the previous grid row, when the active mask is unchanged.
    pub warm: Option<&'a SolverState>,
}

/// Result of one fit.
pub struct FitOutcome {
    pub selected: SelectionPattern,
    pub coefficients: Option<Array1<f64>>,
    pub state: Option<SolverState>,
}

/// The pluggable estimation contract. Implementations must be safe to call
/// concurrently on disjoint data views and must report convergence failure
/// via [`SelectionPattern::Invalid`] instead of panicking.
pub trait Estimator: Send + Sync {
    /// Declared output shape; the executor validates every fit against it.
    fn output(&self) -> OutputShape;

    fn fit(&self, input: FitInput<'_>) -> FitOutcome;
}

/// Tags for the built-in estimator families. The estimation mathematics is
/// supplied by callers; the tag only routes registry lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EstimatorKind {
    LassoFamily,
    GraphicalLasso,
    SparsePca,
    SparsePls,
    Clustering,
}

/// Registry of estimator implementations keyed by explicit tag.
#[derive(Default)]
pub struct EstimatorRegistry {
    entries: HashMap<EstimatorKind, Arc<dyn Estimator>>,
}

impl EstimatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the implementation for a kind.
    pub fn register(&mut self, kind: EstimatorKind, estimator: Arc<dyn Estimator>) {
        self.entries.insert(kind, estimator);
    }

    pub fn get(&self, kind: EstimatorKind) -> Option<Arc<dyn Estimator>> {
        self.entries.get(&kind).cloned()
    }

    pub fn is_registered(&self, kind: EstimatorKind) -> bool {
        self.entries.contains_key(&kind)
    }
}
