//! # Selection Aggregation
//!
//! Accumulates per-resample binary selections into count tensors and turns
//! them into selection proportions. Accumulation is purely additive, so
//! partial aggregates from independent workers merge by elementwise
//! summation in any order; the merged result is invariant to scheduling.
//!
//! Invalid grid rows (estimator failures) are skipped entirely: a separate
//! per-row valid count tracks the true denominator, so proportions divide by
//! the number of successful resamples rather than by K blindly.

use crate::estimator::{OutputShape, SelectionPattern};
use crate::executor::ResampleSelection;
use itertools::Itertools;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Per-(grid-row, candidate) selection counts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CountsStorage {
    /// `rows × p` feature counts.
    Features(Array2<u32>),
    /// Per grid row, a symmetric `p × p` edge-count matrix.
    Edges(Vec<Array2<u32>>),
}

/// The counts tensor plus its per-row denominators. The aggregator is the
/// only component that mutates counts; everything downstream reads the
/// derived [`Proportions`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    counts: CountsStorage,
    valid: Array1<u32>,
    perturbed: Vec<usize>,
}

impl Aggregate {
    pub fn empty(shape: OutputShape, n_rows: usize) -> Self {
        let counts = match shape {
            OutputShape::Features(p) => CountsStorage::Features(Array2::zeros((n_rows, p))),
            OutputShape::Edges(p) => {
                CountsStorage::Edges(vec![Array2::zeros((p, p)); n_rows])
            }
        };
        Self {
            counts,
            valid: Array1::zeros(n_rows),
            perturbed: Vec::new(),
        }
    }

    /// Adds one resample's selections. Invalid rows are skipped and do not
    /// enter that row's denominator.
    pub fn accumulate(&mut self, selection: &ResampleSelection) {
        for (r, pattern) in selection.rows.iter().enumerate() {
            match (pattern, &mut self.counts) {
                (SelectionPattern::Features(selected), CountsStorage::Features(counts)) => {
                    for (j, &s) in selected.iter().enumerate() {
                        if s {
                            counts[[r, j]] += 1;
                        }
                    }
                    self.valid[r] += 1;
                }
                (SelectionPattern::Edges(adjacency), CountsStorage::Edges(counts)) => {
                    for ((i, j), &s) in adjacency.indexed_iter() {
                        if s {
                            counts[r][[i, j]] += 1;
                        }
                    }
                    self.valid[r] += 1;
                }
                (SelectionPattern::Invalid, _) => {}
                // Shape families are fixed per run by the estimator contract.
                _ => debug_assert!(false, "selection pattern does not match counts storage"),
            }
        }
        for &j in &selection.perturbed {
            if !self.perturbed.contains(&j) {
                self.perturbed.push(j);
            }
        }
    }

    /// Elementwise merge of two partial aggregates. Associative and
    /// commutative; this is the system's sole parallelism axis.
    pub fn merge(mut self, other: Self) -> Self {
        match (&mut self.counts, other.counts) {
            (CountsStorage::Features(a), CountsStorage::Features(b)) => *a += &b,
            (CountsStorage::Edges(a), CountsStorage::Edges(b)) => {
                for (ma, mb) in a.iter_mut().zip(b) {
                    *ma += &mb;
                }
            }
            _ => debug_assert!(false, "cannot merge aggregates of different shapes"),
        }
        self.valid += &other.valid;
        self.perturbed = std::mem::take(&mut self.perturbed)
            .into_iter()
            .chain(other.perturbed)
            .sorted_unstable()
            .dedup()
            .collect();
        self
    }

    pub fn valid_counts(&self) -> &Array1<u32> {
        &self.valid
    }

    pub fn counts(&self) -> &CountsStorage {
        &self.counts
    }

    pub fn perturbed_columns(&self) -> &[usize] {
        &self.perturbed
    }

    /// Derives selection proportions. Rows with a zero denominator come out
    /// as `NaN` (undefined), never silently zero.
    pub fn proportions(&self) -> Proportions {
        let storage = match &self.counts {
            CountsStorage::Features(counts) => {
                let mut props = Array2::from_elem(counts.dim(), f64::NAN);
                for ((r, j), &c) in counts.indexed_iter() {
                    if self.valid[r] > 0 {
                        props[[r, j]] = f64::from(c) / f64::from(self.valid[r]);
                    }
                }
                ProportionsStorage::Features(props)
            }
            CountsStorage::Edges(counts) => {
                let props = counts
                    .iter()
                    .enumerate()
                    .map(|(r, m)| {
                        if self.valid[r] > 0 {
                            m.mapv(|c| f64::from(c) / f64::from(self.valid[r]))
                        } else {
                            Array2::from_elem(m.dim(), f64::NAN)
                        }
                    })
                    .collect();
                ProportionsStorage::Edges(props)
            }
        };
        Proportions {
            storage,
            valid: self.valid.clone(),
        }
    }
}

/// Selection proportions, same layout as [`CountsStorage`]. Undefined rows
/// hold NaN, so persistence goes through the sentinel-encoding adapters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ProportionsStorage {
    Features(#[serde(with = "crate::data::portable_grid")] Array2<f64>),
    Edges(#[serde(with = "crate::data::portable_grids")] Vec<Array2<f64>>),
}

/// Read-only proportions plus the denominators they were computed over.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proportions {
    pub storage: ProportionsStorage,
    pub valid: Array1<u32>,
}

impl Proportions {
    pub fn n_rows(&self) -> usize {
        self.valid.len()
    }

    /// Whether the row's proportions are defined (at least one valid
    /// resample contributed).
    pub fn row_defined(&self, r: usize) -> bool {
        self.valid[r] > 0
    }

    /// The row's candidate proportions as a flat vector: per-feature values,
    /// or the strict upper triangle for edge families.
    pub fn row(&self, r: usize) -> Array1<f64> {
        match &self.storage {
            ProportionsStorage::Features(props) => props.row(r).to_owned(),
            ProportionsStorage::Edges(props) => {
                let m = &props[r];
                let p = m.nrows();
                let mut flat = Vec::with_capacity(p * (p - 1) / 2);
                for i in 0..p {
                    for j in (i + 1)..p {
                        flat.push(m[[i, j]]);
                    }
                }
                Array1::from_vec(flat)
            }
        }
    }

    /// Binarises the row at threshold `pi` into a selection pattern of the
    /// run's native shape.
    pub fn binarise(&self, r: usize, pi: f64) -> SelectionPattern {
        match &self.storage {
            ProportionsStorage::Features(props) => {
                SelectionPattern::Features(props.row(r).mapv(|v| v >= pi))
            }
            ProportionsStorage::Edges(props) => {
                SelectionPattern::Edges(props[r].mapv(|v| v >= pi))
            }
        }
    }
}
