//! # Dataset Container and Validation
//!
//! The exclusive entry point for caller-provided data. Observations arrive as
//! an `n × p` matrix `X`, optionally paired with an outcome matrix `Y` and a
//! block-label vector partitioning the variables into groups (used by the
//! grid builder for multi-block graphical problems).
//!
//! Failures here are assumed to be caller errors; `DataError` is written to
//! give actionable feedback before any resampling starts.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Model family of the plugged-in estimator. Drives the default
/// stratification rule of the resampler and the λ_max derivation of the
/// grid builder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    /// Continuous outcome; simple random resampling.
    Gaussian,
    /// Classification outcome; resamples are stratified by class.
    Binomial,
    /// Survival outcome `(time, status)`; resamples are stratified by
    /// event/censoring status.
    Cox,
    /// Gaussian graphical model over the variables of `X`; no outcome.
    Graphical,
    /// Consensus clustering over the observations; no outcome.
    Clustering,
}

/// A comprehensive error type for dataset validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("the dataset has no observations")]
    EmptyData,

    #[error("the dataset has no variables")]
    NoVariables,

    #[error("`X` has {x_rows} rows but `Y` has {y_rows}; observation counts must match")]
    RowCountMismatch { x_rows: usize, y_rows: usize },

    #[error("non-finite value (NaN or infinity) at row {row}, column {col} of `{matrix}`")]
    NonFiniteValue {
        matrix: &'static str,
        row: usize,
        col: usize,
    },

    #[error("block label vector has {len} entries but `X` has {n_vars} variables")]
    BlockLengthMismatch { len: usize, n_vars: usize },

    #[error("block labels must cover 0..{expected} contiguously; label {found} is out of range")]
    BadBlockLabel { expected: usize, found: usize },
}

/// A validated dataset, immutable for the lifetime of a run. All workers
/// share it by read-only reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    x: Array2<f64>,
    y: Option<Array2<f64>>,
    blocks: Option<Vec<usize>>,
}

impl Dataset {
    /// Validates and wraps the raw matrices.
    pub fn new(
        x: Array2<f64>,
        y: Option<Array2<f64>>,
        blocks: Option<Vec<usize>>,
    ) -> Result<Self, DataError> {
        if x.nrows() == 0 {
            return Err(DataError::EmptyData);
        }
        if x.ncols() == 0 {
            return Err(DataError::NoVariables);
        }
        validate_finite(&x, "X")?;
        if let Some(y) = &y {
            if y.nrows() != x.nrows() {
                return Err(DataError::RowCountMismatch {
                    x_rows: x.nrows(),
                    y_rows: y.nrows(),
                });
            }
            validate_finite(y, "Y")?;
        }
        if let Some(blocks) = &blocks {
            if blocks.len() != x.ncols() {
                return Err(DataError::BlockLengthMismatch {
                    len: blocks.len(),
                    n_vars: x.ncols(),
                });
            }
            let n_blocks = blocks.iter().max().map_or(0, |&m| m + 1);
            let mut seen = vec![false; n_blocks];
            for &b in blocks {
                seen[b] = true;
            }
            if let Some(missing) = seen.iter().position(|&s| !s) {
                return Err(DataError::BadBlockLabel {
                    expected: n_blocks,
                    found: missing,
                });
            }
        }
        Ok(Self { x, y, blocks })
    }

    pub fn n_obs(&self) -> usize {
        self.x.nrows()
    }

    pub fn n_vars(&self) -> usize {
        self.x.ncols()
    }

    /// Number of variable blocks; 1 when no grouping was supplied.
    pub fn n_blocks(&self) -> usize {
        self.blocks
            .as_ref()
            .map_or(1, |b| b.iter().max().map_or(1, |&m| m + 1))
    }

    pub fn x(&self) -> &Array2<f64> {
        &self.x
    }

    pub fn y(&self) -> Option<&Array2<f64>> {
        self.y.as_ref()
    }

    pub fn blocks(&self) -> Option<&[usize]> {
        self.blocks.as_deref()
    }
}

/// Family-aware default stratification key for the resampler.
///
/// Classification outcomes are stratified by class label, survival outcomes
/// by event/censoring status (second column of `Y`, or the only column when
/// `Y` has one). Continuous and outcome-free families use simple random
/// sampling.
pub fn default_strata(family: Family, y: Option<&Array2<f64>>) -> Option<Vec<usize>> {
    let y = y?;
    let column = match family {
        Family::Binomial => y.column(0),
        Family::Cox => y.column(y.ncols().saturating_sub(1).min(1)),
        Family::Gaussian | Family::Graphical | Family::Clustering => return None,
    };
    // Map the distinct outcome values (in sorted order) to 0-based labels.
    let mut levels: Vec<f64> = column.iter().copied().collect();
    levels.sort_by(|a, b| a.total_cmp(b));
    levels.dedup();
    let labels = column
        .iter()
        .map(|v| levels.partition_point(|l| l < v))
        .collect();
    Some(labels)
}

/// JSON has no literals for the non-finite values the engine produces by
/// design (infinite PFER bounds and ceilings, NaN proportions and scores on
/// undefined rows); serde_json writes them as `null`, which cannot be read
/// back into `f64`. The adapters below spell them as string sentinels so
/// persisted models round-trip losslessly.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PortableF64 {
    Finite(f64),
    Sentinel(String),
}

impl PortableF64 {
    fn encode(v: f64) -> Self {
        if v.is_finite() {
            PortableF64::Finite(v)
        } else if v.is_nan() {
            PortableF64::Sentinel("nan".to_owned())
        } else if v.is_sign_positive() {
            PortableF64::Sentinel("inf".to_owned())
        } else {
            PortableF64::Sentinel("-inf".to_owned())
        }
    }

    fn decode<E: serde::de::Error>(self) -> Result<f64, E> {
        match self {
            PortableF64::Finite(v) => Ok(v),
            PortableF64::Sentinel(s) => match s.as_str() {
                "nan" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(E::custom(format!("unrecognised float sentinel `{other}`"))),
            },
        }
    }
}

/// serde adapter for a scalar that may be `±∞` or `NaN`.
pub(crate) mod portable_float {
    use super::PortableF64;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        PortableF64::encode(*v).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        PortableF64::deserialize(deserializer)?.decode()
    }
}

/// serde adapter for an `Array2<f64>` that may hold non-finite entries.
pub(crate) mod portable_grid {
    use super::PortableF64;
    use ndarray::Array2;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        grid: &Array2<f64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let cells: Vec<PortableF64> = grid.iter().copied().map(PortableF64::encode).collect();
        (grid.nrows(), grid.ncols(), cells).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Array2<f64>, D::Error> {
        let (rows, cols, cells): (usize, usize, Vec<PortableF64>) =
            Deserialize::deserialize(deserializer)?;
        let mut values = Vec::with_capacity(cells.len());
        for cell in cells {
            values.push(cell.decode()?);
        }
        Array2::from_shape_vec((rows, cols), values).map_err(D::Error::custom)
    }
}

/// serde adapter for a list of such grids (per-row edge matrices).
pub(crate) mod portable_grids {
    use ndarray::Array2;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Grid(#[serde(with = "super::portable_grid")] Array2<f64>);

    pub fn serialize<S: Serializer>(
        grids: &[Array2<f64>],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let wrapped: Vec<Grid> = grids.iter().cloned().map(Grid).collect();
        wrapped.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Array2<f64>>, D::Error> {
        let wrapped: Vec<Grid> = Deserialize::deserialize(deserializer)?;
        Ok(wrapped.into_iter().map(|g| g.0).collect())
    }
}

fn validate_finite(matrix: &Array2<f64>, name: &'static str) -> Result<(), DataError> {
    for ((row, col), &v) in matrix.indexed_iter() {
        if !v.is_finite() {
            return Err(DataError::NonFiniteValue {
                matrix: name,
                row,
                col,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn rejects_row_count_mismatch() {
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        let y = array![[1.0]];
        let err = Dataset::new(x, Some(y), None).unwrap_err();
        assert!(matches!(
            err,
            DataError::RowCountMismatch {
                x_rows: 2,
                y_rows: 1
            }
        ));
    }

    #[test]
    fn rejects_non_finite_values() {
        let x = array![[1.0, f64::NAN], [3.0, 4.0]];
        let err = Dataset::new(x, None, None).unwrap_err();
        assert!(matches!(
            err,
            DataError::NonFiniteValue {
                matrix: "X",
                row: 0,
                col: 1
            }
        ));
    }

    #[test]
    fn rejects_gappy_block_labels() {
        let x = array![[1.0, 2.0, 3.0]];
        let err = Dataset::new(x, None, Some(vec![0, 2, 2])).unwrap_err();
        assert!(matches!(err, DataError::BadBlockLabel { found: 1, .. }));
    }

    #[test]
    fn counts_blocks() {
        let x = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let data = Dataset::new(x, None, Some(vec![0, 0, 1])).unwrap();
        assert_eq!(data.n_blocks(), 2);
        assert_eq!(data.n_obs(), 2);
        assert_eq!(data.n_vars(), 3);
    }

    #[test]
    fn binomial_strata_follow_class_labels() {
        let y = array![[0.0], [1.0], [1.0], [0.0]];
        let strata = default_strata(Family::Binomial, Some(&y)).unwrap();
        assert_eq!(strata, vec![0, 1, 1, 0]);
    }

    #[test]
    fn cox_strata_follow_event_status() {
        let y = array![[5.0, 1.0], [2.0, 0.0], [9.0, 1.0]];
        let strata = default_strata(Family::Cox, Some(&y)).unwrap();
        assert_eq!(strata, vec![1, 0, 1]);
    }

    #[test]
    fn gaussian_uses_simple_random_sampling() {
        let y = array![[0.3], [0.7]];
        assert!(default_strata(Family::Gaussian, Some(&y)).is_none());
    }
}
