//! # Calibrated Model Container
//!
//! The immutable result of a stability-selection run: the grid and template
//! that were searched, the aggregated proportions, the score surface, the
//! calibration outcome, and the metadata needed to reproduce or audit the
//! run. Downstream consumers (recalibration, summaries) read from here; the
//! only "mutation" is an explicit re-query at caller-supplied indices.

use crate::aggregate::Proportions;
use crate::calibrate::CalibrationOutcome;
use crate::data::Family;
use crate::estimator::SelectionPattern;
use crate::grid::{LambdaGrid, SequentialTemplate};
use crate::resample::ResamplingScheme;
use crate::score::{PferMethod, ScoreSurface};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("grid row {row} is out of range for a {n_rows}-row grid")]
    RowOutOfRange { row: usize, n_rows: usize },

    #[error("threshold index {index} is out of range for {n_thresholds} thresholds")]
    ThresholdOutOfRange { index: usize, n_thresholds: usize },

    #[error("grid row {row} has no valid resamples; its proportions are undefined")]
    UndefinedRow { row: usize },
}

/// Reproducibility and audit metadata for one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunMetadata {
    pub family: Family,
    pub k: usize,
    pub scheme: ResamplingScheme,
    pub seed: u64,
    /// May be `+∞` (no ceiling); persisted through sentinel encoding.
    #[serde(with = "crate::data::portable_float")]
    pub pfer_max: f64,
    pub pfer_method: PferMethod,
    /// Columns the degenerate-variance guard perturbed in at least one
    /// resample. Such columns were never allowed into a selection.
    pub perturbed_columns: Vec<usize>,
}

/// The calibrated model. Immutable once built.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StabilityModel {
    grid: LambdaGrid,
    template: SequentialTemplate,
    thresholds: Vec<f64>,
    proportions: Proportions,
    surface: ScoreSurface,
    outcome: CalibrationOutcome,
    metadata: RunMetadata,
}

impl StabilityModel {
    pub(crate) fn new(
        grid: LambdaGrid,
        template: SequentialTemplate,
        thresholds: Vec<f64>,
        proportions: Proportions,
        surface: ScoreSurface,
        outcome: CalibrationOutcome,
        metadata: RunMetadata,
    ) -> Self {
        Self {
            grid,
            template,
            thresholds,
            proportions,
            surface,
            outcome,
            metadata,
        }
    }

    pub fn grid(&self) -> &LambdaGrid {
        &self.grid
    }

    pub fn template(&self) -> &SequentialTemplate {
        &self.template
    }

    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }

    pub fn proportions(&self) -> &Proportions {
        &self.proportions
    }

    pub fn surface(&self) -> &ScoreSurface {
        &self.surface
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// The calibrated `(grid row, threshold index)` point, or `None` when
    /// calibration was infeasible under the PFER ceiling.
    pub fn optimum(&self) -> Option<(usize, usize)> {
        match self.outcome {
            CalibrationOutcome::Optimum { row, threshold } => Some((row, threshold)),
            CalibrationOutcome::Infeasible => None,
        }
    }

    pub fn outcome(&self) -> CalibrationOutcome {
        self.outcome
    }

    /// Binarised selection (or adjacency) at an arbitrary caller-specified
    /// point — the manual-override accessor.
    pub fn selection_at(
        &self,
        row: usize,
        threshold_index: usize,
    ) -> Result<SelectionPattern, ModelError> {
        if row >= self.grid.n_rows() {
            return Err(ModelError::RowOutOfRange {
                row,
                n_rows: self.grid.n_rows(),
            });
        }
        if threshold_index >= self.thresholds.len() {
            return Err(ModelError::ThresholdOutOfRange {
                index: threshold_index,
                n_thresholds: self.thresholds.len(),
            });
        }
        if !self.proportions.row_defined(row) {
            return Err(ModelError::UndefinedRow { row });
        }
        Ok(self.proportions.binarise(row, self.thresholds[threshold_index]))
    }

    /// Binarised selection at the calibrated optimum; `None` when
    /// infeasible.
    pub fn calibrated_selection(&self) -> Option<SelectionPattern> {
        let (row, threshold) = self.optimum()?;
        self.selection_at(row, threshold).ok()
    }

    /// Selection proportions at an arbitrary grid row, flat candidate order.
    pub fn proportions_at(&self, row: usize) -> Result<ndarray::Array1<f64>, ModelError> {
        if row >= self.grid.n_rows() {
            return Err(ModelError::RowOutOfRange {
                row,
                n_rows: self.grid.n_rows(),
            });
        }
        if !self.proportions.row_defined(row) {
            return Err(ModelError::UndefinedRow { row });
        }
        Ok(self.proportions.row(row))
    }

    /// Selection proportions at the calibrated optimum's grid row.
    pub fn calibrated_proportions(&self) -> Option<ndarray::Array1<f64>> {
        let (row, _) = self.optimum()?;
        Some(self.proportions.row(row))
    }
}
