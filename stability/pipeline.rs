//! # Pipeline Orchestration
//!
//! The top-level driver: validates the configuration, builds the grid and
//! the resampling plan, fans the resample-fit tasks out over a rayon worker
//! pool, merges the worker-private partial aggregates in a single
//! associative reduction, and hands the proportions to the calibrator.
//!
//! No shared mutable state crosses task boundaries: every task reads the
//! dataset and grid by reference and returns its own partial aggregate, so
//! the aggregated proportions are identical regardless of worker scheduling.
//! Reproducibility rests entirely on the seeded resampling plan.

use crate::aggregate::Aggregate;
use crate::calibrate::{CalibrationError, Calibrator};
use crate::data::{Dataset, Family, default_strata};
use crate::estimator::{Estimator, EstimatorKind, EstimatorRegistry};
use crate::executor::{ExecError, GuardSettings, run_resample};
use crate::grid::{self, GridError, GridSpec};
use crate::model::{RunMetadata, StabilityModel};
use crate::resample::{
    BalancingRule, ResampleError, ResamplingPlan, ResamplingScheme, SimpleRandom, Stratified,
};
use crate::score::{ConsensusScore, PferMethod, ScoreStrategy};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StabilityError {
    #[error(transparent)]
    Resample(#[from] ResampleError),

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error("PFER ceiling must be positive, got {pfer_max}")]
    BadPferCeiling { pfer_max: f64 },

    #[error("guard noise scale must be positive, got {noise_scale}")]
    BadNoiseScale { noise_scale: f64 },

    #[error("no estimator is registered for kind {kind:?}")]
    UnregisteredEstimator { kind: EstimatorKind },

    #[error("estimator output covers {estimator_vars} variables but the dataset has {data_vars}")]
    EstimatorShapeMismatch {
        estimator_vars: usize,
        data_vars: usize,
    },
}

/// Full run configuration, handed to every stage of the pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StabilityConfig {
    /// Number of resamples K.
    pub k: usize,
    pub scheme: ResamplingScheme,
    pub seed: u64,
    /// Ceiling on the expected number of false positives; grid points whose
    /// bound exceeds it are masked out of the arg-max. Defaults to `+∞`
    /// (no ceiling), persisted through sentinel encoding.
    #[serde(with = "crate::data::portable_float")]
    pub pfer_max: f64,
    pub pfer_method: PferMethod,
    pub grid: GridSpec,
    /// Selection-frequency thresholds π; defaults to {0.60, ..., 0.90}.
    pub thresholds: Option<Vec<f64>>,
    pub guard: GuardSettings,
    /// Explicit `(grid row, threshold index)` optimum, bypassing scoring.
    pub override_point: Option<(usize, usize)>,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            k: 100,
            scheme: ResamplingScheme::Subsampling { tau: 0.5 },
            seed: 1,
            pfer_max: f64::INFINITY,
            pfer_method: PferMethod::MeinshausenBuhlmann,
            grid: GridSpec::default(),
            thresholds: None,
            guard: GuardSettings::default(),
            override_point: None,
        }
    }
}

/// Runs stability selection with the family's default balancing rule and
/// the consensus stability score.
pub fn stability_selection(
    data: &Dataset,
    family: Family,
    estimator: &dyn Estimator,
    config: &StabilityConfig,
) -> Result<StabilityModel, StabilityError> {
    match default_strata(family, data.y()) {
        Some(strata) => stability_selection_with(
            data,
            family,
            estimator,
            &Stratified::new(strata),
            &ConsensusScore,
            config,
        ),
        None => stability_selection_with(
            data,
            family,
            estimator,
            &SimpleRandom,
            &ConsensusScore,
            config,
        ),
    }
}

/// Runs stability selection with an estimator resolved from the registry by
/// its kind tag.
pub fn stability_selection_from_registry(
    data: &Dataset,
    family: Family,
    registry: &EstimatorRegistry,
    kind: EstimatorKind,
    config: &StabilityConfig,
) -> Result<StabilityModel, StabilityError> {
    let estimator = registry
        .get(kind)
        .ok_or(StabilityError::UnregisteredEstimator { kind })?;
    stability_selection(data, family, estimator.as_ref(), config)
}

/// Runs stability selection with a caller-supplied balancing rule and score
/// strategy.
pub fn stability_selection_with(
    data: &Dataset,
    family: Family,
    estimator: &dyn Estimator,
    rule: &dyn BalancingRule,
    strategy: &dyn ScoreStrategy,
    config: &StabilityConfig,
) -> Result<StabilityModel, StabilityError> {
    // Configuration errors fail fast, before any resampling starts.
    let shape = estimator.output();
    if shape.n_vars() != data.n_vars() {
        return Err(StabilityError::EstimatorShapeMismatch {
            estimator_vars: shape.n_vars(),
            data_vars: data.n_vars(),
        });
    }
    if !(config.pfer_max > 0.0) {
        return Err(StabilityError::BadPferCeiling {
            pfer_max: config.pfer_max,
        });
    }
    if !(config.guard.noise_scale > 0.0) {
        return Err(StabilityError::BadNoiseScale {
            noise_scale: config.guard.noise_scale,
        });
    }
    let thresholds = match &config.thresholds {
        Some(t) => {
            grid::validate_thresholds(t)?;
            t.clone()
        }
        None => grid::default_threshold_grid(),
    };

    let (lambda_grid, template) = grid::build(data, family, &config.grid)?;
    let plan = ResamplingPlan::generate(config.k, data.n_obs(), config.scheme, rule, config.seed)?;
    log::info!(
        "stability selection: {} resamples, {} grid rows, {} candidates",
        plan.len(),
        lambda_grid.n_rows(),
        shape.n_candidates()
    );

    // Each task owns a private partial aggregate; a single associative
    // reduction merges them, so worker scheduling cannot affect the result.
    let n_rows = lambda_grid.n_rows();
    let aggregate = plan
        .draws
        .par_iter()
        .enumerate()
        .map(|(i, draw)| {
            let selection = run_resample(
                data,
                &draw.indices,
                &lambda_grid,
                &template,
                estimator,
                &config.guard,
                guard_seed(config.seed, i),
            )?;
            let mut partial = Aggregate::empty(shape, n_rows);
            partial.accumulate(&selection);
            Ok(partial)
        })
        .try_reduce(
            || Aggregate::empty(shape, n_rows),
            |a, b| Ok::<_, ExecError>(a.merge(b)),
        )?;

    let invalid: u32 = aggregate
        .valid_counts()
        .iter()
        .map(|&v| plan.len() as u32 - v)
        .sum();
    if invalid > 0 {
        log::warn!("{invalid} grid-row fits were invalid and excluded from their denominators");
    }

    let proportions = aggregate.proportions();
    let calibrator = Calibrator::new(
        &proportions,
        &lambda_grid,
        &thresholds,
        config.pfer_max,
        config.pfer_method,
        strategy,
    )?;
    let result = match config.override_point {
        Some((row, threshold)) => calibrator.run_with_override(row, threshold)?,
        None => calibrator.run(),
    };
    match result.outcome {
        crate::calibrate::CalibrationOutcome::Optimum { row, threshold } => log::info!(
            "calibrated optimum at grid row {row}, threshold {:.2}",
            thresholds[threshold]
        ),
        crate::calibrate::CalibrationOutcome::Infeasible => {
            log::info!("calibration infeasible under PFER ceiling {}", config.pfer_max);
        }
    }

    let metadata = RunMetadata {
        family,
        k: config.k,
        scheme: config.scheme,
        seed: config.seed,
        pfer_max: config.pfer_max,
        pfer_method: config.pfer_method,
        perturbed_columns: aggregate.perturbed_columns().to_vec(),
    };
    Ok(StabilityModel::new(
        lambda_grid,
        template,
        thresholds,
        proportions,
        result.surface,
        result.outcome,
        metadata,
    ))
}

/// Per-draw seed for the executor's perturbation noise, independent of the
/// plan's index-set streams.
fn guard_seed(seed: u64, index: usize) -> u64 {
    seed ^ (index as u64 + 1).wrapping_mul(0x517C_C1B7_2722_0A95)
}
