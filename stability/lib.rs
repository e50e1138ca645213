#![deny(unused_imports)]

//! Stability selection engine.
//!
//! The crate repeatedly re-estimates a pluggable sparse model on seeded
//! resamples of a dataset across a penalty grid, aggregates the per-resample
//! selections into selection proportions, and calibrates the penalty and the
//! selection-frequency threshold by maximising a stability score under a
//! per-family error-rate (PFER) ceiling.
//!
//! The estimation mathematics itself lives behind the [`estimator::Estimator`]
//! trait; this crate owns resampling, grid and block-template construction,
//! the per-resample execution loop with warm-start bookkeeping, aggregation,
//! and calibration.

pub mod aggregate;
pub mod calibrate;
pub mod data;
pub mod estimator;
pub mod executor;
pub mod grid;
pub mod model;
pub mod pipeline;
pub mod resample;
pub mod score;
