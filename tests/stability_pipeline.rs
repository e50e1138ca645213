//! End-to-end scenarios driving the public pipeline with synthetic
//! estimators: perfect recovery, partial estimator failure, and multi-block
//! sequential calibration.

use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use stabsel::data::{Dataset, Family};
use stabsel::estimator::{Estimator, FitInput, FitOutcome, OutputShape, SelectionPattern};
use stabsel::grid::GridSpec;
use stabsel::pipeline::{StabilityConfig, stability_selection};
use stabsel::resample::ResamplingScheme;
use std::sync::atomic::{AtomicUsize, Ordering};

fn gaussian_dataset(n: usize, p: usize, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let x = Array2::from_shape_fn((n, p), |_| noise.sample(&mut rng));
    let y = Array2::from_shape_fn((n, 1), |_| noise.sample(&mut rng));
    Dataset::new(x, Some(y), None).unwrap()
}

/// Always selects the first `n_selected` features.
struct LeadingSelector {
    p: usize,
    n_selected: usize,
}

impl Estimator for LeadingSelector {
    fn output(&self) -> OutputShape {
        OutputShape::Features(self.p)
    }

    fn fit(&self, _input: FitInput<'_>) -> FitOutcome {
        let mut selected = Array1::from_elem(self.p, false);
        for j in 0..self.n_selected {
            selected[j] = true;
        }
        FitOutcome {
            selected: SelectionPattern::Features(selected),
            coefficients: None,
            state: None,
        }
    }
}

/// 100 observations, 50 features, K = 100 at τ = 0.5, an estimator that
/// always selects the first 5 features. Calibrated proportions must be 1
/// for those features, 0 elsewhere, and the calibrated point must recover
/// them exactly.
#[test]
fn perfect_recovery_of_a_planted_selection() {
    let _ = env_logger::builder().is_test(true).try_init();
    let data = gaussian_dataset(100, 50, 11);
    let estimator = LeadingSelector { p: 50, n_selected: 5 };
    let config = StabilityConfig {
        k: 100,
        scheme: ResamplingScheme::Subsampling { tau: 0.5 },
        grid: GridSpec {
            n_points: 5,
            ..GridSpec::default()
        },
        ..StabilityConfig::default()
    };
    let model = stability_selection(&data, Family::Gaussian, &estimator, &config).unwrap();

    let proportions = model.calibrated_proportions().unwrap();
    for j in 0..5 {
        assert_abs_diff_eq!(proportions[j], 1.0, epsilon = 1e-12);
    }
    for j in 5..50 {
        assert_abs_diff_eq!(proportions[j], 0.0, epsilon = 1e-12);
    }

    match model.calibrated_selection().unwrap() {
        SelectionPattern::Features(selected) => {
            for j in 0..50 {
                assert_eq!(selected[j], j < 5, "feature {j}");
            }
        }
        other => panic!("unexpected pattern {other:?}"),
    }
}

/// Fails its first three fits, then always selects feature 0.
struct FlakyEstimator {
    p: usize,
    calls: AtomicUsize,
}

impl Estimator for FlakyEstimator {
    fn output(&self) -> OutputShape {
        OutputShape::Features(self.p)
    }

    fn fit(&self, _input: FitInput<'_>) -> FitOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < 3 {
            return FitOutcome {
                selected: SelectionPattern::Invalid,
                coefficients: None,
                state: None,
            };
        }
        let mut selected = Array1::from_elem(self.p, false);
        selected[0] = true;
        FitOutcome {
            selected: SelectionPattern::Features(selected),
            coefficients: None,
            state: None,
        }
    }
}

/// K = 10, one grid row, an estimator that is invalid on exactly 3 of the
/// 10 resamples. The denominator must be 7, not 10.
#[test]
fn invalid_fits_shrink_the_denominator() {
    let data = gaussian_dataset(60, 8, 23);
    let estimator = FlakyEstimator {
        p: 8,
        calls: AtomicUsize::new(0),
    };
    let config = StabilityConfig {
        k: 10,
        scheme: ResamplingScheme::Subsampling { tau: 0.5 },
        grid: GridSpec {
            n_points: 1,
            ..GridSpec::default()
        },
        ..StabilityConfig::default()
    };
    let model = stability_selection(&data, Family::Gaussian, &estimator, &config).unwrap();

    let proportions = model.proportions();
    assert_eq!(proportions.valid[0], 7);
    let row = proportions.row(0);
    assert_abs_diff_eq!(row[0], 1.0, epsilon = 1e-12);
    for j in 1..8 {
        assert_abs_diff_eq!(row[j], 0.0, epsilon = 1e-12);
    }
}

/// Selects one fixed cross-block edge whenever its block is active.
struct EdgeSelector {
    p: usize,
}

impl Estimator for EdgeSelector {
    fn output(&self) -> OutputShape {
        OutputShape::Edges(self.p)
    }

    fn fit(&self, input: FitInput<'_>) -> FitOutcome {
        let mut adjacency = Array2::from_elem((self.p, self.p), false);
        if input.active[0] {
            adjacency[[0, 1]] = true;
            adjacency[[1, 0]] = true;
        } else {
            adjacency[[2, 3]] = true;
            adjacency[[3, 2]] = true;
        }
        FitOutcome {
            selected: SelectionPattern::Edges(adjacency),
            coefficients: None,
            state: None,
        }
    }
}

/// Two blocks under the default sequential template. The grid must
/// enumerate rows-per-block × blocks rows with exactly one active block
/// each, and the calibrated adjacency must stay symmetric.
#[test]
fn two_block_sequential_enumeration() {
    let mut rng = StdRng::seed_from_u64(5);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let x = Array2::from_shape_fn((40, 4), |_| noise.sample(&mut rng));
    let data = Dataset::new(x, None, Some(vec![0, 0, 1, 1])).unwrap();

    let estimator = EdgeSelector { p: 4 };
    let config = StabilityConfig {
        k: 20,
        scheme: ResamplingScheme::Subsampling { tau: 0.5 },
        grid: GridSpec {
            n_points: 3,
            ..GridSpec::default()
        },
        ..StabilityConfig::default()
    };
    let model = stability_selection(&data, Family::Graphical, &estimator, &config).unwrap();

    // rows-per-block × number-of-blocks rows, one active block per row.
    let template = model.template();
    assert_eq!(model.grid().n_rows(), 6);
    for r in 0..6 {
        assert_eq!(template.row(r).iter().filter(|&&a| a).count(), 1);
    }

    let (row, _) = model.optimum().unwrap();
    match model.calibrated_selection().unwrap() {
        SelectionPattern::Edges(adjacency) => {
            for i in 0..4 {
                assert!(!adjacency[[i, i]]);
                for j in 0..4 {
                    assert_eq!(adjacency[[i, j]], adjacency[[j, i]]);
                }
            }
            // The calibrated row selects exactly the edge its block owns.
            let expected = if template.row(row)[0] { (0, 1) } else { (2, 3) };
            assert!(adjacency[[expected.0, expected.1]]);
        }
        other => panic!("unexpected pattern {other:?}"),
    }
}

/// Complementary pairs end to end: the plan expands K/2 pairs into K
/// half-draws and the Shah–Samworth bound applies.
#[test]
fn complementary_pairs_run_end_to_end() {
    let data = gaussian_dataset(50, 10, 31);
    let estimator = LeadingSelector {
        p: 10,
        n_selected: 2,
    };
    let config = StabilityConfig {
        k: 20,
        scheme: ResamplingScheme::ComplementaryPairs,
        pfer_method: stabsel::score::PferMethod::ShahSamworth,
        pfer_max: 5.0,
        grid: GridSpec {
            n_points: 2,
            ..GridSpec::default()
        },
        ..StabilityConfig::default()
    };
    let model = stability_selection(&data, Family::Gaussian, &estimator, &config).unwrap();
    assert_eq!(model.metadata().k, 20);
    let proportions = model.calibrated_proportions().unwrap();
    assert_abs_diff_eq!(proportions[0], 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(proportions[9], 0.0, epsilon = 1e-12);
}

/// Binomial outcomes stratify by class: with 30/20 classes at τ = 0.5 every
/// resample holds 15 + 10 observations.
#[test]
fn binomial_resampling_is_class_balanced() {
    let mut rng = StdRng::seed_from_u64(77);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let x = Array2::from_shape_fn((50, 6), |_| noise.sample(&mut rng));
    let y = Array2::from_shape_fn((50, 1), |(i, _)| f64::from(u8::from(i >= 30)));
    let data = Dataset::new(x, Some(y), None).unwrap();

    /// Checks every subsample it sees for the expected class balance.
    struct BalanceProbe;
    impl Estimator for BalanceProbe {
        fn output(&self) -> OutputShape {
            OutputShape::Features(6)
        }
        fn fit(&self, input: FitInput<'_>) -> FitOutcome {
            assert_eq!(input.x.nrows(), 25);
            let y = input.y.unwrap();
            let positives = y.column(0).iter().filter(|&&v| v > 0.5).count();
            assert_eq!(positives, 10);
            FitOutcome {
                selected: SelectionPattern::Features(Array1::from_elem(6, false)),
                coefficients: None,
                state: None,
            }
        }
    }

    let config = StabilityConfig {
        k: 8,
        grid: GridSpec {
            n_points: 2,
            ..GridSpec::default()
        },
        ..StabilityConfig::default()
    };
    stability_selection(&data, Family::Binomial, &BalanceProbe, &config).unwrap();
}
