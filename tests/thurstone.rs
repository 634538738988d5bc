use stance_harness::sampler::{PairTally, TallyTable};
use stance_harness::thurstone::{fit, FitConfig, FitError, Gauge, TieBand};

fn tally(i: usize, j: usize, wins_a: u32, wins_b: u32, ties: u32) -> PairTally {
    PairTally {
        i,
        j,
        wins_a,
        wins_b,
        ties,
        requested: wins_a + wins_b + ties,
    }
}

fn table(n: usize, tallies: &[PairTally]) -> TallyTable {
    let mut table = TallyTable::new(n);
    for t in tallies {
        table.insert(*t).unwrap();
    }
    table
}

/// Item i beats item j in every trial whenever i < j.
fn total_order(n: usize, k: u32) -> TallyTable {
    let mut tallies = Vec::new();
    for i in 0..n {
        for j in (i + 1)..n {
            tallies.push(tally(i, j, k, 0, 0));
        }
    }
    table(n, &tallies)
}

fn mixed_table() -> TallyTable {
    table(
        5,
        &[
            tally(0, 1, 7, 2, 1),
            tally(0, 2, 8, 1, 1),
            tally(1, 2, 5, 4, 1),
            tally(1, 3, 6, 3, 1),
            tally(2, 3, 4, 4, 2),
            tally(2, 4, 7, 2, 1),
            tally(3, 4, 6, 3, 1),
            tally(0, 4, 9, 0, 1),
        ],
    )
}

#[test]
fn four_item_total_order_is_recovered() {
    let result = fit(&total_order(4, 10), &FitConfig::default()).unwrap();
    let u: Vec<f64> = result.means.iter().map(|m| m.unwrap()).collect();
    assert!(u[0] > u[1] && u[1] > u[2] && u[2] > u[3], "{u:?}");
    assert_eq!(result.ranking(), vec![0, 1, 2, 3]);
    assert!(result.diagnostics.converged);
    assert!(result.diagnostics.grad_norm < 1e-6);
    assert!(u.iter().all(|v| v.is_finite()));
}

#[test]
fn unanimous_pair_yields_positive_margin() {
    let result = fit(&table(2, &[tally(0, 1, 20, 0, 0)]), &FitConfig::default()).unwrap();
    let margin = result.mean(0).unwrap() - result.mean(1).unwrap();
    assert!(margin > 0.5, "margin {margin}");
}

#[test]
fn all_ties_give_equal_utilities() {
    let ties = table(
        3,
        &[tally(0, 1, 0, 0, 10), tally(0, 2, 0, 0, 10), tally(1, 2, 0, 0, 10)],
    );
    let result = fit(&ties, &FitConfig::default()).unwrap();
    for m in &result.means {
        assert!(m.unwrap().abs() < 1e-6);
    }
}

#[test]
fn repeated_fits_are_identical() {
    let data = mixed_table();
    let a = fit(&data, &FitConfig::default()).unwrap();
    let b = fit(&data, &FitConfig::default()).unwrap();
    for (x, y) in a.means.iter().zip(&b.means) {
        assert!((x.unwrap() - y.unwrap()).abs() < 1e-12);
    }
    assert_eq!(a.diagnostics.iterations, b.diagnostics.iterations);
}

#[test]
fn zero_mean_gauge_centres_included_items() {
    let result = fit(&mixed_table(), &FitConfig::default()).unwrap();
    let sum: f64 = result.means.iter().map(|m| m.unwrap()).sum();
    assert!(sum.abs() < 1e-9);
    assert_eq!(result.gauge, Gauge::ZeroMean);
}

#[test]
fn moving_the_pin_shifts_all_utilities_by_a_constant() {
    let data = mixed_table();
    let centred = fit(&data, &FitConfig::default()).unwrap();
    let pinned = fit(
        &data,
        &FitConfig {
            gauge: Gauge::Pin { item: 2, value: 0.0 },
            ..FitConfig::default()
        },
    )
    .unwrap();

    assert!(pinned.mean(2).unwrap().abs() < 1e-12);
    assert_eq!(pinned.std(2), Some(0.0));
    let shift = pinned.mean(0).unwrap() - centred.mean(0).unwrap();
    for i in 0..5 {
        let d = pinned.mean(i).unwrap() - centred.mean(i).unwrap();
        assert!((d - shift).abs() < 1e-6, "item {i}: {d} vs {shift}");
    }
}

#[test]
fn sparse_items_get_larger_uncertainty() {
    // Item 3 appears in one pair with 2 trials; item 0 in many.
    let data = table(
        4,
        &[
            tally(0, 1, 12, 8, 0),
            tally(0, 2, 11, 9, 0),
            tally(1, 2, 10, 10, 0),
            tally(2, 3, 1, 1, 0),
        ],
    );
    let result = fit(&data, &FitConfig::default()).unwrap();
    assert!(result.std(3).unwrap() > result.std(0).unwrap());
    assert!(result.stds.iter().all(|s| s.unwrap() >= 0.0));
}

#[test]
fn item_without_valid_trials_is_excluded_not_fatal() {
    // Item 3 was sampled but every trial was dropped; item 4 never appears.
    let mut dropped = PairTally::new(2, 3, 10);
    dropped.requested = 10;
    let data = table(
        5,
        &[
            tally(0, 1, 8, 2, 0),
            tally(0, 2, 9, 1, 0),
            tally(1, 2, 7, 3, 0),
            dropped,
        ],
    );
    let result = fit(&data, &FitConfig::default()).unwrap();
    assert_eq!(result.means[3], None);
    assert_eq!(result.means[4], None);
    let excluded: Vec<usize> = result.excluded.iter().map(|e| e.index).collect();
    assert_eq!(excluded, vec![3, 4]);
    assert!(result.means[..3].iter().all(|m| m.is_some()));
    assert!(result.mean(0).unwrap() > result.mean(2).unwrap());
}

#[test]
fn no_valid_trials_is_insufficient_data() {
    let data = table(3, &[PairTally::new(0, 1, 5)]);
    let Err(FitError::InsufficientData(shortfall)) = fit(&data, &FitConfig::default()) else {
        panic!("expected insufficient data");
    };
    assert_eq!(shortfall.items, vec![0, 1, 2]);
    assert_eq!(shortfall.empty_pairs, vec![(0, 1)]);
    let message = FitError::InsufficientData(shortfall).to_string();
    assert!(message.contains("[0, 1, 2]"), "{message}");
    assert!(message.contains("(0, 1)"), "{message}");
}

#[test]
fn pinned_item_without_data_names_the_gap() {
    let data = table(4, &[tally(0, 1, 6, 3, 1), tally(1, 2, 5, 4, 1)]);
    let cfg = FitConfig {
        gauge: Gauge::Pin { item: 3, value: 0.0 },
        ..FitConfig::default()
    };
    let Err(FitError::InsufficientData(shortfall)) = fit(&data, &cfg) else {
        panic!("expected insufficient data");
    };
    assert!(shortfall.reason.contains("pinned item 3"));
    assert_eq!(shortfall.items, vec![3]);
    assert!(shortfall.empty_pairs.is_empty());
}

#[test]
fn iteration_cap_reports_non_convergence_with_best_so_far() {
    let cfg = FitConfig {
        max_iters: 1,
        ..FitConfig::default()
    };
    let err = fit(&total_order(6, 10), &cfg).unwrap_err();
    let partial = err.partial_fit().expect("best-so-far fit");
    assert!(!partial.diagnostics.converged);
    assert_eq!(partial.diagnostics.iterations, 1);
    assert!(partial.diagnostics.grad_norm >= cfg.grad_tol);
    assert!(partial.means.iter().all(|m| m.is_some()));
}

#[test]
fn fitted_tie_band_grows_with_tie_share() {
    let few = table(3, &[tally(0, 1, 6, 3, 1), tally(1, 2, 6, 3, 1), tally(0, 2, 7, 2, 1)]);
    let many = table(3, &[tally(0, 1, 2, 1, 7), tally(1, 2, 2, 1, 7), tally(0, 2, 3, 1, 6)]);
    let cfg = FitConfig {
        tie_band: TieBand::Fitted { initial: 0.1 },
        ..FitConfig::default()
    };
    let few = fit(&few, &cfg).unwrap();
    let many = fit(&many, &cfg).unwrap();
    assert!(many.tie_band > few.tie_band);
    assert!(few.tie_band > 0.0);
}

#[test]
fn invalid_config_is_rejected() {
    let cfg = FitConfig {
        sigma: 0.0,
        ..FitConfig::default()
    };
    assert!(matches!(
        fit(&mixed_table(), &cfg),
        Err(FitError::InvalidConfig(_))
    ));
    let cfg = FitConfig {
        gauge: Gauge::Pin { item: 9, value: 0.0 },
        ..FitConfig::default()
    };
    assert!(matches!(
        fit(&mixed_table(), &cfg),
        Err(FitError::InvalidConfig(_))
    ));
}
