//! Offline recovery evaluation for the sampler and fitter.
//!
//! Runs synthetic cases through the real `Sampler` and `thurstone::fit`,
//! with a `SimulatedJudge` standing in for the model, and scores how well the
//! fitted utilities recover the planted ones.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use statrs::distribution::Normal;

use crate::catalog::{CatalogError, Item, ItemCatalog};
use crate::gateway::Provider;
use crate::sampler::{
    ActivePlanConfig, PairPlan, SampleError, SampleStats, Sampler, SamplerConfig, SimulatedJudge,
};
use crate::subject::{JudgeSettings, Subject};
use crate::thurstone::{self, FitConfig, FitError, TieBand};

// =============================================================================
// Synthetic case definitions
// =============================================================================

#[derive(Debug, Clone)]
pub struct SyntheticCase {
    pub name: &'static str,
    pub utilities: Vec<f64>,
    pub trials_per_pair: u32,
    pub plan: PairPlan,
    /// Judge noise; 0 answers deterministically.
    pub noise_sigma: f64,
    pub judge_tie_band: f64,
    pub fit_tie_band: TieBand,
    pub unparseable_rate: f64,
    pub transient_error_rate: f64,
    /// Items whose trials always come back unparseable.
    pub silent_items: Vec<usize>,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationMetrics {
    /// Rank agreement over items the fit kept.
    pub kendall_tau: f64,
    pub spearman_rho: f64,
    /// Largest error after centring both vectors on the kept items.
    pub max_abs_error: f64,
    pub converged: bool,
    pub iterations: usize,
    pub excluded_items: usize,
    pub fitted_tie_band: f64,
    pub stats: SampleStats,
    pub latency_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    pub case_name: String,
    pub metrics: EvaluationMetrics,
}

#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("sampling error: {0}")]
    Sample(#[from] SampleError),
    #[error("fit error: {0}")]
    Fit(#[from] FitError),
}

// =============================================================================
// Public API
// =============================================================================

pub fn synthetic_cases() -> Vec<SyntheticCase> {
    let base = SyntheticCase {
        name: "",
        utilities: Vec::new(),
        trials_per_pair: 10,
        plan: PairPlan::Exhaustive,
        noise_sigma: 1.0,
        judge_tie_band: 0.0,
        fit_tie_band: TieBand::default(),
        unparseable_rate: 0.0,
        transient_error_rate: 0.0,
        silent_items: Vec::new(),
        seed: 7,
    };

    vec![
        SyntheticCase {
            name: "total_order_4",
            utilities: vec![3.0, 2.0, 1.0, 0.0],
            noise_sigma: 0.0,
            ..base.clone()
        },
        SyntheticCase {
            name: "noisy_12",
            utilities: seeded_normal_utilities(12, 1.5, 11),
            judge_tie_band: 0.1,
            unparseable_rate: 0.05,
            transient_error_rate: 0.05,
            seed: 11,
            ..base.clone()
        },
        SyntheticCase {
            name: "ties_heavy_8",
            utilities: (0..8).map(|i| i as f64 * 0.4).collect(),
            judge_tie_band: 0.6,
            fit_tie_band: TieBand::Fitted { initial: 0.1 },
            trials_per_pair: 16,
            seed: 23,
            ..base.clone()
        },
        SyntheticCase {
            name: "sparse_active_30",
            utilities: seeded_normal_utilities(30, 2.0, 31),
            trials_per_pair: 6,
            plan: PairPlan::Active(ActivePlanConfig {
                degree: 4,
                edge_multiplier: 2.0,
                pairs_per_round: 60,
                seed: 31,
                ..ActivePlanConfig::default()
            }),
            judge_tie_band: 0.1,
            seed: 31,
            ..base.clone()
        },
        SyntheticCase {
            name: "unparseable_item_6",
            utilities: vec![2.5, 1.5, 0.5, -0.5, -1.5, 9.0],
            silent_items: vec![5],
            seed: 5,
            ..base
        },
    ]
}

pub async fn run_synthetic_suite(filter: Option<&str>) -> Result<Vec<EvaluationResult>, EvaluationError> {
    let mut results = Vec::new();
    for case in synthetic_cases() {
        if let Some(name) = filter {
            if case.name != name {
                continue;
            }
        }
        results.push(run_synthetic_case(&case).await?);
    }
    Ok(results)
}

pub async fn run_synthetic_case(case: &SyntheticCase) -> Result<EvaluationResult, EvaluationError> {
    let start = Instant::now();

    let items: Vec<Item> = (0..case.utilities.len())
        .map(|i| Item::new("synthetic", format!("{} statement {i}", case.name)))
        .collect();
    let catalog = ItemCatalog::new(items)?;
    let truth: HashMap<String, f64> = catalog
        .items()
        .iter()
        .zip(&case.utilities)
        .map(|(item, u)| (item.id.clone(), *u))
        .collect();

    let mut judge = SimulatedJudge::new(truth)
        .with_sigma(case.noise_sigma)
        .with_tie_band(case.judge_tie_band)
        .with_unparseable_rate(case.unparseable_rate)
        .with_transient_error_rate(case.transient_error_rate)
        .with_seed(case.seed);
    for &idx in &case.silent_items {
        if let Some(item) = catalog.get(idx) {
            judge = judge.with_unparseable_item(item.id.clone());
        }
    }

    let subject = Subject::model(JudgeSettings::new(Provider::OpenRouter, "simulated"));
    let sampler = Sampler::new(SamplerConfig {
        trials_per_pair: case.trials_per_pair,
        concurrency: 16,
        retry_base_delay: Duration::from_millis(1),
        plan: case.plan,
        ..SamplerConfig::default()
    });
    let fit_cfg = FitConfig {
        tie_band: case.fit_tie_band,
        ..FitConfig::default()
    };

    let outcome = sampler
        .sample(&judge, &subject, &catalog, &fit_cfg, None)
        .await?;
    let fit = match thurstone::fit(&outcome.tallies, &fit_cfg) {
        Ok(fit) => fit,
        Err(FitError::NonConvergence(partial)) => *partial,
        Err(err) => return Err(err.into()),
    };

    let kept: Vec<usize> = (0..catalog.len()).filter(|&i| fit.means[i].is_some()).collect();
    let est: Vec<f64> = kept.iter().filter_map(|&i| fit.means[i]).collect();
    let tru: Vec<f64> = kept.iter().map(|&i| case.utilities[i]).collect();

    let metrics = EvaluationMetrics {
        kendall_tau: kendall_tau_b(&tru, &est),
        spearman_rho: spearman_rho(&tru, &est),
        max_abs_error: max_abs_centred_error(&tru, &est),
        converged: fit.diagnostics.converged,
        iterations: fit.diagnostics.iterations,
        excluded_items: fit.excluded.len(),
        fitted_tie_band: fit.tie_band,
        stats: outcome.stats,
        latency_ms: start.elapsed().as_millis(),
    };

    Ok(EvaluationResult {
        case_name: case.name.to_string(),
        metrics,
    })
}

// =============================================================================
// Helpers
// =============================================================================

fn seeded_normal_utilities(n: usize, scale: f64, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = match Normal::new(0.0, scale) {
        Ok(normal) => normal,
        Err(_) => return vec![0.0; n],
    };
    (0..n).map(|_| rng.sample(normal)).collect()
}

fn max_abs_centred_error(truth: &[f64], est: &[f64]) -> f64 {
    if truth.is_empty() || truth.len() != est.len() {
        return f64::NAN;
    }
    let mt = truth.iter().sum::<f64>() / truth.len() as f64;
    let me = est.iter().sum::<f64>() / est.len() as f64;
    truth
        .iter()
        .zip(est)
        .map(|(t, e)| ((t - mt) - (e - me)).abs())
        .fold(0.0, f64::max)
}

fn kendall_tau_b(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len();
    if n != y.len() || n < 2 {
        return 0.0;
    }

    let mut concordant = 0f64;
    let mut discordant = 0f64;
    let mut ties_x = 0f64;
    let mut ties_y = 0f64;

    for i in 0..n {
        for j in (i + 1)..n {
            let dx = x[i] - x[j];
            let dy = y[i] - y[j];

            if dx == 0.0 && dy == 0.0 {
                continue;
            } else if dx == 0.0 {
                ties_x += 1.0;
            } else if dy == 0.0 {
                ties_y += 1.0;
            } else if (dx > 0.0) == (dy > 0.0) {
                concordant += 1.0;
            } else {
                discordant += 1.0;
            }
        }
    }

    let denom = ((concordant + discordant + ties_x) * (concordant + discordant + ties_y)).sqrt();
    if denom == 0.0 {
        0.0
    } else {
        (concordant - discordant) / denom
    }
}

fn spearman_rho(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len();
    if n != y.len() || n < 2 {
        return 0.0;
    }
    let rx = ranks_with_ties(x);
    let ry = ranks_with_ties(y);

    let mean_x = rx.iter().sum::<f64>() / n as f64;
    let mean_y = ry.iter().sum::<f64>() / n as f64;

    let mut num = 0.0;
    let mut den_x = 0.0;
    let mut den_y = 0.0;
    for (a, b) in rx.iter().zip(&ry) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        num += dx * dy;
        den_x += dx * dx;
        den_y += dy * dy;
    }

    if den_x == 0.0 || den_y == 0.0 {
        0.0
    } else {
        num / (den_x.sqrt() * den_y.sqrt())
    }
}

fn ranks_with_ties(scores: &[f64]) -> Vec<f64> {
    let n = scores.len();
    let mut indices: Vec<usize> = (0..n).collect();
    indices.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; n];
    let mut i = 0usize;
    while i < n {
        let score = scores[indices[i]];
        let mut j = i + 1;
        while j < n && scores[indices[j]] == score {
            j += 1;
        }
        let avg_rank = (i + j - 1) as f64 / 2.0;
        for &idx in &indices[i..j] {
            ranks[idx] = avg_rank;
        }
        i = j;
    }
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_metrics_on_known_vectors() {
        let x = [1.0, 2.0, 3.0, 4.0];
        assert!((kendall_tau_b(&x, &x) - 1.0).abs() < 1e-12);
        assert!((spearman_rho(&x, &[4.0, 3.0, 2.0, 1.0]) + 1.0).abs() < 1e-12);
        assert_eq!(ranks_with_ties(&[1.0, 1.0, 2.0]), vec![0.5, 0.5, 2.0]);
    }

    #[test]
    fn centred_error_ignores_offset() {
        assert!(max_abs_centred_error(&[1.0, 2.0], &[11.0, 12.0]) < 1e-12);
    }

    #[test]
    fn case_names_are_unique() {
        let cases = synthetic_cases();
        let mut names: Vec<_> = cases.iter().map(|c| c.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), cases.len());
    }
}
