//! Pair selection: exhaustive enumeration or an active plan.
//!
//! The active plan seeds the comparison graph with a ring lattice, then in
//! each round adds pairs whose current utility gap is small and whose
//! endpoints are under-sampled, until the pair budget
//! `edge_multiplier * n * log2(n)` is spent.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PairPlan {
    /// Every unordered pair, `K` trials each.
    #[default]
    Exhaustive,
    Active(ActivePlanConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivePlanConfig {
    /// Degree of the seeding ring lattice (even; odd values round down).
    pub degree: usize,
    pub edge_multiplier: f64,
    pub pairs_per_round: usize,
    /// Candidates must have a utility gap at or below this percentile...
    pub gap_percentile: f64,
    /// ...and a combined endpoint degree at or below this one.
    pub degree_percentile: f64,
    pub seed: u64,
}

impl Default for ActivePlanConfig {
    fn default() -> Self {
        Self {
            degree: 2,
            edge_multiplier: 2.0,
            pairs_per_round: 200,
            gap_percentile: 10.0,
            degree_percentile: 20.0,
            seed: 42,
        }
    }
}

/// All `C(n, 2)` pairs in lexicographic order.
pub fn all_pairs(n: usize) -> Vec<(usize, usize)> {
    (0..n)
        .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
        .collect()
}

/// Edges of a ring lattice where each node links to its `degree / 2` nearest
/// neighbours on each side. Deduplicated, canonical `(min, max)` order.
pub fn ring_lattice(n: usize, degree: usize) -> Vec<(usize, usize)> {
    let mut seen = HashSet::new();
    let mut edges = Vec::new();
    if n < 2 {
        return edges;
    }
    for k in 1..=(degree / 2).max(1) {
        for i in 0..n {
            let j = (i + k) % n;
            if i == j {
                continue;
            }
            let edge = (i.min(j), i.max(j));
            if seen.insert(edge) {
                edges.push(edge);
            }
        }
    }
    edges
}

/// Pair budget for an active plan, capped at `C(n, 2)`.
pub fn target_pair_count(n: usize, edge_multiplier: f64) -> usize {
    let total = n * n.saturating_sub(1) / 2;
    if n < 2 {
        return 0;
    }
    let target = (edge_multiplier * n as f64 * (n as f64).log2()).floor();
    (target.max(0.0) as usize).min(total)
}

/// Linear-interpolation percentile (`p` in 0..=100) of unsorted values.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Choose up to `count` unsampled pairs.
///
/// Candidates whose gap and combined degree both sit at or below the
/// configured percentiles are preferred; if there are fewer than `count` of
/// them, the round falls back to a uniform draw from all unsampled pairs.
/// Items without a current estimate are treated as having zero gap.
pub fn select_informative_pairs(
    means: &[Option<f64>],
    sampled: &HashSet<(usize, usize)>,
    count: usize,
    cfg: &ActivePlanConfig,
    rng: &mut StdRng,
) -> Vec<(usize, usize)> {
    let n = means.len();
    let mut degree = vec![0usize; n];
    for &(i, j) in sampled {
        degree[i] += 1;
        degree[j] += 1;
    }

    let remaining: Vec<(usize, usize)> = all_pairs(n)
        .into_iter()
        .filter(|p| !sampled.contains(p))
        .collect();
    if remaining.is_empty() || count == 0 {
        return Vec::new();
    }

    let gaps: Vec<f64> = remaining
        .iter()
        .map(|&(i, j)| match (means[i], means[j]) {
            (Some(a), Some(b)) => (a - b).abs(),
            _ => 0.0,
        })
        .collect();
    let degrees: Vec<f64> = remaining
        .iter()
        .map(|&(i, j)| (degree[i] + degree[j]) as f64)
        .collect();
    let gap_cut = percentile(&gaps, cfg.gap_percentile);
    let degree_cut = percentile(&degrees, cfg.degree_percentile);

    let filtered: Vec<(usize, usize)> = remaining
        .iter()
        .zip(gaps.iter().zip(&degrees))
        .filter(|(_, (gap, deg))| **gap <= gap_cut && **deg <= degree_cut)
        .map(|(pair, _)| *pair)
        .collect();

    let pool = if filtered.len() >= count {
        &filtered
    } else {
        &remaining
    };
    let mut chosen: Vec<(usize, usize)> = pool.choose_multiple(rng, count).copied().collect();
    chosen.sort_unstable();
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn all_pairs_counts() {
        assert_eq!(all_pairs(5).len(), 10);
        assert_eq!(all_pairs(1), Vec::<(usize, usize)>::new());
        assert_eq!(all_pairs(3), vec![(0, 1), (0, 2), (1, 2)]);
    }

    #[test]
    fn ring_lattice_is_regular() {
        let edges = ring_lattice(6, 4);
        assert_eq!(edges.len(), 12);
        let mut degree = [0; 6];
        for (i, j) in edges {
            degree[i] += 1;
            degree[j] += 1;
        }
        assert!(degree.iter().all(|&d| d == 4));
        // Two nodes: the ring collapses to one edge.
        assert_eq!(ring_lattice(2, 2), vec![(0, 1)]);
    }

    #[test]
    fn target_is_capped_by_pair_count() {
        assert_eq!(target_pair_count(4, 10.0), 6);
        assert_eq!(target_pair_count(32, 1.0), 160);
    }

    #[test]
    fn percentile_interpolates() {
        let v = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(percentile(&v, 0.0), 1.0);
        assert_eq!(percentile(&v, 100.0), 4.0);
        assert!((percentile(&v, 50.0) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn selection_skips_sampled_pairs_and_is_seeded() {
        let means: Vec<Option<f64>> = (0..10).map(|i| Some(i as f64)).collect();
        let sampled: HashSet<(usize, usize)> = ring_lattice(10, 2).into_iter().collect();
        let cfg = ActivePlanConfig::default();
        let a = select_informative_pairs(&means, &sampled, 5, &cfg, &mut StdRng::seed_from_u64(7));
        let b = select_informative_pairs(&means, &sampled, 5, &cfg, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        assert!(a.iter().all(|p| !sampled.contains(p) && p.0 < p.1));
    }
}
