//! Thurstonian Case V utility fitting with a tie band.
//!
//! Each included item `i` carries a latent utility `u_i`. On one trial of the
//! pair `(a, b)` the judge perceives `d = u_a - u_b` plus Gaussian noise with
//! standard deviation `s = sigma * sqrt(2)`, and reports a tie when the
//! perceived difference falls inside `[-delta, delta]`:
//!
//! ```text
//! P(a)   = Phi(( d - delta) / s)
//! P(b)   = Phi((-d - delta) / s)
//! P(tie) = 1 - P(a) - P(b)
//! ```
//!
//! With `delta = 0` a tie counts as half a win for each side.
//!
//! Utilities maximise the log-likelihood plus a weak zero-mean Gaussian
//! prior `(lambda / 2) * sum (u_i - mean(u))^2`. The prior is invariant under a
//! common shift, so it only removes the directions the likelihood leaves
//! unbounded (perfectly separated items, disconnected components). Optimisation
//! runs BFGS with the first included item pinned at zero; the requested gauge
//! is applied afterwards, and uncertainty is the square root of the diagonal of
//! the inverse Hessian mapped into that gauge.

use std::f64::consts::{PI, SQRT_2};
use std::fmt;

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use tracing::{debug, warn};

use crate::sampler::tally::TallyTable;

/// Dense Hessian limit; beyond this a sparse solver would be needed.
const MAX_ITEMS: usize = 5_000;

/// Below this z the asymptotic expansions replace `erfc`.
const TAIL_Z: f64 = -35.0;

const MIN_TIE_PROB: f64 = 1e-300;

/// Bounds on a fitted tie band, as `ln(delta)`.
const MIN_LN_BAND: f64 = -13.815_510_557_964_274; // ln(1e-6)
const MAX_LN_BAND: f64 = 2.302_585_092_994_046; // ln(10)

// ---------------------------------------------------------------------
//  Config
// ---------------------------------------------------------------------

/// Tie band handling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TieBand {
    /// Fixed `delta >= 0`.
    Fixed { delta: f64 },
    /// Estimated jointly with the utilities, starting from `initial > 0`.
    Fitted { initial: f64 },
}

impl Default for TieBand {
    fn default() -> Self {
        TieBand::Fixed { delta: 0.1 }
    }
}

/// Which utility is fixed to remove the additive degree of freedom.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Gauge {
    /// Included utilities sum to zero.
    #[default]
    ZeroMean,
    /// Item `item` (catalog index) is fixed at `value`.
    Pin { item: usize, value: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartPoint {
    #[default]
    Zeros,
    /// Centred net win rate per item, scaled by the noise scale.
    NetWinRate,
}

/// Configuration for the Thurstonian fitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    // -- Model ----------------------------------------------------------------

    /// Per-item noise scale; the difference noise is `sigma * sqrt(2)`.
    pub sigma: f64,
    pub tie_band: TieBand,
    /// Precision of the zero-mean prior. 0.01 is a prior std of 10 scale units,
    /// far wider than any utility the data supports.
    pub prior_precision: f64,

    // -- Output ---------------------------------------------------------------

    pub gauge: Gauge,

    // -- Optimiser ------------------------------------------------------------

    pub start: StartPoint,
    /// Convergence threshold on the gradient's Euclidean norm.
    pub grad_tol: f64,
    pub max_iters: usize,
    /// Sufficient-decrease constant for the backtracking line search.
    pub armijo: f64,
    pub backtrack: f64,
    pub max_backtracks: usize,

    // -- Numerical stability -------------------------------------------------

    /// Starting ridge when the Hessian is not positive definite; escalated x10 up to four times.
    pub ridge_lambda: f64,
    pub tiny: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            sigma: 1.0,
            tie_band: TieBand::default(),
            prior_precision: 0.01,
            gauge: Gauge::ZeroMean,
            start: StartPoint::Zeros,
            grad_tol: 1e-6,
            max_iters: 500,
            armijo: 1e-4,
            backtrack: 0.5,
            max_backtracks: 60,
            ridge_lambda: 1e-9,
            tiny: 1e-12,
        }
    }
}

// ---------------------------------------------------------------------
//  Results
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedItem {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitDiagnostics {
    pub iterations: usize,
    pub grad_norm: f64,
    pub converged: bool,
    /// Log-likelihood at the solution, without the prior.
    pub log_likelihood: f64,
    /// Negative log-posterior that was minimised.
    pub objective: f64,
    /// Connected components of the comparison graph over included items.
    pub components: usize,
    pub pairs_used: usize,
    pub trials_used: u64,
    /// A ridge or diagonal fallback was needed to invert the Hessian.
    pub degraded_covariance: bool,
}

/// Fitted utilities in catalog order. Excluded items carry `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilityFit {
    pub means: Vec<Option<f64>>,
    pub stds: Vec<Option<f64>>,
    /// Tie band used (fixed) or estimated (fitted).
    pub tie_band: f64,
    pub gauge: Gauge,
    pub excluded: Vec<ExcludedItem>,
    pub diagnostics: FitDiagnostics,
}

impl UtilityFit {
    pub fn mean(&self, item: usize) -> Option<f64> {
        self.means.get(item).copied().flatten()
    }

    pub fn std(&self, item: usize) -> Option<f64> {
        self.stds.get(item).copied().flatten()
    }

    /// Included items, highest utility first; index breaks ties.
    pub fn ranking(&self) -> Vec<usize> {
        let mut ranked: Vec<(usize, f64)> = self
            .means
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.map(|m| (i, m)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.into_iter().map(|(i, _)| i).collect()
    }
}

/// Where the data ran out when a fit could not start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataShortfall {
    pub reason: String,
    /// Items with no valid trials.
    pub items: Vec<usize>,
    /// Sampled pairs whose trials were all dropped.
    pub empty_pairs: Vec<(usize, usize)>,
}

impl fmt::Display for DataShortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}; items without valid trials: {:?}; sampled pairs without valid trials: {:?}",
            self.reason, self.items, self.empty_pairs
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FitError {
    #[error("insufficient data: {0}")]
    InsufficientData(DataShortfall),
    #[error(
        "optimizer did not converge after {} iterations (gradient norm {:.3e})",
        .0.diagnostics.iterations,
        .0.diagnostics.grad_norm
    )]
    NonConvergence(Box<UtilityFit>),
    #[error("invalid fit configuration: {0}")]
    InvalidConfig(String),
}

impl FitError {
    /// Best-so-far fit carried by a non-convergence error.
    pub fn partial_fit(&self) -> Option<&UtilityFit> {
        match self {
            FitError::NonConvergence(fit) => Some(fit),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------
//  Normal distribution helpers
// ---------------------------------------------------------------------

pub(crate) fn normal_cdf(z: f64) -> f64 {
    0.5 * erfc(-z / SQRT_2)
}

fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * PI).sqrt()
}

fn log_normal_cdf(z: f64) -> f64 {
    if z < TAIL_Z {
        let z2 = z * z;
        -0.5 * z2 - (-z).ln() - 0.5 * (2.0 * PI).ln() + (1.0 - 1.0 / z2 + 3.0 / (z2 * z2)).ln()
    } else {
        normal_cdf(z).ln()
    }
}

/// Inverse Mills ratio `phi(z) / Phi(z)`.
fn mills(z: f64) -> f64 {
    if z < TAIL_Z {
        let z2 = z * z;
        -z / (1.0 - 1.0 / z2 + 3.0 / (z2 * z2))
    } else {
        normal_pdf(z) / normal_cdf(z)
    }
}

/// Outcome probabilities for one trial of a pair with utility difference `d`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChoiceProbabilities {
    pub a: f64,
    pub b: f64,
    pub tie: f64,
}

pub fn choice_probabilities(d: f64, delta: f64, sigma: f64) -> ChoiceProbabilities {
    let s = sigma * SQRT_2;
    let a = normal_cdf((d - delta) / s);
    let b = normal_cdf((-d - delta) / s);
    ChoiceProbabilities {
        a,
        b,
        tie: (1.0 - a - b).max(0.0),
    }
}

// ---------------------------------------------------------------------
//  Per-pair likelihood
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct FitPair {
    a: usize,
    b: usize,
    wins_a: f64,
    wins_b: f64,
    ties: f64,
}

/// Log-likelihood of one pair and its derivatives in `d` and `delta`.
#[derive(Debug, Clone, Copy, Default)]
struct PairTerms {
    log_lik: f64,
    d1: f64,
    d2: f64,
    d_band: f64,
}

fn pair_terms(d: f64, delta: f64, s: f64, pair: &FitPair, tiny: f64) -> PairTerms {
    if delta <= tiny {
        let wa = pair.wins_a + 0.5 * pair.ties;
        let wb = pair.wins_b + 0.5 * pair.ties;
        let za = d / s;
        let zb = -za;
        let (ma, mb) = (mills(za), mills(zb));
        return PairTerms {
            log_lik: wa * log_normal_cdf(za) + wb * log_normal_cdf(zb),
            d1: (wa * ma - wb * mb) / s,
            d2: -(wa * ma * (za + ma) + wb * mb * (zb + mb)) / (s * s),
            d_band: 0.0,
        };
    }

    let za = (d - delta) / s;
    let zb = (-d - delta) / s;
    let (ma, mb) = (mills(za), mills(zb));
    let mut terms = PairTerms {
        log_lik: pair.wins_a * log_normal_cdf(za) + pair.wins_b * log_normal_cdf(zb),
        d1: (pair.wins_a * ma - pair.wins_b * mb) / s,
        d2: -(pair.wins_a * ma * (za + ma) + pair.wins_b * mb * (zb + mb)) / (s * s),
        d_band: -(pair.wins_a * ma + pair.wins_b * mb) / s,
    };

    if pair.ties > 0.0 {
        // Evaluate the band mass at |d| so P(tie) is exactly symmetric in d.
        let ad = d.abs();
        let p_tie = (normal_cdf((delta - ad) / s) - normal_cdf((-delta - ad) / s)).max(MIN_TIE_PROB);
        let (pa, pb) = (normal_pdf(za), normal_pdf(zb));
        let slope = pb - pa;
        terms.log_lik += pair.ties * p_tie.ln();
        terms.d1 += pair.ties * slope / (s * p_tie);
        terms.d2 +=
            pair.ties * ((zb * pb + za * pa) * p_tie - slope * slope) / (s * s * p_tie * p_tie);
        terms.d_band += pair.ties * (pa + pb) / (s * p_tie);
    }
    terms
}

// ---------------------------------------------------------------------
//  Objective
// ---------------------------------------------------------------------

/// Negative log-posterior over pinned coordinates.
///
/// `x[0..m-1]` are utilities of local items `1..m` (item 0 is fixed at zero);
/// when the band is fitted, `x[m-1]` is `ln(delta)`.
struct FitProblem {
    m: usize,
    pairs: Vec<FitPair>,
    s: f64,
    prior: f64,
    band: TieBand,
    tiny: f64,
}

struct Evaluation {
    objective: f64,
    log_lik: f64,
    grad: DVector<f64>,
}

impl FitProblem {
    fn dim(&self) -> usize {
        match self.band {
            TieBand::Fixed { .. } => self.m - 1,
            TieBand::Fitted { .. } => self.m,
        }
    }

    fn utilities(&self, x: &DVector<f64>) -> Vec<f64> {
        let mut u = vec![0.0; self.m];
        for k in 1..self.m {
            u[k] = x[k - 1];
        }
        u
    }

    /// Band value and whether `ln(delta)` lies strictly inside its bounds.
    fn delta(&self, x: &DVector<f64>) -> (f64, bool) {
        match self.band {
            TieBand::Fixed { delta } => (delta, false),
            TieBand::Fitted { .. } => {
                let eta = x[self.m - 1];
                let inside = eta > MIN_LN_BAND && eta < MAX_LN_BAND;
                (eta.clamp(MIN_LN_BAND, MAX_LN_BAND).exp(), inside)
            }
        }
    }

    fn evaluate(&self, x: &DVector<f64>) -> Evaluation {
        let u = self.utilities(x);
        let (delta, band_free) = self.delta(x);

        let mut grad_u = vec![0.0; self.m];
        let mut log_lik = 0.0;
        let mut d_band = 0.0;
        for pair in &self.pairs {
            let t = pair_terms(u[pair.a] - u[pair.b], delta, self.s, pair, self.tiny);
            log_lik += t.log_lik;
            grad_u[pair.a] -= t.d1;
            grad_u[pair.b] += t.d1;
            d_band += t.d_band;
        }

        let mean = u.iter().sum::<f64>() / self.m as f64;
        let mut penalty = 0.0;
        for (g, ui) in grad_u.iter_mut().zip(&u) {
            let c = ui - mean;
            penalty += c * c;
            *g += self.prior * c;
        }

        let mut grad = DVector::<f64>::zeros(self.dim());
        for k in 1..self.m {
            grad[k - 1] = grad_u[k];
        }
        if let TieBand::Fitted { .. } = self.band {
            grad[self.m - 1] = if band_free { -d_band * delta } else { 0.0 };
        }

        Evaluation {
            objective: -log_lik + 0.5 * self.prior * penalty,
            log_lik,
            grad,
        }
    }

    /// Full `m x m` Hessian of the objective in `u`, with `delta` held fixed.
    fn hessian(&self, u: &[f64], delta: f64) -> DMatrix<f64> {
        let m = self.m;
        let mut h = DMatrix::<f64>::zeros(m, m);
        for pair in &self.pairs {
            let t = pair_terms(u[pair.a] - u[pair.b], delta, self.s, pair, self.tiny);
            let w = (-t.d2).max(0.0);
            h[(pair.a, pair.a)] += w;
            h[(pair.b, pair.b)] += w;
            h[(pair.a, pair.b)] -= w;
            h[(pair.b, pair.a)] -= w;
        }
        let off = self.prior / m as f64;
        for i in 0..m {
            for j in 0..m {
                h[(i, j)] -= off;
            }
            h[(i, i)] += self.prior;
        }
        h
    }
}

// ---------------------------------------------------------------------
//  BFGS
// ---------------------------------------------------------------------

struct BfgsOutcome {
    x: DVector<f64>,
    iterations: usize,
    grad_norm: f64,
    converged: bool,
}

fn line_search<F>(
    objective: &F,
    x: &DVector<f64>,
    fx: f64,
    p: &DVector<f64>,
    slope: f64,
    cfg: &FitConfig,
) -> Option<(DVector<f64>, f64, DVector<f64>)>
where
    F: Fn(&DVector<f64>) -> (f64, DVector<f64>),
{
    // Admit rounding-level increases so steps near the optimum are not rejected.
    let slack = 8.0 * f64::EPSILON * fx.abs().max(1.0);
    let mut step = 1.0;
    for _ in 0..cfg.max_backtracks {
        let x_new = x + p * step;
        let (f_new, g_new) = objective(&x_new);
        if f_new.is_finite() && f_new <= fx + cfg.armijo * step * slope + slack {
            return Some((x_new, f_new, g_new));
        }
        step *= cfg.backtrack;
    }
    None
}

fn minimize_bfgs<F>(objective: F, x0: DVector<f64>, cfg: &FitConfig) -> BfgsOutcome
where
    F: Fn(&DVector<f64>) -> (f64, DVector<f64>),
{
    let k = x0.len();
    let mut x = x0;
    let (mut fx, mut g) = objective(&x);
    let mut h_inv = DMatrix::<f64>::identity(k, k);
    let mut fresh = true;
    let mut iterations = 0;

    while iterations < cfg.max_iters && g.norm() >= cfg.grad_tol {
        let mut p = -(&h_inv * &g);
        let mut slope = g.dot(&p);
        if slope >= 0.0 || !slope.is_finite() {
            h_inv = DMatrix::identity(k, k);
            fresh = true;
            p = -g.clone();
            slope = -g.norm_squared();
        }

        let Some((x_new, f_new, g_new)) = line_search(&objective, &x, fx, &p, slope, cfg) else {
            if fresh {
                break;
            }
            h_inv = DMatrix::identity(k, k);
            fresh = true;
            continue;
        };
        iterations += 1;

        let s = &x_new - &x;
        let y = &g_new - &g;
        let sy = s.dot(&y);
        if sy > cfg.tiny {
            if fresh {
                let yy = y.norm_squared();
                if yy > 0.0 {
                    h_inv = DMatrix::identity(k, k) * (sy / yy);
                }
            }
            let hy = &h_inv * &y;
            let yhy = y.dot(&hy);
            h_inv += (&s * s.transpose()) * ((sy + yhy) / (sy * sy))
                - (&hy * s.transpose() + &s * hy.transpose()) / sy;
            fresh = false;
        }

        x = x_new;
        fx = f_new;
        g = g_new;
    }

    let grad_norm = g.norm();
    BfgsOutcome {
        x,
        iterations,
        grad_norm,
        converged: grad_norm < cfg.grad_tol,
    }
}

// ---------------------------------------------------------------------
//  Graph topology and covariance
// ---------------------------------------------------------------------

fn count_components(m: usize, pairs: &[FitPair]) -> usize {
    let mut parent: Vec<usize> = (0..m).collect();
    fn find(parent: &mut [usize], mut v: usize) -> usize {
        while parent[v] != v {
            parent[v] = parent[parent[v]];
            v = parent[v];
        }
        v
    }
    for pair in pairs {
        let (ra, rb) = (find(&mut parent, pair.a), find(&mut parent, pair.b));
        if ra != rb {
            parent[ra.max(rb)] = ra.min(rb);
        }
    }
    (0..m).filter(|&v| find(&mut parent, v) == v).count()
}

/// Covariance of `u` with local item 0 pinned: an `m x m` matrix whose first
/// row and column are zero. Returns whether a ridge or fallback was needed.
fn pinned_covariance(h_full: &DMatrix<f64>, cfg: &FitConfig) -> (DMatrix<f64>, bool) {
    let m = h_full.nrows();
    let k = m - 1;
    let h_red = h_full.view((1, 1), (k, k)).into_owned();

    let base_ridge = cfg.ridge_lambda.max(0.0);
    let mut ridge_candidates = vec![0.0];
    let mut ridge = if base_ridge > 0.0 { base_ridge } else { 1e-9 };
    for _ in 0..5 {
        ridge_candidates.push(ridge);
        ridge *= 10.0;
    }

    let mut inverse: Option<DMatrix<f64>> = None;
    let mut used_ridge = 0.0;
    for candidate in ridge_candidates {
        let mut system = h_red.clone();
        for d in 0..k {
            system[(d, d)] += candidate;
        }
        if let Some(chol) = Cholesky::new(system) {
            inverse = Some(chol.inverse());
            used_ridge = candidate;
            break;
        }
    }

    let degraded = inverse.is_none() || used_ridge > 0.0;
    let inverse = inverse.unwrap_or_else(|| {
        DMatrix::from_fn(k, k, |i, j| {
            if i == j {
                1.0 / h_red[(i, i)].max(cfg.tiny)
            } else {
                0.0
            }
        })
    });

    let mut cov = DMatrix::<f64>::zeros(m, m);
    cov.view_mut((1, 1), (k, k)).copy_from(&inverse);
    (cov, degraded)
}

// ---------------------------------------------------------------------
//  Public API
// ---------------------------------------------------------------------

fn validate(cfg: &FitConfig, n: usize) -> Result<(), FitError> {
    if !(cfg.sigma.is_finite() && cfg.sigma > 0.0) {
        return Err(FitError::InvalidConfig(format!("sigma must be positive, got {}", cfg.sigma)));
    }
    if !(cfg.prior_precision.is_finite() && cfg.prior_precision >= 0.0) {
        return Err(FitError::InvalidConfig(format!(
            "prior_precision must be non-negative, got {}",
            cfg.prior_precision
        )));
    }
    match cfg.tie_band {
        TieBand::Fixed { delta } if !(delta.is_finite() && delta >= 0.0) => {
            return Err(FitError::InvalidConfig(format!(
                "tie band must be non-negative, got {delta}"
            )));
        }
        TieBand::Fitted { initial } if !(initial.is_finite() && initial > 0.0) => {
            return Err(FitError::InvalidConfig(format!(
                "initial tie band must be positive, got {initial}"
            )));
        }
        _ => {}
    }
    if cfg.grad_tol <= 0.0 || cfg.max_iters == 0 {
        return Err(FitError::InvalidConfig(
            "grad_tol must be positive and max_iters non-zero".to_string(),
        ));
    }
    if n > MAX_ITEMS {
        return Err(FitError::InvalidConfig(format!(
            "{n} items exceeds the dense solver limit of {MAX_ITEMS}"
        )));
    }
    if let Gauge::Pin { item, value } = cfg.gauge {
        if item >= n || !value.is_finite() {
            return Err(FitError::InvalidConfig(format!(
                "pinned item {item} is not a finite pin within {n} items"
            )));
        }
    }
    Ok(())
}

/// Fit utilities and uncertainties to pair tallies.
///
/// Deterministic: identical tallies and config always produce identical output.
/// Items with no valid trials are excluded and reported. Fewer than two
/// included items is `InsufficientData`; an optimiser that stops before the
/// gradient tolerance is `NonConvergence`, carrying the best-so-far fit.
pub fn fit(tallies: &TallyTable, cfg: &FitConfig) -> Result<UtilityFit, FitError> {
    let n = tallies.n_items();
    validate(cfg, n)?;

    let trials = tallies.item_trials();
    let included: Vec<usize> = (0..n).filter(|&i| trials[i] > 0).collect();
    let excluded: Vec<ExcludedItem> = (0..n)
        .filter(|&i| trials[i] == 0)
        .map(|index| ExcludedItem {
            index,
            reason: "no valid trials".to_string(),
        })
        .collect();

    let shortfall = |reason: String| {
        FitError::InsufficientData(DataShortfall {
            reason,
            items: excluded.iter().map(|e| e.index).collect(),
            empty_pairs: tallies
                .iter()
                .filter(|t| t.valid() == 0)
                .map(|t| (t.i, t.j))
                .collect(),
        })
    };
    if included.len() < 2 {
        return Err(shortfall(format!(
            "{} of {n} items have valid trials; at least 2 are required",
            included.len()
        )));
    }
    if let Gauge::Pin { item, .. } = cfg.gauge {
        if trials[item] == 0 {
            return Err(shortfall(format!("pinned item {item} has no valid trials")));
        }
    }

    let mut local = vec![None; n];
    for (pos, &item) in included.iter().enumerate() {
        local[item] = Some(pos);
    }
    let pairs: Vec<FitPair> = tallies
        .iter()
        .filter(|t| t.valid() > 0)
        .filter_map(|t| {
            Some(FitPair {
                a: local[t.i]?,
                b: local[t.j]?,
                wins_a: t.wins_a as f64,
                wins_b: t.wins_b as f64,
                ties: t.ties as f64,
            })
        })
        .collect();

    let m = included.len();
    let components = count_components(m, &pairs);
    if components > 1 {
        if cfg.prior_precision > 0.0 {
            debug!(components, "comparison graph is disconnected; prior anchors components");
        } else {
            warn!(
                components,
                "comparison graph is disconnected and prior_precision is 0; offsets between components are unidentified"
            );
        }
    }

    let problem = FitProblem {
        m,
        pairs,
        s: cfg.sigma * SQRT_2,
        prior: cfg.prior_precision,
        band: cfg.tie_band,
        tiny: cfg.tiny,
    };

    let x0 = start_point(&problem, tallies, &included, cfg);
    let outcome = minimize_bfgs(
        |x| {
            let e = problem.evaluate(x);
            (e.objective, e.grad)
        },
        x0,
        cfg,
    );

    let u = problem.utilities(&outcome.x);
    let (delta, _) = problem.delta(&outcome.x);
    let at_solution = problem.evaluate(&outcome.x);
    let hessian = problem.hessian(&u, delta);
    let (cov_pinned, degraded) = pinned_covariance(&hessian, cfg);

    // Gauge map u' = (I - 1 w^T) u + offset.
    let (weights, offset) = match cfg.gauge {
        Gauge::ZeroMean => (DVector::from_element(m, 1.0 / m as f64), 0.0),
        Gauge::Pin { item, value } => {
            let mut w = DVector::zeros(m);
            if let Some(pos) = local[item] {
                w[pos] = 1.0;
            }
            (w, value)
        }
    };
    let u_vec = DVector::from_vec(u);
    let level = weights.dot(&u_vec);
    let transform = DMatrix::<f64>::identity(m, m) - DVector::from_element(m, 1.0) * weights.transpose();
    let cov = &transform * cov_pinned * transform.transpose();

    let mut means = vec![None; n];
    let mut stds = vec![None; n];
    for (pos, &item) in included.iter().enumerate() {
        means[item] = Some(u_vec[pos] - level + offset);
        stds[item] = Some(cov[(pos, pos)].max(0.0).sqrt());
    }

    let fit = UtilityFit {
        means,
        stds,
        tie_band: delta,
        gauge: cfg.gauge,
        excluded,
        diagnostics: FitDiagnostics {
            iterations: outcome.iterations,
            grad_norm: outcome.grad_norm,
            converged: outcome.converged,
            log_likelihood: at_solution.log_lik,
            objective: at_solution.objective,
            components,
            pairs_used: problem.pairs.len(),
            trials_used: tallies.total_valid(),
            degraded_covariance: degraded,
        },
    };

    if degraded {
        warn!("Hessian was not positive definite; uncertainties use a regularised inverse");
    }
    if !outcome.converged {
        warn!(
            iterations = outcome.iterations,
            grad_norm = outcome.grad_norm,
            "Thurstonian fit did not converge"
        );
        return Err(FitError::NonConvergence(Box::new(fit)));
    }
    debug!(
        items = m,
        iterations = outcome.iterations,
        grad_norm = outcome.grad_norm,
        tie_band = delta,
        "Thurstonian fit converged"
    );
    Ok(fit)
}

fn start_point(
    problem: &FitProblem,
    tallies: &TallyTable,
    included: &[usize],
    cfg: &FitConfig,
) -> DVector<f64> {
    let mut x = DVector::<f64>::zeros(problem.dim());
    if let TieBand::Fitted { initial } = cfg.tie_band {
        x[problem.m - 1] = initial.ln().clamp(MIN_LN_BAND, MAX_LN_BAND);
    }
    if cfg.start == StartPoint::NetWinRate {
        let n = tallies.n_items();
        let mut net = vec![0.0; n];
        let mut valid = vec![0.0; n];
        for t in tallies.iter() {
            let diff = t.wins_a as f64 - t.wins_b as f64;
            net[t.i] += diff;
            net[t.j] -= diff;
            valid[t.i] += t.valid() as f64;
            valid[t.j] += t.valid() as f64;
        }
        let rate = |item: usize| problem.s * net[item] / valid[item].max(1.0);
        let base = rate(included[0]);
        for (pos, &item) in included.iter().enumerate().skip(1) {
            x[pos - 1] = rate(item) - base;
        }
    }
    x
}

// ---------------------------------------------------------------------
//  Tests
// ---------------------------------------------------------------------
