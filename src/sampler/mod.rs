//! Pairwise trial sampler.
//!
//! For one subject, runs `K` trials on each planned pair through a
//! `JudgmentSource` and reduces the answers to per-pair tallies:
//!
//! 1. Enumerate pairs (all `C(n, 2)`, or rounds of an active plan).
//! 2. Expand each pair into `K` trials, alternating which item fills the
//!    first slot; consecutive pairs start on opposite orientations.
//! 3. Run trials concurrently under a shared semaphore with a per-trial
//!    timeout; retry transient source errors with exponential backoff.
//! 4. Fold outcomes into tallies by pair, independent of completion order.
//!
//! Unparseable answers are dropped, never retried, and never counted as ties.

pub mod judgment;
pub mod planner;
pub mod simulated;
pub mod tally;
pub mod trace;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::catalog::ItemCatalog;
use crate::gateway::backoff_delay;
use crate::subject::Subject;
use crate::thurstone::{self, FitConfig, FitError};

pub use judgment::{
    parse_forced_choice, Choice, JudgmentError, JudgmentRequest, JudgmentSource, LlmJudge,
    Outcome, Presentation,
};
pub use planner::{ActivePlanConfig, PairPlan};
pub use simulated::SimulatedJudge;
pub use tally::{PairTally, TallyError, TallyTable};
pub use trace::{JsonlTraceSink, TraceError, TraceSink, TraceWorker, TrialTrace};

// =============================================================================
// Config
// =============================================================================

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Trials per pair (`K`).
    pub trials_per_pair: u32,
    /// Maximum in-flight trials when the sampler owns its limiter.
    pub concurrency: usize,
    /// Attempts per trial, including the first; only transient errors retry.
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub trial_timeout: Duration,
    pub plan: PairPlan,
    /// Warn when more than this fraction of answers is unparseable.
    pub unparseable_warn_fraction: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            trials_per_pair: 5,
            concurrency: 30,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            trial_timeout: Duration::from_secs(120),
            plan: PairPlan::Exhaustive,
            unparseable_warn_fraction: 0.5,
        }
    }
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleStats {
    pub pairs: usize,
    pub trials_requested: u64,
    pub trials_valid: u64,
    pub unparseable: u64,
    /// Trials abandoned after a permanent error or exhausted retries.
    pub failed: u64,
    /// Judge calls, including retries.
    pub attempts: u64,
}

impl SampleStats {
    fn absorb(&mut self, other: &SampleStats) {
        self.pairs += other.pairs;
        self.trials_requested += other.trials_requested;
        self.trials_valid += other.trials_valid;
        self.unparseable += other.unparseable;
        self.failed += other.failed;
        self.attempts += other.attempts;
    }

    /// Unparseable share of the answers that arrived.
    pub fn unparseable_fraction(&self) -> f64 {
        let answered = self.trials_valid + self.unparseable;
        if answered == 0 {
            0.0
        } else {
            self.unparseable as f64 / answered as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct SampleOutcome {
    pub tallies: TallyTable,
    pub stats: SampleStats,
}

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("pair ({i}, {j}) is invalid for a catalog of {n_items} items")]
    InvalidPair { i: usize, j: usize, n_items: usize },
    #[error("tally error: {0}")]
    Tally(#[from] TallyError),
    #[error("interim fit failed: {0}")]
    Fit(#[from] FitError),
    #[error("background task failed: {0}")]
    Join(String),
}

// =============================================================================
// Sampler
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct TrialTask {
    slot: usize,
    pair_index: usize,
    i: usize,
    j: usize,
    trial: u32,
    presentation: Presentation,
}

#[derive(Debug)]
enum TrialResult {
    Valid(Outcome),
    Unparseable(String),
    Failed(String),
}

struct TrialRecord {
    task: TrialTask,
    result: TrialResult,
    attempts: u32,
}

/// Presentation for trial `trial` of the `pair_index`-th planned pair.
pub fn presentation_for(pair_index: usize, trial: u32) -> Presentation {
    if (pair_index + trial as usize) % 2 == 0 {
        Presentation::AFirst
    } else {
        Presentation::BFirst
    }
}

pub struct Sampler {
    cfg: SamplerConfig,
    limiter: Arc<Semaphore>,
}

impl Sampler {
    pub fn new(cfg: SamplerConfig) -> Self {
        let limiter = Arc::new(Semaphore::new(cfg.concurrency.max(1)));
        Self { cfg, limiter }
    }

    /// Share an existing limiter, bounding in-flight trials across samplers.
    pub fn with_limiter(cfg: SamplerConfig, limiter: Arc<Semaphore>) -> Self {
        Self { cfg, limiter }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.cfg
    }

    pub fn limiter(&self) -> Arc<Semaphore> {
        self.limiter.clone()
    }

    /// Sample one subject according to the configured pair plan.
    ///
    /// `fit_cfg` is used only by the active plan, between rounds.
    pub async fn sample(
        &self,
        source: &dyn JudgmentSource,
        subject: &Subject,
        catalog: &ItemCatalog,
        fit_cfg: &FitConfig,
        trace: Option<&dyn TraceSink>,
    ) -> Result<SampleOutcome, SampleError> {
        match self.cfg.plan {
            PairPlan::Exhaustive => {
                let pairs = planner::all_pairs(catalog.len());
                self.sample_pairs(source, subject, catalog, &pairs, trace).await
            }
            PairPlan::Active(plan) => {
                self.sample_active(source, subject, catalog, &plan, fit_cfg, trace)
                    .await
            }
        }
    }

    /// Run `K` trials on each of `pairs` (canonical `i < j`).
    pub async fn sample_pairs(
        &self,
        source: &dyn JudgmentSource,
        subject: &Subject,
        catalog: &ItemCatalog,
        pairs: &[(usize, usize)],
        trace: Option<&dyn TraceSink>,
    ) -> Result<SampleOutcome, SampleError> {
        self.sample_round(source, subject, catalog, pairs, 0, trace)
            .await
    }

    async fn sample_round(
        &self,
        source: &dyn JudgmentSource,
        subject: &Subject,
        catalog: &ItemCatalog,
        pairs: &[(usize, usize)],
        first_pair_index: usize,
        trace: Option<&dyn TraceSink>,
    ) -> Result<SampleOutcome, SampleError> {
        let n = catalog.len();
        let mut seen = HashSet::with_capacity(pairs.len());
        for &(i, j) in pairs {
            if i >= j || j >= n {
                return Err(SampleError::InvalidPair { i, j, n_items: n });
            }
            if !seen.insert((i, j)) {
                return Err(TallyError::DuplicatePair { i, j }.into());
            }
        }

        let k = self.cfg.trials_per_pair;
        let tasks: Vec<TrialTask> = pairs
            .iter()
            .enumerate()
            .flat_map(|(slot, &(i, j))| {
                let pair_index = first_pair_index + slot;
                (0..k).map(move |trial| TrialTask {
                    slot,
                    pair_index,
                    i,
                    j,
                    trial,
                    presentation: presentation_for(pair_index, trial),
                })
            })
            .collect();

        let records = stream::iter(
            tasks
                .into_iter()
                .map(|task| self.run_trial(source, subject, catalog, task)),
        )
        .buffer_unordered(self.cfg.concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

        let mut tallies: Vec<PairTally> = pairs
            .iter()
            .map(|&(i, j)| PairTally::new(i, j, k))
            .collect();
        let mut stats = SampleStats {
            pairs: pairs.len(),
            trials_requested: pairs.len() as u64 * k as u64,
            ..SampleStats::default()
        };
        let subject_key = subject.key().to_string();
        let mut trace_failed = false;

        for record in records {
            stats.attempts += record.attempts as u64;
            let (outcome, error) = match &record.result {
                TrialResult::Valid(outcome) => {
                    stats.trials_valid += 1;
                    tallies[record.task.slot].record(*outcome);
                    (Some(*outcome), None)
                }
                TrialResult::Unparseable(raw) => {
                    stats.unparseable += 1;
                    (None, Some(format!("unparseable: {raw}")))
                }
                TrialResult::Failed(message) => {
                    stats.failed += 1;
                    (None, Some(message.clone()))
                }
            };

            if let (Some(sink), false) = (trace, trace_failed) {
                let event = TrialTrace {
                    timestamp: chrono::Utc::now(),
                    subject_key: subject_key.clone(),
                    item_a: catalog.items()[record.task.i].id.clone(),
                    item_b: catalog.items()[record.task.j].id.clone(),
                    pair_index: record.task.pair_index,
                    trial: record.task.trial,
                    presentation: record.task.presentation,
                    attempts: record.attempts,
                    outcome,
                    error,
                };
                if let Err(err) = sink.record(event) {
                    warn!(error = %err, "trial trace disabled after write failure");
                    trace_failed = true;
                }
            }
        }

        let mut table = TallyTable::new(n);
        for tally in tallies {
            table.insert(tally)?;
        }

        if stats.unparseable_fraction() > self.cfg.unparseable_warn_fraction {
            warn!(
                subject = %subject_key,
                unparseable = stats.unparseable,
                valid = stats.trials_valid,
                "more than {:.0}% of answers were unparseable",
                self.cfg.unparseable_warn_fraction * 100.0
            );
        }
        if stats.failed > 0 {
            warn!(subject = %subject_key, failed = stats.failed, "trials abandoned after errors");
        }

        Ok(SampleOutcome {
            tallies: table,
            stats,
        })
    }

    async fn run_trial(
        &self,
        source: &dyn JudgmentSource,
        subject: &Subject,
        catalog: &ItemCatalog,
        task: TrialTask,
    ) -> TrialRecord {
        let items = catalog.items();
        let (first, second) = match task.presentation {
            Presentation::AFirst => (&items[task.i], &items[task.j]),
            Presentation::BFirst => (&items[task.j], &items[task.i]),
        };
        let req = JudgmentRequest {
            subject,
            first,
            second,
            trial: task.trial,
        };

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            let answer = {
                let Ok(_permit) = self.limiter.acquire().await else {
                    break TrialResult::Failed("concurrency limiter closed".to_string());
                };
                timeout(self.cfg.trial_timeout, source.judge(req)).await
            };
            let err = match answer {
                Ok(Ok(choice)) => break TrialResult::Valid(choice.to_outcome(task.presentation)),
                Ok(Err(JudgmentError::Unparseable(raw))) => break TrialResult::Unparseable(raw),
                Ok(Err(err)) => err,
                Err(_) => JudgmentError::transient(format!(
                    "trial timed out after {:?}",
                    self.cfg.trial_timeout
                )),
            };
            if !err.is_retryable() || attempts >= self.cfg.max_attempts.max(1) {
                break TrialResult::Failed(err.to_string());
            }
            let delay = match err.retry_after() {
                Some(wait) => wait.min(backoff_delay(self.cfg.retry_base_delay, 5)),
                None => backoff_delay(self.cfg.retry_base_delay, attempts - 1),
            };
            debug!(attempt = attempts, error = %err, delay_ms = delay.as_millis() as u64, "retrying trial");
            sleep(delay).await;
        };

        TrialRecord {
            task,
            result,
            attempts,
        }
    }

    async fn sample_active(
        &self,
        source: &dyn JudgmentSource,
        subject: &Subject,
        catalog: &ItemCatalog,
        plan: &ActivePlanConfig,
        fit_cfg: &FitConfig,
        trace: Option<&dyn TraceSink>,
    ) -> Result<SampleOutcome, SampleError> {
        let n = catalog.len();
        let target = planner::target_pair_count(n, plan.edge_multiplier);
        let mut rng = StdRng::seed_from_u64(plan.seed);
        let mut sampled: HashSet<(usize, usize)> = HashSet::new();
        let mut table = TallyTable::new(n);
        let mut stats = SampleStats::default();

        let mut batch = planner::ring_lattice(n, plan.degree);
        let mut round = 0usize;
        while !batch.is_empty() {
            let outcome = self
                .sample_round(source, subject, catalog, &batch, sampled.len(), trace)
                .await?;
            for tally in outcome.tallies.iter() {
                table.insert(*tally)?;
            }
            stats.absorb(&outcome.stats);
            sampled.extend(batch.iter().copied());
            round += 1;
            debug!(round, pairs = sampled.len(), target, "active plan round complete");

            if sampled.len() >= target {
                break;
            }

            let snapshot = table.clone();
            let cfg = fit_cfg.clone();
            let fitted = tokio::task::spawn_blocking(move || thurstone::fit(&snapshot, &cfg))
                .await
                .map_err(|e| SampleError::Join(e.to_string()))?;
            let means = match fitted {
                Ok(fit) => fit.means,
                Err(FitError::NonConvergence(fit)) => fit.means,
                Err(FitError::InsufficientData(_)) => vec![None; n],
                Err(err) => return Err(err.into()),
            };

            let want = plan.pairs_per_round.min(target - sampled.len());
            batch = planner::select_informative_pairs(&means, &sampled, want, plan, &mut rng);
        }

        Ok(SampleOutcome {
            tallies: table,
            stats,
        })
    }
}
