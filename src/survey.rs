//! End-to-end survey: sample, fit and cache each subject, then project.
//!
//! Subjects run concurrently (bounded by `subject_concurrency`) and share one
//! sampler, so the trial limiter bounds in-flight judge calls across all of
//! them. A subject that fails is reported and skipped; it never stops the
//! others. The projection covers every cached subject for the catalog's item
//! set, including ones computed by earlier runs.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{CacheEntry, CacheError, UtilityCacheKey};
use crate::catalog::ItemCatalog;
use crate::projection::{self, Projection, ProjectionConfig};
use crate::sampler::{JudgmentSource, SampleError, SampleStats, Sampler, SamplerConfig, TraceSink};
use crate::store::{EntrySource, StoreError, UtilityStore};
use crate::subject::{Subject, SubjectKind};
use crate::thurstone::{self, FitConfig, FitError};

#[derive(Debug, Clone)]
pub struct SurveyConfig {
    pub sampler: SamplerConfig,
    pub fit: FitConfig,
    pub projection: ProjectionConfig,
    /// Subjects sampled and fitted at the same time.
    pub subject_concurrency: usize,
    /// Cache best-so-far utilities when the optimiser hits its iteration cap.
    pub accept_unconverged: bool,
    /// Ignore cached entries and overwrite them.
    pub recompute: bool,
    pub run_id: Uuid,
}

impl Default for SurveyConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerConfig::default(),
            fit: FitConfig::default(),
            projection: ProjectionConfig::default(),
            subject_concurrency: 4,
            accept_unconverged: true,
            recompute: false,
            run_id: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SurveyError {
    #[error("sampling failed for {subject}: {source}")]
    Sample { subject: String, source: SampleError },
    #[error("fit failed for {subject}: {source}")]
    Fit { subject: String, source: FitError },
    #[error("background fit failed: {0}")]
    Join(String),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectStatus {
    Cached,
    Computed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectReport {
    pub subject_key: String,
    pub subject_name: String,
    pub subject_kind: SubjectKind,
    pub status: SubjectStatus,
    pub converged: Option<bool>,
    pub excluded_items: Vec<String>,
    /// Present only for subjects sampled in this run.
    pub stats: Option<SampleStats>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SurveyReport {
    pub run_id: Uuid,
    pub fingerprint: String,
    /// In the order the subjects were given.
    pub subjects: Vec<SubjectReport>,
    pub projection: Option<Projection>,
    pub projection_error: Option<String>,
}

impl SurveyReport {
    fn count(&self, status: SubjectStatus) -> usize {
        self.subjects.iter().filter(|s| s.status == status).count()
    }

    pub fn computed(&self) -> usize {
        self.count(SubjectStatus::Computed)
    }

    pub fn cached(&self) -> usize {
        self.count(SubjectStatus::Cached)
    }

    pub fn failed(&self) -> usize {
        self.count(SubjectStatus::Failed)
    }
}

pub struct Survey {
    source: Arc<dyn JudgmentSource>,
    store: Arc<UtilityStore>,
    sampler: Sampler,
    trace: Option<Arc<dyn TraceSink>>,
    cfg: SurveyConfig,
}

impl Survey {
    pub fn new(source: Arc<dyn JudgmentSource>, store: Arc<UtilityStore>, cfg: SurveyConfig) -> Self {
        Self {
            source,
            store,
            sampler: Sampler::new(cfg.sampler.clone()),
            trace: None,
            cfg,
        }
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn config(&self) -> &SurveyConfig {
        &self.cfg
    }

    /// Sample and fit one subject without touching the cache.
    pub async fn compute_subject(
        &self,
        subject: &Subject,
        catalog: &ItemCatalog,
    ) -> Result<(CacheEntry, SampleStats), SurveyError> {
        let key = subject.key().to_string();
        info!(subject = %key, items = catalog.len(), "sampling subject");

        let outcome = self
            .sampler
            .sample(
                self.source.as_ref(),
                subject,
                catalog,
                &self.cfg.fit,
                self.trace.as_deref(),
            )
            .await
            .map_err(|source| SurveyError::Sample {
                subject: key.clone(),
                source,
            })?;

        let tallies = outcome.tallies;
        let fit_cfg = self.cfg.fit.clone();
        let fitted = tokio::task::spawn_blocking(move || thurstone::fit(&tallies, &fit_cfg))
            .await
            .map_err(|e| SurveyError::Join(e.to_string()))?;

        let fit = match fitted {
            Ok(fit) => fit,
            Err(FitError::NonConvergence(partial)) if self.cfg.accept_unconverged => {
                warn!(
                    subject = %key,
                    iterations = partial.diagnostics.iterations,
                    grad_norm = partial.diagnostics.grad_norm,
                    "fit did not converge; keeping best-so-far utilities"
                );
                *partial
            }
            Err(source) => {
                return Err(SurveyError::Fit {
                    subject: key,
                    source,
                })
            }
        };

        for excluded in &fit.excluded {
            if let Some(item) = catalog.get(excluded.index) {
                warn!(
                    subject = %key,
                    item = %item.id,
                    reason = %excluded.reason,
                    "item excluded from fit"
                );
            }
        }

        let entry = CacheEntry::from_fit(
            subject,
            catalog,
            &fit,
            self.cfg.sampler.trials_per_pair,
            Some(self.cfg.run_id),
        );
        Ok((entry, outcome.stats))
    }

    async fn run_subject(&self, subject: &Subject, catalog: &ItemCatalog) -> SubjectReport {
        let key = UtilityCacheKey::for_subject(subject, catalog);
        let mut stats = None;
        let slot = &mut stats;
        let compute = || async move {
            let (entry, sampled) = self.compute_subject(subject, catalog).await?;
            *slot = Some(sampled);
            Ok::<_, SurveyError>(entry)
        };

        let result = if self.cfg.recompute {
            self.store.recompute(&key, compute).await
        } else {
            self.store.get_or_compute(&key, compute).await
        };

        match result {
            Ok(outcome) => SubjectReport {
                subject_key: key.subject_key,
                subject_name: subject.name.clone(),
                subject_kind: subject.kind,
                status: match outcome.source {
                    EntrySource::Cached => SubjectStatus::Cached,
                    EntrySource::Computed => SubjectStatus::Computed,
                },
                converged: Some(outcome.entry.converged),
                excluded_items: outcome.entry.excluded_items,
                stats,
                error: None,
            },
            Err(err) => {
                let message = match err {
                    StoreError::Compute(inner) => inner.to_string(),
                    other => other.to_string(),
                };
                warn!(subject = %key.subject_key, error = %message, "subject skipped");
                SubjectReport {
                    subject_key: key.subject_key,
                    subject_name: subject.name.clone(),
                    subject_kind: subject.kind,
                    status: SubjectStatus::Failed,
                    converged: None,
                    excluded_items: Vec::new(),
                    stats,
                    error: Some(message),
                }
            }
        }
    }

    /// Compute or reuse every subject, then project all cached subjects for
    /// the catalog. Only a cache read failure during projection is fatal.
    pub async fn run(&self, subjects: &[Subject], catalog: &ItemCatalog) -> Result<SurveyReport, SurveyError> {
        let mut reports: Vec<(usize, SubjectReport)> = stream::iter(subjects.iter().enumerate())
            .map(|(idx, subject)| async move { (idx, self.run_subject(subject, catalog).await) })
            .buffer_unordered(self.cfg.subject_concurrency.max(1))
            .collect()
            .await;
        reports.sort_by_key(|(idx, _)| *idx);
        let subjects: Vec<SubjectReport> = reports.into_iter().map(|(_, r)| r).collect();

        let fingerprint = catalog.fingerprint().to_string();
        let entries = self.store.entries_for_fingerprint(&fingerprint).await?;
        let (projection, projection_error) =
            match projection::project(&fingerprint, &entries, &self.cfg.projection) {
                Ok(p) => (Some(p), None),
                Err(err) => {
                    warn!(error = %err, "projection skipped");
                    (None, Some(err.to_string()))
                }
            };

        let report = SurveyReport {
            run_id: self.cfg.run_id,
            fingerprint,
            subjects,
            projection,
            projection_error,
        };
        info!(
            computed = report.computed(),
            cached = report.cached(),
            failed = report.failed(),
            "survey complete"
        );
        Ok(report)
    }
}
