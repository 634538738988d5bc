#![forbid(unsafe_code)]

//! # stance-harness
//!
//! Measure where language models sit among political positions.
//!
//! A subject (a model answering for itself, or a model role-playing a
//! politician or platform) is shown pairs of policy statements and asked
//! which it prefers. Repeated forced choices are tallied per pair and fit
//! with a Thurstonian Case V model, giving each statement a latent utility
//! with an uncertainty. Fitted vectors are cached per (subject, item set);
//! every cached subject for an item set is then projected onto two shared
//! principal axes.

pub mod cache;
pub mod catalog;
pub mod evaluation;
pub mod gateway;
pub mod projection;
pub mod prompts;
pub mod sampler;
pub mod store;
pub mod subject;
pub mod survey;
pub mod thurstone;

pub use cache::{
    CacheEntry, CacheError, CacheLookup, MemoryUtilityCache, SqliteUtilityCache, UtilityCache,
    UtilityCacheKey,
};
pub use catalog::{CatalogError, Item, ItemCatalog};
pub use gateway::{Attribution, ChatGateway, Provider, ProviderGateway, UsageSink};
pub use projection::{project, Projection, ProjectionConfig, ProjectionError};
pub use sampler::{
    JsonlTraceSink, JudgmentError, JudgmentSource, LlmJudge, PairPlan, PairTally, SampleOutcome,
    Sampler, SamplerConfig, SimulatedJudge, TallyTable, TraceSink,
};
pub use store::{EntrySource, StoreError, StoreOutcome, UtilityStore};
pub use subject::{EntityRoster, JudgeSettings, Subject, SubjectKey, SubjectKind};
pub use survey::{Survey, SurveyConfig, SurveyError, SurveyReport};
pub use thurstone::{fit, DataShortfall, FitConfig, FitError, Gauge, TieBand, UtilityFit};
