#![forbid(unsafe_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use stance_harness::cache::{SqliteUtilityCache, UtilityCache};
use stance_harness::catalog::ItemCatalog;
use stance_harness::evaluation::run_synthetic_suite;
use stance_harness::gateway::{GatewayConfig, LogUsageSink, Provider, ProviderGateway};
use stance_harness::projection::{self, Projection, ProjectionConfig};
use stance_harness::sampler::{
    ActivePlanConfig, JsonlTraceSink, LlmJudge, PairPlan, SamplerConfig, TallyTable,
};
use stance_harness::store::UtilityStore;
use stance_harness::subject::{EntityRoster, JudgeSettings, Subject};
use stance_harness::survey::{Survey, SurveyConfig};
use stance_harness::thurstone::{self, FitConfig, FitError, Gauge, TieBand};

#[derive(Parser)]
#[command(name = "stance", version, about = "Pairwise policy-preference survey CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute utilities for a model and every entity, then project them
    Survey(SurveyArgs),
    /// Fit a tally table JSON offline
    Fit {
        #[arg(long)]
        tallies: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[command(flatten)]
        fit: FitArgs,
        /// Pin this item index to zero instead of centring
        #[arg(long)]
        pin: Option<usize>,
    },
    /// Project every cached subject for a catalog
    Project {
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out_dir: PathBuf,
        #[command(flatten)]
        projection: ProjectionArgs,
    },
    /// Run synthetic evaluation suite
    Eval {
        #[arg(long)]
        case: Option<String>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Export SQLite cache to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune SQLite cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
    /// List cached subjects, optionally for one catalog
    CacheList {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Drop every cached entry for a subject key
    CacheInvalidate {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        subject: String,
    },
}

#[derive(Args)]
struct SurveyArgs {
    /// Policy catalog: {"category": ["statement", ...]}
    #[arg(long)]
    catalog: PathBuf,
    /// Entities: {"politicians": [...], "platforms": [...]}
    #[arg(long)]
    entities: Option<PathBuf>,
    /// Model surveyed for its own preferences
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = "openrouter")]
    provider: Provider,
    /// Model that role-plays the entities (defaults to --model)
    #[arg(long)]
    entity_model: Option<String>,
    #[arg(long)]
    entity_provider: Option<Provider>,
    #[arg(long)]
    system_prompt: Option<String>,
    #[arg(long, default_value_t = 1.0)]
    temperature: f32,
    #[arg(long, default_value_t = 16)]
    max_tokens: u32,
    #[arg(long)]
    allow_ties: bool,
    /// Trials per pair
    #[arg(short = 'k', long, default_value_t = 5)]
    trials: u32,
    /// Maximum in-flight judge calls across all subjects
    #[arg(long, default_value_t = 30)]
    concurrency: usize,
    #[arg(long, default_value_t = 4)]
    subject_concurrency: usize,
    #[arg(long, default_value_t = 120)]
    trial_timeout_secs: u64,
    /// Sample a budgeted subset of pairs instead of all of them
    #[arg(long)]
    active: bool,
    #[arg(long, default_value_t = 2.0)]
    edge_multiplier: f64,
    #[arg(long, default_value_t = 200)]
    pairs_per_round: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[command(flatten)]
    fit: FitArgs,
    #[command(flatten)]
    projection: ProjectionArgs,
    /// Fail subjects whose fit hits the iteration cap
    #[arg(long)]
    require_convergence: bool,
    #[arg(long)]
    recompute: bool,
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    trace: Option<PathBuf>,
    #[arg(long)]
    out_dir: PathBuf,
}

#[derive(Args)]
struct FitArgs {
    /// Half-width of the indifference band
    #[arg(long, default_value_t = 0.1)]
    tie_band: f64,
    /// Estimate the band, starting from --tie-band
    #[arg(long)]
    fit_tie_band: bool,
    #[arg(long, default_value_t = 500)]
    max_iters: usize,
}

impl FitArgs {
    fn config(&self) -> FitConfig {
        let tie_band = if self.fit_tie_band {
            TieBand::Fitted {
                initial: self.tie_band.max(1e-3),
            }
        } else {
            TieBand::Fixed {
                delta: self.tie_band,
            }
        };
        FitConfig {
            tie_band,
            max_iters: self.max_iters,
            ..FitConfig::default()
        }
    }
}

#[derive(Args)]
struct ProjectionArgs {
    /// Subject placed at negative x and positive y
    #[arg(long)]
    anchor: Option<String>,
    #[arg(long, default_value_t = 0.2)]
    max_missing_fraction: f64,
    #[arg(long)]
    no_standardize: bool,
}

impl ProjectionArgs {
    fn config(&self) -> ProjectionConfig {
        ProjectionConfig {
            max_missing_fraction: self.max_missing_fraction,
            standardize: !self.no_standardize,
            anchor: self.anchor.clone(),
        }
    }
}

fn open_cache(db: Option<PathBuf>) -> Result<SqliteUtilityCache, Box<dyn std::error::Error>> {
    let path = db.unwrap_or_else(SqliteUtilityCache::default_path);
    Ok(SqliteUtilityCache::new(path)?)
}

fn write_projection(out_dir: &Path, projection: &Projection) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(out_dir)?;
    std::fs::write(out_dir.join("projection.csv"), projection.to_csv())?;
    std::fs::write(
        out_dir.join("projection.json"),
        serde_json::to_string_pretty(projection)?,
    )?;
    Ok(())
}

async fn run_survey(args: SurveyArgs) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = ItemCatalog::load(&args.catalog)?;
    let judge_for = |provider: Provider, model: &str| JudgeSettings {
        temperature: args.temperature,
        max_tokens: args.max_tokens,
        system_prompt: args.system_prompt.clone(),
        allow_ties: args.allow_ties,
        ..JudgeSettings::new(provider, model)
    };

    let mut subjects = Vec::new();
    let mut providers = Vec::new();
    if let Some(model) = &args.model {
        subjects.push(Subject::model(judge_for(args.provider, model)));
        providers.push(args.provider);
    }
    if let Some(path) = &args.entities {
        let Some(entity_model) = args.entity_model.as_ref().or(args.model.as_ref()) else {
            return Err("--entities requires --entity-model or --model".into());
        };
        let entity_provider = args.entity_provider.unwrap_or(args.provider);
        let roster = EntityRoster::load(path)?;
        subjects.extend(roster.subjects(&judge_for(entity_provider, entity_model)));
        providers.push(entity_provider);
    }
    if subjects.is_empty() {
        return Err("nothing to survey: pass --model and/or --entities".into());
    }

    let cfg = SurveyConfig {
        sampler: SamplerConfig {
            trials_per_pair: args.trials,
            concurrency: args.concurrency,
            trial_timeout: Duration::from_secs(args.trial_timeout_secs),
            plan: if args.active {
                PairPlan::Active(ActivePlanConfig {
                    edge_multiplier: args.edge_multiplier,
                    pairs_per_round: args.pairs_per_round,
                    seed: args.seed,
                    ..ActivePlanConfig::default()
                })
            } else {
                PairPlan::Exhaustive
            },
            ..SamplerConfig::default()
        },
        fit: args.fit.config(),
        projection: args.projection.config(),
        subject_concurrency: args.subject_concurrency,
        accept_unconverged: !args.require_convergence,
        recompute: args.recompute,
        ..SurveyConfig::default()
    };

    // Retries belong to the sampler: one provider call per judge attempt.
    let gateway = Arc::new(ProviderGateway::from_env(
        &providers,
        Arc::new(LogUsageSink),
        GatewayConfig::single_attempt(),
    )?);
    let judge = LlmJudge::new(gateway).with_run(cfg.run_id);
    let cache = open_cache(args.db)?;
    let _lock = cache.lock_exclusive()?;
    let store = Arc::new(UtilityStore::new(Arc::new(cache)));

    let mut survey = Survey::new(Arc::new(judge), store, cfg);
    let mut trace_worker = None;
    if let Some(path) = &args.trace {
        let (sink, worker) = JsonlTraceSink::new(path)?;
        survey = survey.with_trace(Arc::new(sink));
        trace_worker = Some(worker);
    }

    let report = survey.run(&subjects, &catalog).await?;
    drop(survey);
    if let (Some(worker), Some(path)) = (trace_worker, &args.trace) {
        let rows = worker.join()?;
        tracing::info!(rows, path = %path.display(), "trial trace written");
    }

    std::fs::create_dir_all(&args.out_dir)?;
    std::fs::write(
        args.out_dir.join("report.json"),
        serde_json::to_string_pretty(&report)?,
    )?;
    if let Some(projection) = &report.projection {
        write_projection(&args.out_dir, projection)?;
    }
    println!(
        "computed {} subjects, reused {}, failed {}",
        report.computed(),
        report.cached(),
        report.failed()
    );
    if let Some(err) = &report.projection_error {
        println!("projection skipped: {err}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Survey(args) => run_survey(args).await?,
        Commands::Fit {
            tallies,
            out,
            fit,
            pin,
        } => {
            let raw = std::fs::read_to_string(tallies)?;
            let table: TallyTable = serde_json::from_str(&raw)?;
            let mut cfg = fit.config();
            if let Some(item) = pin {
                cfg.gauge = Gauge::Pin { item, value: 0.0 };
            }
            let result = match thurstone::fit(&table, &cfg) {
                Ok(fit) => fit,
                Err(FitError::NonConvergence(partial)) => {
                    tracing::warn!("fit did not converge; writing best-so-far utilities");
                    *partial
                }
                Err(err) => return Err(err.into()),
            };
            let json = serde_json::to_string_pretty(&result)?;
            match out {
                Some(path) => std::fs::write(path, json)?,
                None => println!("{json}"),
            }
        }
        Commands::Project {
            catalog,
            db,
            out_dir,
            projection,
        } => {
            let catalog = ItemCatalog::load(catalog)?;
            let cache = open_cache(db)?;
            let entries = cache.entries_for_fingerprint(catalog.fingerprint()).await?;
            let result = projection::project(catalog.fingerprint(), &entries, &projection.config())?;
            for excluded in &result.excluded {
                println!("excluded {}: {}", excluded.subject_key, excluded.reason);
            }
            write_projection(&out_dir, &result)?;
            println!(
                "projected {} subjects; explained variance {:.3} / {:.3}",
                result.rows.len(),
                result.explained_variance[0],
                result.explained_variance[1]
            );
        }
        Commands::Eval { case, out } => {
            let results = run_synthetic_suite(case.as_deref()).await?;
            let mut file = File::create(out)?;
            for result in &results {
                let line = serde_json::to_string(result)?;
                writeln!(file, "{line}")?;
            }
        }
        Commands::CacheExport { db, out } => {
            let cache = open_cache(db)?;
            let written = cache.export_jsonl(out).await?;
            println!("exported {written} entries");
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let cache = open_cache(db)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
        Commands::CacheList { db, catalog } => {
            let cache = open_cache(db)?;
            let fingerprint = match catalog {
                Some(path) => Some(ItemCatalog::load(path)?.fingerprint().to_string()),
                None => None,
            };
            for row in cache.list(fingerprint.as_deref()).await? {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Commands::CacheInvalidate { db, subject } => {
            let cache = open_cache(db)?;
            let _lock = cache.lock_exclusive()?;
            let removed = cache.invalidate(&subject).await?;
            println!("removed {removed} entries");
        }
    }

    Ok(())
}
