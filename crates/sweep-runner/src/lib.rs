mod backend;
mod clock;
mod config;
mod job;
mod queue;
mod scheduler;
mod search;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sweep_analysis::group_dir;
use sweep_core::{
    atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir,
    BackendKind, JobDescriptor,
};
use tracing::info;
use walkdir::WalkDir;

pub use backend::{
    Backend, BackendSet, CloudVmBackend, CloudVmSettings, CommandOutput, CommandRunner,
    LocalBackend, PollRetry, PollStatus, SgeBackend, SlurmBackend, SystemRunner,
};
pub use clock::{CancellationToken, Clock, ManualClock, SystemClock};
pub use config::{
    load_config, parse_config, validate_payloads, validate_required_fields, AggregationSection,
    CloudSection, ClusterSection, ConfigPayload, DesignSection, ExperimentSection, LoadedConfig,
    Mode, RuntimeSection, SweepConfig,
};
pub use job::{Job, JobRecord};
pub use queue::{QueueCounts, WorkQueue};
pub use scheduler::{
    admission_windows, AggregationPolicy, Discipline, EvaluationOutcome, EvaluationResult,
    FailureReason, FailureRecord, RunOutcome, Scheduler, SchedulerConfig, SubmitRetryPolicy,
    TickSample,
};
pub use search::{FixedProposals, ProposalGenerator};

/// Overrides applied on top of the experiment file, typically from CLI flags.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub backend: Option<BackendKind>,
    pub mode: Option<Mode>,
    pub max_concurrent: Option<usize>,
    pub batch_size: Option<usize>,
    pub poll_interval_secs: Option<u64>,
    pub cancel: CancellationToken,
}

pub struct RunResult {
    pub run_id: String,
    pub experiment_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub outcome: RunOutcome,
}

pub struct SearchResult {
    pub run_id: String,
    pub experiment_dir: PathBuf,
    pub logs_dir: PathBuf,
    /// One outcome per ask/tell round.
    pub batches: Vec<RunOutcome>,
}

impl SearchResult {
    pub fn is_success(&self) -> bool {
        self.batches.iter().all(RunOutcome::is_success)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSummary {
    pub experiment_id: String,
    pub experiment_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub backend: BackendKind,
    pub mode: Mode,
    pub max_concurrent: usize,
    pub batch_size: Option<usize>,
    pub config_count: usize,
    pub seeds_per_config: usize,
    pub total_jobs: usize,
    pub num_batches: usize,
    pub command_preview: Vec<String>,
    /// Artifacts already on disk from earlier runs.
    pub existing_seed_artifacts: usize,
    pub existing_bundles: usize,
}

#[derive(Debug)]
struct RunLock {
    path: PathBuf,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// One scheduler instance per logs dir; a second run would race on
/// aggregation.
fn acquire_run_lock(logs_dir: &Path) -> Result<RunLock> {
    ensure_dir(logs_dir)?;
    let lock_path = logs_dir.join(".sweep.lock");
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(mut file) => {
            let payload = format!(
                "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                std::process::id(),
                Utc::now().to_rfc3339()
            );
            let _ = file.write_all(payload.as_bytes());
            let _ = file.sync_all();
            Ok(RunLock { path: lock_path })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(anyhow!(
            "run_in_progress: another sweep holds {}",
            lock_path.display()
        )),
        Err(e) => Err(e.into()),
    }
}

pub fn run_experiment(path: &Path, options: &RunOptions) -> Result<RunResult> {
    let loaded = load_with_options(path, options)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backends = BackendSet::from_config(
        &loaded.config,
        loaded.config.runtime.backend,
        Arc::new(SystemRunner),
        clock.clone(),
    )?;
    run_loaded(loaded, options, backends, clock)
}

/// Like [`run_experiment`] with caller-supplied backends and clock.
pub fn run_experiment_with_backends(
    path: &Path,
    options: &RunOptions,
    backends: BackendSet,
    clock: Arc<dyn Clock>,
) -> Result<RunResult> {
    let loaded = load_with_options(path, options)?;
    run_loaded(loaded, options, backends, clock)
}

fn run_loaded(
    loaded: LoadedConfig,
    options: &RunOptions,
    backends: BackendSet,
    clock: Arc<dyn Clock>,
) -> Result<RunResult> {
    let logs_dir = loaded.logs_dir();
    let _lock = acquire_run_lock(&logs_dir)?;
    let run_id = run_id_at(clock.now());
    persist_resolved(&loaded)?;
    persist_payloads(&loaded.configs_dir(), &loaded.config.configs)?;

    let descriptors = expand_descriptors(&loaded, &loaded.config.configs);
    info!(
        run_id = %run_id,
        experiment = %loaded.config.experiment.id,
        jobs = descriptors.len(),
        backend = %loaded.config.runtime.backend,
        "starting experiment"
    );
    let scheduler = Scheduler::new(scheduler_config(&loaded), backends, clock.clone())
        .with_cancellation(options.cancel.clone());
    let outcome = scheduler.run(descriptors)?;

    let summary = json!({
        "schema_version": "run_summary_v1",
        "run_id": run_id,
        "experiment_id": loaded.config.experiment.id,
        "completed_at": clock.now().to_rfc3339(),
        "success": outcome.is_success(),
        "cancelled": outcome.cancelled,
        "evaluations": outcome.per_evaluation,
        "jobs": outcome.jobs,
    });
    atomic_write_json_pretty(&logs_dir.join("run_summary.json"), &summary)?;

    Ok(RunResult {
        run_id,
        experiment_dir: loaded.experiment_dir,
        logs_dir,
        outcome,
    })
}

/// Ask/tell loop in sync mode: each round's proposals are expanded over the
/// configured seeds, run to completion and aggregated before the generator
/// hears about them and is asked again.
pub fn run_search(
    path: &Path,
    generator: &mut dyn ProposalGenerator,
    num_batches: usize,
    batch_size: usize,
    options: &RunOptions,
) -> Result<SearchResult> {
    let loaded = load_with_options(path, options)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backends = BackendSet::from_config(
        &loaded.config,
        loaded.config.runtime.backend,
        Arc::new(SystemRunner),
        clock.clone(),
    )?;
    search_loaded(
        loaded,
        generator,
        num_batches,
        batch_size,
        options,
        backends,
        clock,
    )
}

pub fn run_search_with_backends(
    path: &Path,
    generator: &mut dyn ProposalGenerator,
    num_batches: usize,
    batch_size: usize,
    options: &RunOptions,
    backends: BackendSet,
    clock: Arc<dyn Clock>,
) -> Result<SearchResult> {
    let loaded = load_with_options(path, options)?;
    search_loaded(
        loaded,
        generator,
        num_batches,
        batch_size,
        options,
        backends,
        clock,
    )
}

fn search_loaded(
    loaded: LoadedConfig,
    generator: &mut dyn ProposalGenerator,
    num_batches: usize,
    batch_size: usize,
    options: &RunOptions,
    backends: BackendSet,
    clock: Arc<dyn Clock>,
) -> Result<SearchResult> {
    if batch_size == 0 {
        return Err(anyhow!("search batch size must be at least 1"));
    }
    let logs_dir = loaded.logs_dir();
    let _lock = acquire_run_lock(&logs_dir)?;
    let run_id = run_id_at(clock.now());
    persist_resolved(&loaded)?;

    let mut seen_ids = BTreeSet::new();
    let mut batches = Vec::new();
    for round in 0..num_batches {
        let proposals = generator.ask(batch_size);
        if proposals.is_empty() {
            info!(round, "generator exhausted");
            break;
        }
        validate_payloads(&proposals)?;
        for p in &proposals {
            if !seen_ids.insert(p.id.clone()) {
                return Err(anyhow!("config id '{}' was proposed twice", p.id));
            }
        }
        persist_payloads(&loaded.configs_dir(), &proposals)?;
        let descriptors = expand_descriptors(&loaded, &proposals);
        info!(round, proposals = proposals.len(), jobs = descriptors.len(), "search round");

        let mut config = scheduler_config(&loaded);
        config.discipline = Discipline::Sync {
            batch_size: loaded
                .config
                .design
                .batch_size
                .unwrap_or(loaded.config.design.max_concurrent),
        };
        let scheduler = Scheduler::new(config, backends.clone(), clock.clone())
            .with_cancellation(options.cancel.clone());
        let outcome = scheduler.run(descriptors)?;
        generator.tell(&outcome.per_evaluation);
        let cancelled = outcome.cancelled;
        batches.push(outcome);
        if cancelled {
            break;
        }
    }

    let rounds: Vec<_> = batches
        .iter()
        .map(|o| json!({ "evaluations": o.per_evaluation, "jobs": o.jobs }))
        .collect();
    let summary = json!({
        "schema_version": "run_summary_v1",
        "run_id": run_id,
        "experiment_id": loaded.config.experiment.id,
        "completed_at": clock.now().to_rfc3339(),
        "success": batches.iter().all(RunOutcome::is_success),
        "cancelled": batches.iter().any(|o| o.cancelled),
        "rounds": rounds,
    });
    atomic_write_json_pretty(&logs_dir.join("run_summary.json"), &summary)?;

    Ok(SearchResult {
        run_id,
        experiment_dir: loaded.experiment_dir,
        logs_dir,
        batches,
    })
}

pub fn describe_experiment(path: &Path) -> Result<ExperimentSummary> {
    describe_experiment_with_options(path, &RunOptions::default())
}

pub fn describe_experiment_with_options(
    path: &Path,
    options: &RunOptions,
) -> Result<ExperimentSummary> {
    let loaded = load_with_options(path, options)?;
    let config = &loaded.config;
    let logs_dir = loaded.logs_dir();
    let total_jobs = config.configs.len() * config.design.seeds;
    let num_batches = match config.design.mode {
        Mode::Sync => {
            let b = config.design.batch_size.unwrap_or(config.design.max_concurrent);
            total_jobs.div_ceil(b)
        }
        Mode::Async => usize::from(total_jobs > 0),
    };
    let command_preview = expand_descriptors(&loaded, &config.configs)
        .first()
        .map(JobDescriptor::command_line)
        .unwrap_or_default();
    let (existing_seed_artifacts, existing_bundles) = count_existing_artifacts(&logs_dir);

    Ok(ExperimentSummary {
        experiment_id: config.experiment.id.clone(),
        experiment_dir: loaded.experiment_dir.clone(),
        logs_dir,
        backend: config.runtime.backend,
        mode: config.design.mode,
        max_concurrent: config.design.max_concurrent,
        batch_size: config.design.batch_size,
        config_count: config.configs.len(),
        seeds_per_config: config.design.seeds,
        total_jobs,
        num_batches,
        command_preview,
        existing_seed_artifacts,
        existing_bundles,
    })
}

fn load_with_options(path: &Path, options: &RunOptions) -> Result<LoadedConfig> {
    let mut loaded = load_config(path)?;
    apply_run_options(&mut loaded.config, options)?;
    Ok(loaded)
}

fn apply_run_options(config: &mut SweepConfig, options: &RunOptions) -> Result<()> {
    if let Some(backend) = options.backend {
        config.runtime.backend = backend;
    }
    if let Some(mode) = options.mode {
        config.design.mode = mode;
    }
    if let Some(c) = options.max_concurrent {
        config.design.max_concurrent = c;
    }
    if let Some(b) = options.batch_size {
        config.design.batch_size = Some(b);
    }
    if let Some(secs) = options.poll_interval_secs {
        config.design.poll_interval_secs = secs;
    }
    config.validate()?;
    Ok(())
}

fn run_id_at(now: DateTime<Utc>) -> String {
    format!("run_{}", now.format("%Y%m%d_%H%M%S"))
}

fn persist_resolved(loaded: &LoadedConfig) -> Result<()> {
    let logs_dir = loaded.logs_dir();
    let resolved = serde_json::to_value(&loaded.config)?;
    atomic_write_json_pretty(&logs_dir.join("resolved_experiment.json"), &resolved)?;
    atomic_write_bytes(
        &logs_dir.join("resolved_experiment.digest"),
        canonical_json_digest(&resolved).as_bytes(),
    )?;
    Ok(())
}

/// Write each payload's params where its jobs read them via `--config`.
fn persist_payloads(configs_dir: &Path, payloads: &[ConfigPayload]) -> Result<()> {
    ensure_dir(configs_dir)?;
    for payload in payloads {
        atomic_write_json_pretty(&config_path(configs_dir, &payload.id), &payload.params)?;
    }
    Ok(())
}

fn config_path(configs_dir: &Path, config_id: &str) -> PathBuf {
    configs_dir.join(format!("{}.json", config_id))
}

/// Configuration-major expansion: every seed of the first payload, then
/// every seed of the next.
fn expand_descriptors(loaded: &LoadedConfig, payloads: &[ConfigPayload]) -> Vec<JobDescriptor> {
    let config = &loaded.config;
    let logs_dir = loaded.logs_dir();
    let configs_dir = loaded.configs_dir();
    let mut out = Vec::with_capacity(payloads.len() * config.design.seeds);
    for payload in payloads {
        for offset in 0..config.design.seeds as u64 {
            out.push(JobDescriptor {
                experiment_id: config.experiment.id.clone(),
                backend_kind: config.runtime.backend,
                executable: config.experiment.executable.clone(),
                config_id: payload.id.clone(),
                config_path: config_path(&configs_dir, &payload.id),
                seed: config.design.base_seed + offset,
                resource_request: config.runtime.resources.clone(),
                argument_overrides: payload.args.clone(),
                output_dir: group_dir(&logs_dir, &payload.id),
                work_dir: loaded.experiment_dir.clone(),
            });
        }
    }
    out
}

fn scheduler_config(loaded: &LoadedConfig) -> SchedulerConfig {
    let design = &loaded.config.design;
    let aggregation = &loaded.config.aggregation;
    let discipline = match design.mode {
        Mode::Sync => Discipline::Sync {
            batch_size: design.batch_size.unwrap_or(design.max_concurrent),
        },
        Mode::Async => Discipline::Async,
    };
    let mut config = SchedulerConfig::new(discipline, design.max_concurrent, loaded.logs_dir());
    config.poll_interval = Duration::from_secs(design.poll_interval_secs);
    config.submit_retry = SubmitRetryPolicy {
        max_attempts: design.submit_attempts,
        backoff: Duration::from_secs(design.submit_backoff_secs),
    };
    config.aggregation = AggregationPolicy {
        retry_delay: Duration::from_secs(aggregation.retry_delay_secs),
        max_attempts: aggregation.max_attempts,
        cleanup_seed_artifacts: aggregation.cleanup_seed_artifacts,
    };
    config
}

/// Seed artifacts and bundles left in the logs dir by earlier runs.
fn count_existing_artifacts(logs_dir: &Path) -> (usize, usize) {
    let mut seeds = 0;
    let mut bundles = 0;
    for entry in WalkDir::new(logs_dir)
        .min_depth(1)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let name = entry.file_name().to_string_lossy();
        if entry.depth() == 1 && name.ends_with(".bundle.json") {
            bundles += 1;
        } else if entry.depth() == 2 && name.starts_with("seed_") && name.ends_with(".json") {
            seeds += 1;
        }
    }
    (seeds, bundles)
}
