//! The work-queue driver.
//!
//! A run is a sequence of ticks. Each tick handles cancellation, sweeps every
//! active job once in insertion order, admits queued jobs while fewer than
//! `max_concurrent` are active, then tries to aggregate every evaluation
//! group whose members are all terminal. Between ticks the loop sleeps on
//! the injected [`Clock`].

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sweep_analysis::{aggregate_group, group_dir, AggregateOptions, ResultBundle};
use sweep_core::{JobDescriptor, JobState, Result, SweepError};
use tracing::{debug, info, warn};

use crate::backend::{BackendSet, PollStatus};
use crate::clock::{CancellationToken, Clock};
use crate::job::{Job, JobRecord};
use crate::queue::{QueueCounts, WorkQueue};

const CANCELLED: &str = "cancelled before completion";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Discipline {
    /// Batches of `batch_size` jobs; batch `i + 1` starts only once every
    /// job of batch `i` is terminal.
    Sync { batch_size: usize },
    /// Refill each freed slot with the next queued job.
    Async,
}

/// Retry for rejected submissions. One attempt means no retry.
#[derive(Debug, Clone)]
pub struct SubmitRetryPolicy {
    pub max_attempts: u32,
    /// Delay after the first rejection; doubles for every further one.
    pub backoff: Duration,
}

impl Default for SubmitRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_secs(10),
        }
    }
}

impl SubmitRetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1u32 << exponent)
    }
}

#[derive(Debug, Clone)]
pub struct AggregationPolicy {
    pub retry_delay: Duration,
    /// Attempts before a group with missing seed artifacts is given up on.
    pub max_attempts: u32,
    pub cleanup_seed_artifacts: bool,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(2),
            max_attempts: 60,
            cleanup_seed_artifacts: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub discipline: Discipline,
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    pub submit_retry: SubmitRetryPolicy,
    pub aggregation: AggregationPolicy,
    /// Where seed artifacts are read from and bundles are written.
    pub logs_dir: PathBuf,
}

impl SchedulerConfig {
    pub fn new(discipline: Discipline, max_concurrent: usize, logs_dir: PathBuf) -> Self {
        Self {
            discipline,
            max_concurrent,
            poll_interval: Duration::from_secs(5),
            submit_retry: SubmitRetryPolicy::default(),
            aggregation: AggregationPolicy::default(),
            logs_dir,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(SweepError::config("max_concurrent must be at least 1"));
        }
        if let Discipline::Sync { batch_size: 0 } = self.discipline {
            return Err(SweepError::config("batch_size must be at least 1"));
        }
        if self.submit_retry.max_attempts == 0 {
            return Err(SweepError::config("submit attempts must be at least 1"));
        }
        if self.aggregation.max_attempts == 0 {
            return Err(SweepError::config("aggregation attempts must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    JobFailed,
    Cancelled,
    ArtifactsIncomplete,
    Aggregation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub config_id: String,
    pub reason: FailureReason,
    pub failed_seeds: Vec<u64>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EvaluationResult {
    Bundle {
        path: PathBuf,
        #[serde(skip_serializing)]
        bundle: ResultBundle,
    },
    Failure(FailureRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationOutcome {
    pub config_id: String,
    pub seeds: Vec<u64>,
    pub result: EvaluationResult,
}

impl EvaluationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.result, EvaluationResult::Bundle { .. })
    }

    pub fn bundle(&self) -> Option<&ResultBundle> {
        match &self.result {
            EvaluationResult::Bundle { bundle, .. } => Some(bundle),
            EvaluationResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureRecord> {
        match &self.result {
            EvaluationResult::Failure(record) => Some(record),
            EvaluationResult::Bundle { .. } => None,
        }
    }
}

/// Queue counters as observed at the end of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TickSample {
    pub tick: u64,
    pub at: DateTime<Utc>,
    pub num_queued: usize,
    pub num_running: usize,
    pub num_completed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    /// One entry per evaluation group, in order of first appearance.
    pub per_evaluation: Vec<EvaluationOutcome>,
    pub jobs: Vec<JobRecord>,
    pub ticks: Vec<TickSample>,
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn failures(&self) -> impl Iterator<Item = &FailureRecord> {
        self.per_evaluation.iter().filter_map(|e| e.failure())
    }

    pub fn is_success(&self) -> bool {
        self.per_evaluation.iter().all(|e| e.is_success())
    }
}

struct Group {
    config_id: String,
    seeds: Vec<u64>,
    members: Vec<usize>,
    aggregation_attempts: u32,
    next_attempt_at: Option<DateTime<Utc>>,
    result: Option<EvaluationResult>,
}

struct RunState {
    queue: WorkQueue,
    groups: Vec<Group>,
    windows: Vec<Range<usize>>,
    window: usize,
    ticks: Vec<TickSample>,
    cancelled: bool,
}

impl RunState {
    fn is_finished(&self) -> bool {
        self.queue.all_terminal() && self.groups.iter().all(|g| g.result.is_some())
    }

    fn into_outcome(self) -> RunOutcome {
        let jobs = self.queue.jobs().iter().map(Job::record).collect();
        let per_evaluation = self
            .groups
            .into_iter()
            .map(|g| {
                let result = g.result.unwrap_or_else(|| {
                    EvaluationResult::Failure(FailureRecord {
                        config_id: g.config_id.clone(),
                        reason: FailureReason::Aggregation,
                        failed_seeds: Vec::new(),
                        message: "group never resolved".to_string(),
                    })
                });
                EvaluationOutcome {
                    config_id: g.config_id,
                    seeds: g.seeds,
                    result,
                }
            })
            .collect();
        RunOutcome {
            per_evaluation,
            jobs,
            ticks: self.ticks,
            cancelled: self.cancelled,
        }
    }
}

/// Admission windows in submission order. Async mode has one window over
/// every job; sync mode splits each batch into chunks of at most
/// `max_concurrent` so a batch larger than the bound is sub-batched.
pub fn admission_windows(
    total: usize,
    discipline: Discipline,
    max_concurrent: usize,
) -> Vec<Range<usize>> {
    let batch_size = match discipline {
        Discipline::Async => return vec![0..total],
        Discipline::Sync { batch_size } => batch_size.max(1),
    };
    let chunk = max_concurrent.max(1);
    let mut windows = Vec::new();
    let mut start = 0;
    while start < total {
        let batch_end = (start + batch_size).min(total);
        let mut s = start;
        while s < batch_end {
            let e = (s + chunk).min(batch_end);
            windows.push(s..e);
            s = e;
        }
        start = batch_end;
    }
    windows
}

pub struct Scheduler {
    config: SchedulerConfig,
    backends: BackendSet,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, backends: BackendSet, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            backends,
            clock,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Drive every descriptor to a terminal state and resolve each
    /// evaluation group to a bundle or a failure record.
    ///
    /// Only configuration errors abort; they are raised before anything is
    /// submitted.
    pub fn run(&self, descriptors: Vec<JobDescriptor>) -> Result<RunOutcome> {
        self.config.validate()?;
        let mut run = self.prepare(descriptors)?;
        info!(
            jobs = run.queue.len(),
            groups = run.groups.len(),
            discipline = ?self.config.discipline,
            max_concurrent = self.config.max_concurrent,
            "starting run"
        );

        let mut tick: u64 = 0;
        loop {
            self.tick(&mut run, tick)?;
            if run.is_finished() {
                break;
            }
            let pause = if run.queue.all_terminal() {
                self.config.aggregation.retry_delay
            } else {
                self.config.poll_interval
            };
            self.clock.sleep(pause);
            tick += 1;
        }

        let outcome = run.into_outcome();
        info!(
            ticks = outcome.ticks.len(),
            evaluations = outcome.per_evaluation.len(),
            failures = outcome.failures().count(),
            cancelled = outcome.cancelled,
            "run finished"
        );
        Ok(outcome)
    }

    /// Resolve each descriptor's backend once and fill its resource
    /// defaults. Any configuration problem surfaces here.
    fn prepare(&self, descriptors: Vec<JobDescriptor>) -> Result<RunState> {
        let mut seen = BTreeSet::new();
        let mut jobs = Vec::with_capacity(descriptors.len());
        for (idx, descriptor) in descriptors.into_iter().enumerate() {
            if !seen.insert(descriptor.id()) {
                return Err(SweepError::config(format!(
                    "duplicate job {}",
                    descriptor.id()
                )));
            }
            let backend = self.backends.get(descriptor.backend_kind)?;
            let filled = backend.check_and_fill_defaults(&descriptor.resource_request)?;
            let batch = match self.config.discipline {
                Discipline::Sync { batch_size } => idx / batch_size,
                Discipline::Async => 0,
            };
            jobs.push(Job::new(descriptor.with_resources(filled), backend, batch));
        }

        let mut groups: Vec<Group> = Vec::new();
        let mut by_config: BTreeMap<String, usize> = BTreeMap::new();
        for (idx, job) in jobs.iter().enumerate() {
            let d = job.descriptor();
            let slot = *by_config.entry(d.config_id.clone()).or_insert_with(|| {
                groups.push(Group {
                    config_id: d.config_id.clone(),
                    seeds: Vec::new(),
                    members: Vec::new(),
                    aggregation_attempts: 0,
                    next_attempt_at: None,
                    result: None,
                });
                groups.len() - 1
            });
            groups[slot].seeds.push(d.seed);
            groups[slot].members.push(idx);
        }

        let windows = admission_windows(
            jobs.len(),
            self.config.discipline,
            self.config.max_concurrent,
        );
        Ok(RunState {
            queue: WorkQueue::new(jobs),
            groups,
            windows,
            window: 0,
            ticks: Vec::new(),
            cancelled: false,
        })
    }

    fn tick(&self, run: &mut RunState, tick: u64) -> Result<()> {
        let now = self.clock.now();
        if self.cancel.is_cancelled() && !run.cancelled {
            self.cancel_all(run, now)?;
        }
        self.poll_sweep(run, now)?;
        if !run.cancelled {
            self.admit(run, now)?;
        }
        self.check_groups(run, now);

        let QueueCounts {
            num_queued,
            num_running,
            num_completed,
            ..
        } = run.queue.counts();
        debug!(tick, num_queued, num_running, num_completed, "tick");
        run.ticks.push(TickSample {
            tick,
            at: now,
            num_queued,
            num_running,
            num_completed,
        });
        Ok(())
    }

    fn cancel_all(&self, run: &mut RunState, now: DateTime<Utc>) -> Result<()> {
        warn!(
            running = run.queue.counts().num_running,
            queued = run.queue.counts().num_queued,
            "cancellation requested; stopping jobs"
        );
        for idx in run.queue.active_indices() {
            run.queue.job(idx).terminate();
            run.queue.job_mut(idx).error = Some(CANCELLED.to_string());
            run.queue.finish(idx, JobState::Failed, now)?;
            run.queue.job_mut(idx).cleanup();
        }
        for idx in run.queue.queued_indices() {
            run.queue.job_mut(idx).error = Some(CANCELLED.to_string());
            run.queue.transition(idx, JobState::Failed, now)?;
        }
        run.cancelled = true;
        Ok(())
    }

    fn poll_sweep(&self, run: &mut RunState, now: DateTime<Utc>) -> Result<()> {
        for idx in run.queue.active_indices() {
            let job = run.queue.job(idx);
            let id = job.id();
            let Some(result) = job.poll() else {
                continue;
            };
            match result {
                Ok(PollStatus::Running) => {
                    if job.state() == JobState::Submitted {
                        debug!(job = %id, "running");
                        run.queue.transition(idx, JobState::Running, now)?;
                    }
                }
                Ok(PollStatus::Succeeded) => {
                    info!(job = %id, "succeeded");
                    run.queue.finish(idx, JobState::Succeeded, now)?;
                    run.queue.job_mut(idx).cleanup();
                }
                Ok(PollStatus::Failed) => {
                    warn!(job = %id, "failed");
                    run.queue.job_mut(idx).error = Some("job exited unsuccessfully".to_string());
                    run.queue.finish(idx, JobState::Failed, now)?;
                    run.queue.job_mut(idx).cleanup();
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(job = %id, error = %e, "status query failed; retrying next tick"),
            }
        }
        Ok(())
    }

    fn admit(&self, run: &mut RunState, now: DateTime<Utc>) -> Result<()> {
        while run.window + 1 < run.windows.len()
            && run.queue.range_terminal(run.windows[run.window].clone())
        {
            run.window += 1;
            let next = &run.windows[run.window];
            info!(
                window = run.window,
                batch = run.queue.job(next.start).batch,
                jobs = next.len(),
                "previous window terminal; advancing"
            );
        }
        let Some(range) = run.windows.get(run.window).cloned() else {
            return Ok(());
        };
        while run.queue.counts().num_running < self.config.max_concurrent {
            let Some(idx) = run.queue.next_admissible(range.clone(), now) else {
                break;
            };
            self.submit(run, idx, now)?;
        }
        Ok(())
    }

    fn submit(&self, run: &mut RunState, idx: usize, now: DateTime<Utc>) -> Result<()> {
        let job = run.queue.job_mut(idx);
        let id = job.id();
        let backend = job.backend_kind();
        let dir = group_dir(&self.config.logs_dir, &job.descriptor().config_id);
        match job.submit(&dir) {
            Ok(handle) => {
                info!(job = %id, %backend, %handle, attempt = job.attempts, "submitted");
                job.handle = Some(handle);
                run.queue.transition(idx, JobState::Submitted, now)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                let policy = &self.config.submit_retry;
                if job.attempts < policy.max_attempts {
                    let delay = policy.delay_after(job.attempts);
                    let step = chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    job.retry_at = Some(now + step);
                    warn!(
                        job = %id,
                        %backend,
                        attempt = job.attempts,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "submission rejected; will retry"
                    );
                    Ok(())
                } else {
                    warn!(job = %id, %backend, attempt = job.attempts, error = %e, "submission failed");
                    job.error = Some(e.to_string());
                    run.queue.transition(idx, JobState::Failed, now)
                }
            }
        }
    }

    fn check_groups(&self, run: &mut RunState, now: DateTime<Utc>) {
        let policy = &self.config.aggregation;
        let options = AggregateOptions {
            cleanup_seed_artifacts: policy.cleanup_seed_artifacts,
        };
        for group in run.groups.iter_mut().filter(|g| g.result.is_none()) {
            let members: Vec<&Job> = group.members.iter().map(|&i| run.queue.job(i)).collect();
            if !members.iter().all(|j| j.state().is_terminal()) {
                continue;
            }

            let failed: Vec<&Job> = members
                .iter()
                .copied()
                .filter(|j| j.state() == JobState::Failed)
                .collect();
            if !failed.is_empty() {
                let cancelled = failed.iter().any(|j| j.error.as_deref() == Some(CANCELLED));
                let reason = if cancelled {
                    FailureReason::Cancelled
                } else {
                    FailureReason::JobFailed
                };
                let message = failed
                    .iter()
                    .map(|j| {
                        format!(
                            "{}: {}",
                            j.id(),
                            j.error.as_deref().unwrap_or("failed")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                warn!(config_id = %group.config_id, ?reason, failed = failed.len(), "evaluation failed");
                group.result = Some(EvaluationResult::Failure(FailureRecord {
                    config_id: group.config_id.clone(),
                    reason,
                    failed_seeds: failed.iter().map(|j| j.descriptor().seed).collect(),
                    message,
                }));
                continue;
            }

            if group.next_attempt_at.map(|at| now < at).unwrap_or(false) {
                continue;
            }
            match aggregate_group(&self.config.logs_dir, &group.config_id, &group.seeds, &options) {
                Ok(report) => {
                    group.result = Some(EvaluationResult::Bundle {
                        path: report.bundle_path,
                        bundle: report.bundle,
                    });
                }
                Err(e @ (SweepError::AggregationIncomplete { .. } | SweepError::Json(_))) => {
                    group.aggregation_attempts += 1;
                    if group.aggregation_attempts >= policy.max_attempts {
                        warn!(
                            config_id = %group.config_id,
                            attempts = group.aggregation_attempts,
                            error = %e,
                            "seed artifacts never completed"
                        );
                        group.result = Some(EvaluationResult::Failure(FailureRecord {
                            config_id: group.config_id.clone(),
                            reason: FailureReason::ArtifactsIncomplete,
                            failed_seeds: Vec::new(),
                            message: e.to_string(),
                        }));
                    } else {
                        let step = chrono::Duration::from_std(policy.retry_delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                        group.next_attempt_at = Some(now + step);
                        debug!(
                            config_id = %group.config_id,
                            attempt = group.aggregation_attempts,
                            error = %e,
                            "deferring aggregation"
                        );
                    }
                }
                Err(e) => {
                    warn!(config_id = %group.config_id, error = %e, "aggregation failed");
                    group.result = Some(EvaluationResult::Failure(FailureRecord {
                        config_id: group.config_id.clone(),
                        reason: FailureReason::Aggregation,
                        failed_seeds: Vec::new(),
                        message: e.to_string(),
                    }));
                }
            }
        }
    }
}
