use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sweep_analysis::{bundle_path, load_seed_artifact, write_seed_artifact, SeedArtifact};
use sweep_core::{
    BackendKind, JobDescriptor, JobHandle, JobState, ResourceRequest, Result, SweepError,
};
use sweep_runner::{
    Backend, BackendSet, CancellationToken, Clock, Discipline, FailureReason, ManualClock,
    PollStatus, RunOutcome, Scheduler, SchedulerConfig, SubmitRetryPolicy,
};

#[derive(Debug, Clone)]
struct Plan {
    /// Poll on which the outcome is reported; earlier polls say `Running`.
    polls: u32,
    outcome: PollStatus,
    /// Submissions rejected before one is accepted.
    rejects: u32,
    write_artifact: bool,
    transient_errors: u32,
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            polls: 1,
            outcome: PollStatus::Succeeded,
            rejects: 0,
            write_artifact: true,
            transient_errors: 0,
        }
    }
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    submits: HashMap<String, u32>,
    polls: HashMap<String, u32>,
    terminated: Vec<String>,
    cleaned: Vec<String>,
}

/// Stands in for a cluster: jobs finish after a planned number of polls and
/// leave a seed artifact the way the training program would.
#[derive(Default)]
struct FakeBackend {
    plans: HashMap<String, Plan>,
    state: Mutex<FakeState>,
}

fn key(job: &JobDescriptor) -> String {
    job.id().to_string()
}

impl FakeBackend {
    fn plan(mut self, job: &str, plan: Plan) -> Self {
        self.plans.insert(job.to_string(), plan);
        self
    }

    fn plan_for(&self, job: &JobDescriptor) -> Plan {
        self.plans.get(&key(job)).cloned().unwrap_or_default()
    }

    fn submits(&self, job: &str) -> u32 {
        self.state.lock().unwrap().submits.get(job).copied().unwrap_or(0)
    }
}

fn artifact(seed: u64) -> SeedArtifact {
    let mut metrics = BTreeMap::new();
    metrics.insert("loss".to_string(), vec![1.0, 0.5, 0.25]);
    metrics.insert("accuracy".to_string(), vec![0.5, 0.75, 0.9]);
    SeedArtifact { seed, metrics }
}

impl Backend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn check_and_fill_defaults(&self, request: &ResourceRequest) -> Result<ResourceRequest> {
        if request.queue.as_deref() == Some("missing") {
            return Err(SweepError::config("queue 'missing' does not exist"));
        }
        let mut filled = request.clone();
        filled.cores.get_or_insert(1);
        Ok(filled)
    }

    fn submit(&self, job: &JobDescriptor) -> Result<JobHandle> {
        let plan = self.plan_for(job);
        let mut state = self.state.lock().unwrap();
        let count = state.submits.entry(key(job)).or_insert(0);
        *count += 1;
        if *count <= plan.rejects {
            return Err(SweepError::Submission {
                job: key(job),
                message: "queue rejected the job".to_string(),
            });
        }
        state.next_id += 1;
        Ok(JobHandle::Queue {
            job_id: state.next_id.to_string(),
        })
    }

    fn poll(&self, _handle: &JobHandle, job: &JobDescriptor) -> Result<PollStatus> {
        let plan = self.plan_for(job);
        let seen = {
            let mut state = self.state.lock().unwrap();
            let seen = state.polls.entry(key(job)).or_insert(0);
            *seen += 1;
            *seen
        };
        if seen <= plan.transient_errors {
            return Err(SweepError::TransientPoll("squeue timed out".to_string()));
        }
        if seen - plan.transient_errors < plan.polls {
            return Ok(PollStatus::Running);
        }
        if plan.outcome == PollStatus::Succeeded && plan.write_artifact {
            write_seed_artifact(&job.output_dir, &artifact(job.seed))?;
        }
        Ok(plan.outcome)
    }

    fn terminate(&self, _handle: &JobHandle, job: &JobDescriptor) -> Result<()> {
        self.state.lock().unwrap().terminated.push(key(job));
        Ok(())
    }

    fn cleanup(&self, _handle: &JobHandle, job: &JobDescriptor) -> Result<()> {
        self.state.lock().unwrap().cleaned.push(key(job));
        Ok(())
    }
}

/// Manual clock that runs a callback before a given sleep returns.
struct HookClock {
    inner: ManualClock,
    sleeps: AtomicUsize,
    at: usize,
    hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl HookClock {
    fn new(at: usize, hook: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: ManualClock::default(),
            sleeps: AtomicUsize::new(0),
            at,
            hook: Mutex::new(Some(Box::new(hook))),
        }
    }
}

impl Clock for HookClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.now()
    }

    fn sleep(&self, duration: Duration) {
        self.inner.sleep(duration);
        let n = self.sleeps.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.at {
            if let Some(hook) = self.hook.lock().unwrap().take() {
                hook();
            }
        }
    }
}

fn descriptor(root: &Path, config_id: &str, seed: u64) -> JobDescriptor {
    JobDescriptor {
        experiment_id: "scenario".to_string(),
        backend_kind: BackendKind::Local,
        executable: vec!["train".to_string()],
        config_id: config_id.to_string(),
        config_path: root.join("configs").join(format!("{}.json", config_id)),
        seed,
        resource_request: ResourceRequest::default(),
        argument_overrides: BTreeMap::new(),
        output_dir: logs(root).join(config_id),
        work_dir: root.to_path_buf(),
    }
}

fn logs(root: &Path) -> PathBuf {
    root.join("logs")
}

fn run(
    backend: Arc<FakeBackend>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    descriptors: Vec<JobDescriptor>,
) -> RunOutcome {
    Scheduler::new(config, BackendSet::new().with(backend), clock)
        .run(descriptors)
        .expect("run")
}

fn assert_admission_bound(outcome: &RunOutcome, max_concurrent: usize) {
    for sample in &outcome.ticks {
        assert!(
            sample.num_running <= max_concurrent,
            "tick {} had {} running",
            sample.tick,
            sample.num_running
        );
        assert_eq!(
            sample.num_queued + sample.num_running + sample.num_completed,
            outcome.jobs.len()
        );
    }
}

fn record<'a>(outcome: &'a RunOutcome, config_id: &str, seed: u64) -> &'a sweep_runner::JobRecord {
    outcome
        .jobs
        .iter()
        .find(|j| j.config_id == config_id && j.seed == seed)
        .expect("job record")
}

#[test]
fn async_refill_keeps_two_running() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(
        FakeBackend::default()
            .plan("c1/seed_0", Plan { polls: 3, ..Plan::default() })
            .plan("c2/seed_0", Plan { polls: 2, ..Plan::default() })
            .plan("c3/seed_0", Plan { polls: 2, ..Plan::default() }),
    );
    let descriptors = (0..4)
        .map(|i| descriptor(root.path(), &format!("c{}", i), 0))
        .collect();
    let config = SchedulerConfig::new(Discipline::Async, 2, logs(root.path()));
    let outcome = run(
        backend.clone(),
        config,
        Arc::new(ManualClock::default()),
        descriptors,
    );

    let first = outcome.ticks[0];
    assert_eq!((first.num_running, first.num_queued), (2, 2));
    assert!(record(&outcome, "c2", 0).submitted_at > record(&outcome, "c0", 0).submitted_at);
    // c0 finishes on the first sweep; its slot goes to c2 in that same tick.
    assert_eq!(
        record(&outcome, "c2", 0).submitted_at,
        record(&outcome, "c0", 0).terminal_at
    );
    assert_admission_bound(&outcome, 2);

    let completed: Vec<usize> = outcome.ticks.iter().map(|t| t.num_completed).collect();
    assert!(completed.windows(2).all(|w| w[0] <= w[1]), "{:?}", completed);
    let (last, earlier) = completed.split_last().unwrap();
    assert_eq!(*last, 4);
    assert!(earlier.iter().all(|&c| c < 4), "{:?}", completed);

    assert!(outcome.is_success());
    assert_eq!(outcome.per_evaluation.len(), 4);
    assert_eq!(backend.state.lock().unwrap().cleaned.len(), 4);
}

#[test]
fn rejected_submission_fails_only_its_evaluation() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default().plan(
        "c1/seed_0",
        Plan {
            rejects: u32::MAX,
            ..Plan::default()
        },
    ));
    let descriptors = (0..4)
        .map(|i| descriptor(root.path(), &format!("c{}", i), 0))
        .collect();
    let config = SchedulerConfig::new(Discipline::Async, 2, logs(root.path()));
    let outcome = run(
        backend.clone(),
        config,
        Arc::new(ManualClock::default()),
        descriptors,
    );

    assert_eq!(backend.submits("c1/seed_0"), 1);
    let rejected = record(&outcome, "c1", 0);
    assert_eq!(rejected.state, JobState::Failed);
    assert_eq!(rejected.submitted_at, None);
    assert!(rejected.terminal_at.is_some());
    assert!(rejected.error.as_deref().unwrap().contains("queue rejected"));

    let failures: Vec<_> = outcome.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].config_id, "c1");
    assert_eq!(failures[0].reason, FailureReason::JobFailed);
    assert_eq!(failures[0].failed_seeds, vec![0]);
    assert_eq!(outcome.per_evaluation.iter().filter(|e| e.is_success()).count(), 3);
    assert_admission_bound(&outcome, 2);
}

#[test]
fn submission_retry_is_opt_in_with_backoff() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default().plan(
        "c0/seed_0",
        Plan {
            rejects: 2,
            ..Plan::default()
        },
    ));
    let mut config = SchedulerConfig::new(Discipline::Async, 1, logs(root.path()));
    config.submit_retry = SubmitRetryPolicy {
        max_attempts: 3,
        backoff: Duration::from_secs(5),
    };
    let outcome = run(
        backend.clone(),
        config,
        Arc::new(ManualClock::default()),
        vec![descriptor(root.path(), "c0", 0)],
    );

    assert!(outcome.is_success());
    let job = record(&outcome, "c0", 0);
    assert_eq!(job.attempts, 3);
    assert_eq!(backend.submits("c0/seed_0"), 3);
    // 5s then 10s of backoff before the accepted attempt.
    let start = DateTime::<Utc>::default();
    let waited = job.submitted_at.unwrap() - start;
    assert!(waited.num_seconds() >= 15, "submitted after {}s", waited.num_seconds());
}

#[test]
fn aggregation_waits_for_late_artifact() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default().plan(
        "cfg/seed_2",
        Plan {
            write_artifact: false,
            ..Plan::default()
        },
    ));
    let late_dir = logs(root.path()).join("cfg");
    let bundle = bundle_path(&logs(root.path()), "cfg");
    let deferred = Arc::new(AtomicBool::new(false));
    let hook = {
        let bundle = bundle.clone();
        let deferred = deferred.clone();
        move || {
            deferred.store(!bundle.exists(), Ordering::SeqCst);
            write_seed_artifact(&late_dir, &artifact(2)).unwrap();
        }
    };
    let clock = Arc::new(HookClock::new(4, hook));
    let config = SchedulerConfig::new(Discipline::Async, 3, logs(root.path()));
    let descriptors = (0..3).map(|s| descriptor(root.path(), "cfg", s)).collect();
    let outcome = run(backend, config, clock, descriptors);

    assert!(deferred.load(Ordering::SeqCst), "bundle written before all seeds");
    assert!(outcome.is_success(), "{:?}", outcome.per_evaluation);
    assert!(outcome.ticks.len() >= 5);
    let result = outcome.per_evaluation[0].bundle().unwrap();
    assert_eq!(result.seeds, vec![0, 1, 2]);
    assert_eq!(result.metrics["loss"].mean, vec![1.0, 0.5, 0.25]);
    assert!(result.metrics["loss"].std.iter().all(|&s| s == 0.0));
    assert!(bundle.is_file());
}

#[test]
fn missing_artifacts_give_up_after_max_attempts() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default().plan(
        "cfg/seed_1",
        Plan {
            write_artifact: false,
            ..Plan::default()
        },
    ));
    let mut config = SchedulerConfig::new(Discipline::Async, 2, logs(root.path()));
    config.aggregation.max_attempts = 3;
    let descriptors = (0..2).map(|s| descriptor(root.path(), "cfg", s)).collect();
    let outcome = run(
        backend,
        config,
        Arc::new(ManualClock::default()),
        descriptors,
    );

    let failure = outcome.per_evaluation[0].failure().expect("failure");
    assert_eq!(failure.reason, FailureReason::ArtifactsIncomplete);
    assert!(failure.message.contains("expected 2"), "{}", failure.message);
    assert!(!bundle_path(&logs(root.path()), "cfg").exists());
}

#[test]
fn seed_files_from_an_earlier_run_are_not_aggregated() {
    let root = tempfile::tempdir().unwrap();
    let group = logs(root.path()).join("cfg");
    for seed in 0..2 {
        let stale = SeedArtifact {
            seed,
            metrics: [("loss".to_string(), vec![999.0])].into_iter().collect(),
        };
        write_seed_artifact(&group, &stale).unwrap();
    }
    let backend = Arc::new(FakeBackend::default().plan(
        "cfg/seed_1",
        Plan {
            write_artifact: false,
            ..Plan::default()
        },
    ));
    let mut config = SchedulerConfig::new(Discipline::Async, 2, logs(root.path()));
    config.aggregation.max_attempts = 3;
    let descriptors = (0..2).map(|s| descriptor(root.path(), "cfg", s)).collect();
    let outcome = run(
        backend,
        config,
        Arc::new(ManualClock::default()),
        descriptors,
    );

    let failure = outcome.per_evaluation[0].failure().expect("failure");
    assert_eq!(failure.reason, FailureReason::ArtifactsIncomplete);
    assert!(!group.join("seed_1.json").exists());
    let fresh = load_seed_artifact(&group.join("seed_0.json")).unwrap();
    assert_eq!(fresh.metrics["loss"], vec![1.0, 0.5, 0.25]);
}

#[test]
fn sync_batches_never_overlap() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(
        FakeBackend::default()
            .plan("a/seed_0", Plan { polls: 4, ..Plan::default() })
            .plan("b/seed_1", Plan { polls: 3, ..Plan::default() })
            .plan("c/seed_0", Plan { polls: 2, ..Plan::default() }),
    );
    let descriptors = ["a", "b", "c"]
        .iter()
        .flat_map(|c| (0..2).map(move |s| (*c, s)))
        .map(|(c, s)| descriptor(root.path(), c, s))
        .collect();
    let config = SchedulerConfig::new(Discipline::Sync { batch_size: 2 }, 4, logs(root.path()));
    let outcome = run(
        backend,
        config,
        Arc::new(ManualClock::default()),
        descriptors,
    );

    assert!(outcome.is_success());
    assert_admission_bound(&outcome, 2);
    for batch in 1..3 {
        let prev_done = outcome
            .jobs
            .iter()
            .filter(|j| j.batch == batch - 1)
            .map(|j| j.terminal_at.unwrap())
            .max()
            .unwrap();
        let next_start = outcome
            .jobs
            .iter()
            .filter(|j| j.batch == batch)
            .map(|j| j.submitted_at.unwrap())
            .min()
            .unwrap();
        assert!(next_start >= prev_done, "batch {} started early", batch);
    }
}

#[test]
fn sync_batch_larger_than_bound_is_sub_batched() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default().plan(
        "g/seed_0",
        Plan {
            polls: 5,
            ..Plan::default()
        },
    ));
    let descriptors = (0..4).map(|s| descriptor(root.path(), "g", s)).collect();
    let config = SchedulerConfig::new(Discipline::Sync { batch_size: 4 }, 2, logs(root.path()));
    let outcome = run(
        backend,
        config,
        Arc::new(ManualClock::default()),
        descriptors,
    );

    assert!(outcome.is_success());
    assert_admission_bound(&outcome, 2);
    // seed 1 finishes early but seed 2 waits for the whole first chunk.
    assert!(record(&outcome, "g", 2).submitted_at >= record(&outcome, "g", 0).terminal_at);
}

#[test]
fn failed_exit_and_transient_queries() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(
        FakeBackend::default()
            .plan(
                "bad/seed_0",
                Plan {
                    outcome: PollStatus::Failed,
                    ..Plan::default()
                },
            )
            .plan(
                "flaky/seed_0",
                Plan {
                    transient_errors: 3,
                    ..Plan::default()
                },
            ),
    );
    let descriptors = vec![
        descriptor(root.path(), "bad", 0),
        descriptor(root.path(), "bad", 1),
        descriptor(root.path(), "flaky", 0),
    ];
    let config = SchedulerConfig::new(Discipline::Async, 3, logs(root.path()));
    let outcome = run(
        backend,
        config,
        Arc::new(ManualClock::default()),
        descriptors,
    );

    let bad = outcome.per_evaluation[0].failure().expect("bad fails");
    assert_eq!(bad.reason, FailureReason::JobFailed);
    assert_eq!(bad.failed_seeds, vec![0]);
    assert!(!bundle_path(&logs(root.path()), "bad").exists());
    assert!(outcome.per_evaluation[1].is_success());
    assert_eq!(record(&outcome, "flaky", 0).state, JobState::Succeeded);
}

#[test]
fn cancellation_stops_running_and_queued_jobs() {
    let root = tempfile::tempdir().unwrap();
    let slow = Plan {
        polls: 1000,
        ..Plan::default()
    };
    let backend = Arc::new(
        FakeBackend::default()
            .plan("c0/seed_0", slow.clone())
            .plan("c1/seed_0", slow.clone())
            .plan("c2/seed_0", slow),
    );
    let token = CancellationToken::new();
    let clock = {
        let token = token.clone();
        Arc::new(HookClock::new(2, move || token.cancel()))
    };
    let descriptors = (0..3)
        .map(|i| descriptor(root.path(), &format!("c{}", i), 0))
        .collect();
    let config = SchedulerConfig::new(Discipline::Async, 2, logs(root.path()));
    let outcome = Scheduler::new(config, BackendSet::new().with(backend.clone()), clock)
        .with_cancellation(token)
        .run(descriptors)
        .expect("run");

    assert!(outcome.cancelled);
    assert_eq!(outcome.ticks.len(), 3);
    assert!(outcome.jobs.iter().all(|j| j.state == JobState::Failed));
    assert!(outcome
        .failures()
        .all(|f| f.reason == FailureReason::Cancelled));
    let state = backend.state.lock().unwrap();
    assert_eq!(state.terminated, vec!["c0/seed_0", "c1/seed_0"]);
    assert_eq!(backend_submits(&state, "c2/seed_0"), 0);
}

fn backend_submits(state: &FakeState, job: &str) -> u32 {
    state.submits.get(job).copied().unwrap_or(0)
}

#[test]
fn configuration_errors_abort_before_submission() {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let mut bad = descriptor(root.path(), "c1", 0);
    bad.resource_request.queue = Some("missing".to_string());
    let descriptors = vec![descriptor(root.path(), "c0", 0), bad];
    let config = SchedulerConfig::new(Discipline::Async, 2, logs(root.path()));
    let err = Scheduler::new(
        config,
        BackendSet::new().with(backend.clone()),
        Arc::new(ManualClock::default()),
    )
    .run(descriptors)
    .unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(backend.submits("c0/seed_0"), 0);

    let mut cloud = descriptor(root.path(), "c2", 0);
    cloud.backend_kind = BackendKind::CloudVm;
    let config = SchedulerConfig::new(Discipline::Async, 2, logs(root.path()));
    let err = Scheduler::new(
        config,
        BackendSet::new().with(backend),
        Arc::new(ManualClock::default()),
    )
    .run(vec![cloud])
    .unwrap_err();
    assert!(err.is_fatal(), "{}", err);
}
