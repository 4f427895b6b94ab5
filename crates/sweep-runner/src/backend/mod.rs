//! Uniform submit/poll/terminate/cleanup contract over each execution target.

mod cloud;
mod local;
mod sge;
mod slurm;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sweep_core::{BackendKind, JobDescriptor, JobHandle, ResourceRequest, Result, SweepError};
use tracing::{debug, warn};

pub use cloud::{CloudVmBackend, CloudVmSettings};
pub use local::LocalBackend;
pub use sge::SgeBackend;
pub use slurm::SlurmBackend;

use crate::clock::{Clock, SystemClock};
use crate::config::SweepConfig;

/// What a status query says about a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Running,
    Succeeded,
    Failed,
}

pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Validate a resource request and fill this backend's defaults.
    /// Fails with `Configuration` when a required field has no default.
    fn check_and_fill_defaults(&self, request: &ResourceRequest) -> Result<ResourceRequest>;

    /// Issue the native submission. Never retries; a rejection is a
    /// `Submission` error.
    fn submit(&self, job: &JobDescriptor) -> Result<JobHandle>;

    /// Side-effect free status query. Transient query failures are retried
    /// internally and surface only as `TransientPoll`, never as `Failed`.
    /// The descriptor locates the exit-code file a finished job leaves.
    fn poll(&self, handle: &JobHandle, job: &JobDescriptor) -> Result<PollStatus>;

    /// Stop a job that is still queued or running.
    fn terminate(&self, handle: &JobHandle, job: &JobDescriptor) -> Result<()>;

    /// Remove transient files; cloud instances are also torn down here and
    /// the call returns only once teardown is observable.
    fn cleanup(&self, handle: &JobHandle, job: &JobDescriptor) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    fn describe(&self) -> String {
        let tail = self
            .stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no stderr output");
        match self.status {
            Some(code) => format!("exit {}: {}", code, tail.trim()),
            None => format!("killed by signal: {}", tail.trim()),
        }
    }
}

/// Runs the external commands the cluster and cloud backends rely on.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runs commands on the host with `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Fixed-delay retry applied to status queries. The clock also paces the
/// backends' own waits (exit-file grace, cloud teardown).
#[derive(Clone)]
pub struct PollRetry {
    pub attempts: u32,
    pub delay: Duration,
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for PollRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollRetry")
            .field("attempts", &self.attempts)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl Default for PollRetry {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2), Arc::new(SystemClock))
    }
}

impl PollRetry {
    pub fn new(attempts: u32, delay: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            attempts,
            delay,
            clock,
        }
    }

    /// Run `query` until it succeeds or attempts run out. Every error is
    /// reported as `TransientPoll`.
    pub(crate) fn run<T>(&self, what: &str, mut query: impl FnMut() -> Result<T>) -> Result<T> {
        let attempts = self.attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            match query() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    last = err.to_string();
                    warn!(query = what, attempt, attempts, error = %last, "status query failed");
                    if attempt < attempts && !self.delay.is_zero() {
                        self.clock.sleep(self.delay);
                    }
                }
            }
        }
        Err(SweepError::TransientPoll(format!(
            "{} failed after {} attempts: {}",
            what, attempts, last
        )))
    }
}

/// Backends available to a run, resolved once per job at construction time.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: BTreeMap<BackendKind, Arc<dyn Backend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn Backend>> {
        self.backends.get(&kind).cloned().ok_or_else(|| {
            SweepError::config(format!("no backend configured for kind '{}'", kind))
        })
    }

    /// Build the backend the experiment file selects.
    pub fn from_config(
        config: &SweepConfig,
        kind: BackendKind,
        runner: Arc<dyn CommandRunner>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let retry = PollRetry::new(
            config.runtime.poll_retries,
            Duration::from_millis(config.runtime.poll_retry_delay_ms),
            clock,
        );
        let exit_grace = Duration::from_secs(config.runtime.exit_file_grace_secs);
        let backend: Arc<dyn Backend> = match kind {
            BackendKind::Local => Arc::new(LocalBackend::new(retry)),
            BackendKind::Slurm => Arc::new(
                SlurmBackend::new(
                    runner,
                    resolve_user(config.runtime.slurm.user.as_deref())?,
                    retry,
                )
                .with_exit_grace(exit_grace),
            ),
            BackendKind::Sge => Arc::new(
                SgeBackend::new(
                    runner,
                    resolve_user(config.runtime.sge.user.as_deref())?,
                    retry,
                )
                .with_exit_grace(exit_grace),
            ),
            BackendKind::CloudVm => {
                let cloud = config.runtime.cloud.as_ref().ok_or_else(|| {
                    SweepError::config("backend cloud_vm requires a /runtime/cloud section")
                })?;
                Arc::new(CloudVmBackend::new(
                    runner,
                    CloudVmSettings::from_section(cloud),
                    retry,
                ))
            }
        };
        Ok(Self::new().with(backend))
    }
}

fn resolve_user(configured: Option<&str>) -> Result<String> {
    if let Some(user) = configured {
        return Ok(user.to_string());
    }
    std::env::var("USER").map_err(|_| {
        SweepError::config("cluster backends need a user: set runtime.<backend>.user or $USER")
    })
}

/// Parse a walltime into seconds. Accepts `D-HH:MM:SS`, `HH:MM:SS`, `MM:SS`,
/// a bare number of minutes, or a number with an `s`/`m`/`h`/`d` suffix.
pub(crate) fn parse_walltime(raw: &str) -> Result<u64> {
    let bad = || SweepError::config(format!("invalid walltime '{}'", raw));
    let s = raw.trim();
    if s.is_empty() {
        return Err(bad());
    }
    if let Some(last) = s.chars().last() {
        if last.is_ascii_alphabetic() {
            let n: u64 = s[..s.len() - 1].trim().parse().map_err(|_| bad())?;
            let unit = match last {
                's' => 1,
                'm' => 60,
                'h' => 3600,
                'd' => 86_400,
                _ => return Err(bad()),
            };
            return n.checked_mul(unit).ok_or_else(bad);
        }
    }
    let (days, clock) = match s.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().map_err(|_| bad())?, rest),
        None => (0, s),
    };
    let parts: Vec<u64> = clock
        .split(':')
        .map(|p| p.parse::<u64>().map_err(|_| bad()))
        .collect::<Result<_>>()?;
    let (h, m, s) = match parts.as_slice() {
        [m] if days == 0 => (0, *m, 0),
        [h] => (*h, 0, 0),
        [m, s] if days == 0 => (0, *m, *s),
        [h, m] => (*h, *m, 0),
        [h, m, s] => (*h, *m, *s),
        _ => return Err(bad()),
    };
    days.checked_mul(86_400)
        .and_then(|d| h.checked_mul(3600).and_then(|h| d.checked_add(h)))
        .and_then(|t| m.checked_mul(60).and_then(|m| t.checked_add(m)))
        .and_then(|t| t.checked_add(s))
        .ok_or_else(bad)
}

/// `HH:MM:SS` with hours allowed past 24.
pub(crate) fn format_hms(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

pub(crate) fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Transient files a job may leave behind, keyed by suffix.
pub(crate) fn transient_path(job: &JobDescriptor, suffix: &str) -> PathBuf {
    job.transient_dir().join(format!("{}.{}", job.job_name(), suffix))
}

/// Exit code recorded by a generated script, if it has been written.
pub(crate) fn read_exit_code(path: &Path) -> Option<i32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
}

pub(crate) fn exit_code_status(code: Option<i32>) -> PollStatus {
    match code {
        Some(0) => PollStatus::Succeeded,
        _ => PollStatus::Failed,
    }
}

/// Remove the exit-code file an earlier submission of this job may have left.
pub(crate) fn clear_exit_file(job: &JobDescriptor) -> Result<()> {
    let path = transient_path(job, "exit");
    match fs::remove_file(&path) {
        Ok(()) => {
            debug!(job = %job.id(), path = %path.display(), "removed stale exit file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Verdict for queue jobs that have left the scheduler's listing. The exit
/// file may reach a shared filesystem after the job leaves the queue, so a
/// job without one counts as running until `grace` has passed.
pub(crate) struct ExitFileWait {
    grace: Duration,
    first_missing: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ExitFileWait {
    pub(crate) fn new(grace: Duration) -> Self {
        Self {
            grace,
            first_missing: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn status(&self, job_id: &str, exit_file: &Path, clock: &dyn Clock) -> PollStatus {
        let mut pending = self
            .first_missing
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(code) = read_exit_code(exit_file) {
            pending.remove(job_id);
            return exit_code_status(Some(code));
        }
        let now = clock.now();
        let since = *pending.entry(job_id.to_string()).or_insert(now);
        let waited = (now - since).to_std().unwrap_or(Duration::ZERO);
        if waited >= self.grace {
            pending.remove(job_id);
            warn!(
                queue_id = job_id,
                waited_secs = waited.as_secs(),
                "job left the queue without an exit file"
            );
            PollStatus::Failed
        } else {
            debug!(queue_id = job_id, waited_secs = waited.as_secs(), "waiting for exit file");
            PollStatus::Running
        }
    }
}

/// Remove this job's transient files and the transient dir once empty.
pub(crate) fn remove_transient_files(job: &JobDescriptor) -> Result<()> {
    let dir = job.transient_dir();
    if !dir.exists() {
        return Ok(());
    }
    let prefix = format!("{}.", job.job_name());
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            fs::remove_file(entry.path())?;
        }
    }
    if fs::read_dir(&dir)?.next().is_none() {
        let _ = fs::remove_dir(&dir);
    }
    Ok(())
}

/// Common body of a generated batch script: run the program from its work
/// dir and record its exit code for the poller.
pub(crate) fn script_body(job: &JobDescriptor) -> String {
    let exit_file = transient_path(job, "exit");
    format!(
        "cd {}\n{}\necho $? > {}\n",
        shell_quote(&job.work_dir.to_string_lossy()),
        shell_join(&job.command_line()),
        shell_quote(&exit_file.to_string_lossy()),
    )
}

pub(crate) fn run_submission(
    runner: &dyn CommandRunner,
    job: &JobDescriptor,
    program: &str,
    args: &[String],
) -> Result<String> {
    let output = runner.run(program, args).map_err(|e| SweepError::Submission {
        job: job.id().to_string(),
        message: format!("could not run {}: {}", program, e),
    })?;
    if !output.success() {
        return Err(SweepError::Submission {
            job: job.id().to_string(),
            message: format!("{} {}", program, output.describe()),
        });
    }
    Ok(output.stdout)
}

pub(crate) fn run_query(runner: &dyn CommandRunner, program: &str, args: &[String]) -> Result<String> {
    let output = runner
        .run(program, args)
        .map_err(|e| SweepError::TransientPoll(format!("could not run {}: {}", program, e)))?;
    if !output.success() {
        return Err(SweepError::TransientPoll(format!(
            "{} {}",
            program,
            output.describe()
        )));
    }
    Ok(output.stdout)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    pub use crate::clock::ManualClock;

    /// Replays canned outputs in order and records every invocation.
    #[derive(Default)]
    pub struct ScriptedRunner {
        responses: Mutex<VecDeque<std::io::Result<CommandOutput>>>,
        pub calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl ScriptedRunner {
        pub fn push_ok(&self, stdout: &str) {
            self.push(Some(0), stdout, "");
        }

        pub fn push(&self, status: Option<i32>, stdout: &str, stderr: &str) {
            self.responses.lock().unwrap().push_back(Ok(CommandOutput {
                status,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }));
        }

        pub fn push_spawn_error(&self) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "not installed",
                )));
        }

        pub fn programs(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(p, _)| p.clone())
                .collect()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected command: {} {:?}", program, args))
        }
    }

    pub fn descriptor(kind: BackendKind, root: &Path) -> JobDescriptor {
        JobDescriptor {
            experiment_id: "exp".to_string(),
            backend_kind: kind,
            executable: vec!["python".to_string(), "train.py".to_string()],
            config_id: "cfg".to_string(),
            config_path: root.join("configs").join("cfg.json"),
            seed: 1,
            resource_request: ResourceRequest::default(),
            argument_overrides: BTreeMap::new(),
            output_dir: root.join("logs").join("cfg"),
            work_dir: root.to_path_buf(),
        }
    }

    pub fn no_delay() -> PollRetry {
        PollRetry::new(3, Duration::ZERO, Arc::new(ManualClock::default()))
    }

    pub fn manual_retry(clock: &Arc<ManualClock>) -> PollRetry {
        PollRetry::new(3, Duration::ZERO, clock.clone())
    }
}
