use std::sync::Arc;
use std::time::Duration;

use sweep_core::{
    atomic_write_bytes, ensure_dir, BackendKind, JobDescriptor, JobHandle, ResourceRequest,
    Result, SweepError,
};
use tracing::{debug, info};

use super::{
    clear_exit_file, format_hms, parse_walltime, remove_transient_files, run_query,
    run_submission, script_body, transient_path, Backend, CommandRunner, ExitFileWait, PollRetry,
    PollStatus,
};

const DEFAULT_WALLTIME: &str = "01:00:00";

/// Slurm: `sbatch` to submit, the user's `squeue` listing to poll.
pub struct SlurmBackend {
    runner: Arc<dyn CommandRunner>,
    user: String,
    retry: PollRetry,
    exit_wait: ExitFileWait,
}

impl SlurmBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, user: String, retry: PollRetry) -> Self {
        Self {
            runner,
            user,
            retry,
            exit_wait: ExitFileWait::new(Duration::ZERO),
        }
    }

    /// How long a job may be gone from the queue listing before a missing
    /// exit file means it failed.
    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_wait = ExitFileWait::new(grace);
        self
    }

    fn render_script(&self, job: &JobDescriptor) -> String {
        let req = &job.resource_request;
        let mut lines = vec![
            "#!/bin/bash".to_string(),
            format!("#SBATCH --job-name={}", job.job_name()),
            format!("#SBATCH --output={}", transient_path(job, "out").display()),
            format!("#SBATCH --error={}", transient_path(job, "err").display()),
        ];
        if let Some(walltime) = &req.walltime {
            lines.push(format!("#SBATCH --time={}", walltime));
        }
        if let Some(cores) = req.cores {
            lines.push(format!("#SBATCH --cpus-per-task={}", cores));
        }
        if let Some(queue) = &req.queue {
            lines.push(format!("#SBATCH --partition={}", queue));
        }
        if let Some(mem) = req.memory_mb {
            lines.push(format!("#SBATCH --mem={}M", mem));
        }
        if let Some(gpus) = req.gpus.filter(|g| *g > 0) {
            lines.push(format!("#SBATCH --gres=gpu:{}", gpus));
        }
        format!("{}\n\n{}", lines.join("\n"), script_body(job))
    }
}

fn job_id_of(handle: &JobHandle) -> Result<&str> {
    match handle {
        JobHandle::Queue { job_id } => Ok(job_id),
        other => Err(SweepError::Backend(format!(
            "slurm backend cannot use handle {}",
            other
        ))),
    }
}

/// `sbatch --parsable` prints `jobid` or `jobid;cluster`.
fn parse_sbatch_output(stdout: &str) -> Option<String> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let id = line.split(';').next()?.trim();
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_') {
        Some(id.to_string())
    } else {
        None
    }
}

/// Find the state of `job_id` in `squeue -h -o "%i %T"` output.
fn squeue_state<'a>(listing: &'a str, job_id: &str) -> Option<&'a str> {
    listing.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let id = parts.next()?;
        (id == job_id).then(|| parts.next().unwrap_or("UNKNOWN"))
    })
}

impl Backend for SlurmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Slurm
    }

    fn check_and_fill_defaults(&self, request: &ResourceRequest) -> Result<ResourceRequest> {
        let mut filled = request.clone();
        let walltime = filled.walltime.as_deref().unwrap_or(DEFAULT_WALLTIME);
        let secs = parse_walltime(walltime)?;
        filled.walltime = Some(if secs >= 86_400 {
            format!("{}-{}", secs / 86_400, format_hms(secs % 86_400))
        } else {
            format_hms(secs)
        });
        filled.cores.get_or_insert(1);
        if filled.cores == Some(0) {
            return Err(SweepError::config("slurm: cores must be at least 1"));
        }
        Ok(filled)
    }

    fn submit(&self, job: &JobDescriptor) -> Result<JobHandle> {
        ensure_dir(&job.transient_dir())?;
        ensure_dir(&job.output_dir)?;
        clear_exit_file(job)?;
        let script = transient_path(job, "sbatch");
        atomic_write_bytes(&script, self.render_script(job).as_bytes())?;
        let stdout = run_submission(
            self.runner.as_ref(),
            job,
            "sbatch",
            &["--parsable".to_string(), script.to_string_lossy().to_string()],
        )?;
        let job_id = parse_sbatch_output(&stdout).ok_or_else(|| SweepError::Submission {
            job: job.id().to_string(),
            message: format!("unparseable sbatch output: {:?}", stdout.trim()),
        })?;
        info!(job = %job.id(), slurm_id = %job_id, "submitted to slurm");
        Ok(JobHandle::Queue { job_id })
    }

    fn poll(&self, handle: &JobHandle, job: &JobDescriptor) -> Result<PollStatus> {
        let job_id = job_id_of(handle)?;
        let listing = self.retry.run("squeue", || {
            run_query(
                self.runner.as_ref(),
                "squeue",
                &[
                    "-h".to_string(),
                    "-u".to_string(),
                    self.user.clone(),
                    "-o".to_string(),
                    "%i %T".to_string(),
                ],
            )
        })?;
        match squeue_state(&listing, job_id) {
            Some(state) => {
                debug!(slurm_id = job_id, state, "slurm job listed");
                Ok(PollStatus::Running)
            }
            // Gone from the queue: the script's exit file is the verdict. One
            // still missing after the grace period means slurm killed the job.
            None => Ok(self.exit_wait.status(
                job_id,
                &transient_path(job, "exit"),
                self.retry.clock.as_ref(),
            )),
        }
    }

    fn terminate(&self, handle: &JobHandle, _job: &JobDescriptor) -> Result<()> {
        let job_id = job_id_of(handle)?;
        run_query(self.runner.as_ref(), "scancel", &[job_id.to_string()])
            .map_err(|e| SweepError::Backend(e.to_string()))?;
        Ok(())
    }

    fn cleanup(&self, _handle: &JobHandle, job: &JobDescriptor) -> Result<()> {
        remove_transient_files(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{descriptor, manual_retry, no_delay, ManualClock, ScriptedRunner};
    use std::fs;

    fn backend(runner: &Arc<ScriptedRunner>) -> SlurmBackend {
        SlurmBackend::new(runner.clone(), "alice".to_string(), no_delay())
    }

    #[test]
    fn defaults_normalize_walltime_and_cores() {
        let runner = Arc::new(ScriptedRunner::default());
        let filled = backend(&runner)
            .check_and_fill_defaults(&ResourceRequest {
                walltime: Some("30h".to_string()),
                ..ResourceRequest::default()
            })
            .expect("defaults");
        assert_eq!(filled.walltime.as_deref(), Some("1-06:00:00"));
        assert_eq!(filled.cores, Some(1));

        let filled = backend(&runner)
            .check_and_fill_defaults(&ResourceRequest::default())
            .expect("defaults");
        assert_eq!(filled.walltime.as_deref(), Some("01:00:00"));
    }

    #[test]
    fn submit_writes_script_and_parses_job_id() {
        let root = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::default());
        runner.push_ok("4242;cluster\n");
        let mut job = descriptor(BackendKind::Slurm, root.path());
        job.resource_request = ResourceRequest {
            queue: Some("gpu".to_string()),
            walltime: Some("02:00:00".to_string()),
            cores: Some(4),
            gpus: Some(1),
            ..ResourceRequest::default()
        };

        let handle = backend(&runner).submit(&job).expect("submit");
        assert_eq!(
            handle,
            JobHandle::Queue {
                job_id: "4242".to_string()
            }
        );
        let script = fs::read_to_string(transient_path(&job, "sbatch")).expect("script");
        assert!(script.contains("#SBATCH --partition=gpu"));
        assert!(script.contains("#SBATCH --cpus-per-task=4"));
        assert!(script.contains("#SBATCH --gres=gpu:1"));
        assert!(script.contains("python train.py --config"));
        assert!(script.contains("echo $? >"));
        assert_eq!(runner.programs(), vec!["sbatch"]);
    }

    #[test]
    fn rejected_submission_is_not_retried() {
        let root = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(Some(1), "", "sbatch: error: invalid partition specified");
        let job = descriptor(BackendKind::Slurm, root.path());
        let err = backend(&runner).submit(&job).expect_err("rejected");
        match err {
            SweepError::Submission { message, .. } => {
                assert!(message.contains("invalid partition"), "{}", message)
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(runner.programs().len(), 1);
    }

    #[test]
    fn poll_reads_listing_then_exit_file() {
        let root = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::default());
        let job = descriptor(BackendKind::Slurm, root.path());
        let handle = JobHandle::Queue {
            job_id: "17".to_string(),
        };

        runner.push_ok("16 RUNNING\n17 PENDING\n");
        assert_eq!(
            backend(&runner).poll(&handle, &job).expect("poll"),
            PollStatus::Running
        );

        runner.push_ok("16 RUNNING\n");
        assert_eq!(
            backend(&runner).poll(&handle, &job).expect("poll"),
            PollStatus::Failed,
            "no exit file means the job was killed"
        );

        atomic_write_bytes(&transient_path(&job, "exit"), b"0\n").expect("exit file");
        runner.push_ok("");
        assert_eq!(
            backend(&runner).poll(&handle, &job).expect("poll"),
            PollStatus::Succeeded
        );
    }

    #[test]
    fn resubmission_discards_old_exit_file() {
        let root = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::default());
        let job = descriptor(BackendKind::Slurm, root.path());
        ensure_dir(&job.transient_dir()).expect("transient dir");
        atomic_write_bytes(&transient_path(&job, "exit"), b"0\n").expect("old exit file");

        runner.push_ok("18\n");
        let handle = backend(&runner).submit(&job).expect("submit");
        assert!(!transient_path(&job, "exit").exists());

        // Killed before the script ran: no exit file, so not a success.
        runner.push_ok("");
        assert_eq!(
            backend(&runner).poll(&handle, &job).expect("poll"),
            PollStatus::Failed
        );
    }

    #[test]
    fn late_exit_file_within_grace_is_honoured() {
        let root = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::default());
        let clock = Arc::new(ManualClock::default());
        let slurm = SlurmBackend::new(runner.clone(), "alice".to_string(), manual_retry(&clock))
            .with_exit_grace(Duration::from_secs(30));
        let job = descriptor(BackendKind::Slurm, root.path());
        let handle = JobHandle::Queue {
            job_id: "21".to_string(),
        };

        runner.push_ok("");
        assert_eq!(slurm.poll(&handle, &job).expect("poll"), PollStatus::Running);
        clock.advance(Duration::from_secs(10));
        ensure_dir(&job.transient_dir()).expect("transient dir");
        atomic_write_bytes(&transient_path(&job, "exit"), b"0\n").expect("exit file");
        runner.push_ok("");
        assert_eq!(slurm.poll(&handle, &job).expect("poll"), PollStatus::Succeeded);

        let lost = JobHandle::Queue {
            job_id: "22".to_string(),
        };
        fs::remove_file(transient_path(&job, "exit")).expect("remove");
        runner.push_ok("");
        assert_eq!(slurm.poll(&lost, &job).expect("poll"), PollStatus::Running);
        clock.advance(Duration::from_secs(30));
        runner.push_ok("");
        assert_eq!(slurm.poll(&lost, &job).expect("poll"), PollStatus::Failed);
    }

    #[test]
    fn transient_squeue_failure_is_retried() {
        let root = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(Some(1), "", "slurm_load_jobs error: Socket timed out");
        runner.push_spawn_error();
        runner.push_ok("17 RUNNING\n");
        let job = descriptor(BackendKind::Slurm, root.path());
        let handle = JobHandle::Queue {
            job_id: "17".to_string(),
        };
        assert_eq!(
            backend(&runner).poll(&handle, &job).expect("poll"),
            PollStatus::Running
        );
        assert_eq!(runner.programs(), vec!["squeue", "squeue", "squeue"]);

        for _ in 0..3 {
            runner.push(Some(1), "", "slurm_load_jobs error: Socket timed out");
        }
        let err = backend(&runner).poll(&handle, &job).expect_err("exhausted");
        assert!(matches!(err, SweepError::TransientPoll(_)));
    }

    #[test]
    fn sbatch_output_parsing() {
        assert_eq!(parse_sbatch_output("123\n").as_deref(), Some("123"));
        assert_eq!(parse_sbatch_output("\n99;alpine\n").as_deref(), Some("99"));
        assert_eq!(parse_sbatch_output("Submitted batch job 5"), None);
        assert_eq!(parse_sbatch_output(""), None);
    }
}
