use std::sync::Arc;
use std::time::Duration;

use sweep_core::{
    atomic_write_bytes, ensure_dir, BackendKind, JobDescriptor, JobHandle, ResourceRequest,
    Result, SweepError,
};
use tracing::{debug, info, warn};

use super::{
    clear_exit_file, format_hms, parse_walltime, remove_transient_files, run_query,
    run_submission, script_body, transient_path, Backend, CommandRunner, ExitFileWait, PollRetry,
    PollStatus,
};

const DEFAULT_WALLTIME: &str = "01:00:00";

/// Sun Grid Engine: `qsub -terse` to submit, `qstat -u` to poll.
pub struct SgeBackend {
    runner: Arc<dyn CommandRunner>,
    user: String,
    retry: PollRetry,
    exit_wait: ExitFileWait,
}

impl SgeBackend {
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
            "#$ -S /bin/bash".to_string(),
            format!("#$ -N {}", job.job_name()),
            format!("#$ -o {}", transient_path(job, "out").display()),
            format!("#$ -e {}", transient_path(job, "err").display()),
        ];
        if let Some(walltime) = &req.walltime {
            lines.push(format!("#$ -l h_rt={}", walltime));
        }
        if let Some(queue) = &req.queue {
            lines.push(format!("#$ -q {}", queue));
        }
        if let Some(cores) = req.cores.filter(|c| *c > 1) {
            lines.push(format!("#$ -pe smp {}", cores));
        }
        if let Some(mem) = req.memory_mb {
            lines.push(format!("#$ -l h_vmem={}M", mem));
        }
        if let Some(gpus) = req.gpus.filter(|g| *g > 0) {
            lines.push(format!("#$ -l gpu={}", gpus));
        }
        format!("{}\n\n{}", lines.join("\n"), script_body(job))
    }
}

fn job_id_of(handle: &JobHandle) -> Result<&str> {
    match handle {
        JobHandle::Queue { job_id } => Ok(job_id),
        other => Err(SweepError::Backend(format!(
            "sge backend cannot use handle {}",
            other
        ))),
    }
}

/// `qsub -terse` prints `jobid`, or `jobid.range` for array jobs.
fn parse_qsub_output(stdout: &str) -> Option<String> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let id = line.trim().split('.').next()?;
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        Some(id.to_string())
    } else {
        None
    }
}

/// State column of `job_id` in a `qstat -u` table. The header and the dashed
/// rule are skipped because their first token is never a job id.
fn qstat_state<'a>(listing: &'a str, job_id: &str) -> Option<&'a str> {
    listing.lines().find_map(|line| {
        let cols: Vec<&str> = line.split_whitespace().collect();
        match cols.as_slice() {
            [id, _prior, _name, _user, state, ..] if *id == job_id => Some(*state),
            _ => None,
        }
    })
}

impl Backend for SgeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sge
    }

    fn check_and_fill_defaults(&self, request: &ResourceRequest) -> Result<ResourceRequest> {
        let mut filled = request.clone();
        let walltime = filled.walltime.as_deref().unwrap_or(DEFAULT_WALLTIME);
        filled.walltime = Some(format_hms(parse_walltime(walltime)?));
        filled.cores.get_or_insert(1);
        if filled.cores == Some(0) {
            return Err(SweepError::config("sge: cores must be at least 1"));
        }
        Ok(filled)
    }

    fn submit(&self, job: &JobDescriptor) -> Result<JobHandle> {
        ensure_dir(&job.transient_dir())?;
        ensure_dir(&job.output_dir)?;
        clear_exit_file(job)?;
        let script = transient_path(job, "qsub");
        atomic_write_bytes(&script, self.render_script(job).as_bytes())?;
        let stdout = run_submission(
            self.runner.as_ref(),
            job,
            "qsub",
            &["-terse".to_string(), script.to_string_lossy().to_string()],
        )?;
        let job_id = parse_qsub_output(&stdout).ok_or_else(|| SweepError::Submission {
            job: job.id().to_string(),
            message: format!("unparseable qsub output: {:?}", stdout.trim()),
        })?;
        info!(job = %job.id(), sge_id = %job_id, "submitted to sge");
        Ok(JobHandle::Queue { job_id })
    }

    fn poll(&self, handle: &JobHandle, job: &JobDescriptor) -> Result<PollStatus> {
        let job_id = job_id_of(handle)?;
        let listing = self.retry.run("qstat", || {
            run_query(
                self.runner.as_ref(),
                "qstat",
                &["-u".to_string(), self.user.clone()],
            )
        })?;
        match qstat_state(&listing, job_id) {
            // Eqw and friends: the job will never start on its own.
            Some(state) if state.contains('E') => {
                warn!(sge_id = job_id, state, "sge job in error state");
                Ok(PollStatus::Failed)
            }
            Some(state) => {
                debug!(sge_id = job_id, state, "sge job listed");
                Ok(PollStatus::Running)
            }
            None => Ok(self.exit_wait.status(
                job_id,
                &transient_path(job, "exit"),
                self.retry.clock.as_ref(),
            )),
        }
    }

    fn terminate(&self, handle: &JobHandle, _job: &JobDescriptor) -> Result<()> {
        let job_id = job_id_of(handle)?;
        run_query(self.runner.as_ref(), "qdel", &[job_id.to_string()])
            .map_err(|e| SweepError::Backend(e.to_string()))?;
        Ok(())
    }

    fn cleanup(&self, _handle: &JobHandle, job: &JobDescriptor) -> Result<()> {
        remove_transient_files(job)
    }
}
