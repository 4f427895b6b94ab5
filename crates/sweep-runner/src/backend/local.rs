use std::collections::HashMap;
use std::fs;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use sweep_core::{
    ensure_dir, BackendKind, JobDescriptor, JobHandle, ResourceRequest, Result, SweepError,
};
use tracing::{debug, warn};

use super::{remove_transient_files, transient_path, Backend, PollRetry, PollStatus};

/// Runs each job as a child process of the scheduler.
pub struct LocalBackend {
    children: Mutex<HashMap<u32, Child>>,
    retry: PollRetry,
}

impl LocalBackend {
    pub fn new(retry: PollRetry) -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
            retry,
        }
    }

    fn children(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Child>> {
        self.children.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn pid_of(handle: &JobHandle) -> Result<u32> {
    match handle {
        JobHandle::Process { pid } => Ok(*pid),
        other => Err(SweepError::Backend(format!(
            "local backend cannot use handle {}",
            other
        ))),
    }
}

impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn check_and_fill_defaults(&self, request: &ResourceRequest) -> Result<ResourceRequest> {
        let mut filled = request.clone();
        filled.cores.get_or_insert(1);
        if let Some(walltime) = filled.walltime.as_deref() {
            super::parse_walltime(walltime)?;
        }
        Ok(filled)
    }

    fn submit(&self, job: &JobDescriptor) -> Result<JobHandle> {
        let argv = job.command_line();
        let submission_error = |message: String| SweepError::Submission {
            job: job.id().to_string(),
            message,
        };
        let program = argv
            .first()
            .ok_or_else(|| submission_error("empty command line".to_string()))?;
        ensure_dir(&job.transient_dir())?;
        ensure_dir(&job.output_dir)?;
        let stdout = fs::File::create(transient_path(job, "out"))?;
        let stderr = fs::File::create(transient_path(job, "err"))?;

        let mut cmd = Command::new(program);
        cmd.args(&argv[1..]);
        cmd.current_dir(&job.work_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(stdout));
        cmd.stderr(Stdio::from(stderr));
        if let Some(cores) = job.resource_request.cores {
            cmd.env("OMP_NUM_THREADS", cores.to_string());
        }
        let child = cmd
            .spawn()
            .map_err(|e| submission_error(format!("could not spawn {}: {}", program, e)))?;
        let pid = child.id();
        debug!(job = %job.id(), pid, "spawned local process");
        self.children().insert(pid, child);
        Ok(JobHandle::Process { pid })
    }

    fn poll(&self, handle: &JobHandle, _job: &JobDescriptor) -> Result<PollStatus> {
        let pid = pid_of(handle)?;
        self.retry.run("local process wait", || {
            let mut children = self.children();
            let Some(child) = children.get_mut(&pid) else {
                warn!(pid, "no local process with this pid, treating as failed");
                return Ok(PollStatus::Failed);
            };
            match child.try_wait()? {
                Some(status) if status.success() => Ok(PollStatus::Succeeded),
                Some(_) => Ok(PollStatus::Failed),
                None => Ok(PollStatus::Running),
            }
        })
    }

    fn terminate(&self, handle: &JobHandle, _job: &JobDescriptor) -> Result<()> {
        let pid = pid_of(handle)?;
        if let Some(child) = self.children().get_mut(&pid) {
            if child.try_wait()?.is_none() {
                child.kill()?;
                let _ = child.wait();
            }
        }
        Ok(())
    }

    fn cleanup(&self, handle: &JobHandle, job: &JobDescriptor) -> Result<()> {
        let pid = pid_of(handle)?;
        if let Some(mut child) = self.children().remove(&pid) {
            // Reap so no zombie outlives the job.
            let _ = child.wait();
        }
        remove_transient_files(job)
    }
}
