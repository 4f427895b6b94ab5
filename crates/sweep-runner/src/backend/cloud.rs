use std::sync::Arc;
use std::time::Duration;

use sweep_core::{
    atomic_write_bytes, ensure_dir, BackendKind, JobDescriptor, JobHandle, ResourceRequest,
    Result, SweepError,
};
use tracing::{debug, info, warn};

use super::{
    parse_walltime, remove_transient_files, run_query, run_submission, shell_join, shell_quote,
    transient_path, Backend, CommandRunner, PollRetry, PollStatus,
};
use crate::config::CloudSection;

/// Instance and staging settings for the Compute Engine backend.
#[derive(Debug, Clone)]
pub struct CloudVmSettings {
    pub project: Option<String>,
    pub zone: Option<String>,
    /// `gs://bucket/prefix` under which code, outputs and exit codes are staged.
    pub staging_uri: String,
    pub machine_type: String,
    pub image_family: String,
    pub image_project: String,
    pub accelerator_type: String,
    pub teardown_timeout: Duration,
    pub teardown_poll: Duration,
}

impl CloudVmSettings {
    pub fn from_section(section: &CloudSection) -> Self {
        Self {
            project: section.project.clone(),
            zone: section.zone.clone(),
            staging_uri: section.staging_uri.trim_end_matches('/').to_string(),
            machine_type: section.machine_type.clone(),
            image_family: section.image_family.clone(),
            image_project: section.image_project.clone(),
            accelerator_type: section.accelerator_type.clone(),
            teardown_timeout: Duration::from_secs(section.teardown_timeout_secs),
            teardown_poll: Duration::from_secs(section.teardown_poll_secs),
        }
    }
}

/// One Compute Engine instance per job. Code goes up through the staging
/// bucket, the instance runs the job from its startup script, uploads the
/// outputs plus an exit-code object and powers itself off.
pub struct CloudVmBackend {
    runner: Arc<dyn CommandRunner>,
    settings: CloudVmSettings,
    retry: PollRetry,
}

const ACTIVE_STATES: &[&str] = &[
    "PROVISIONING",
    "STAGING",
    "RUNNING",
    "STOPPING",
    "REPAIRING",
    "SUSPENDING",
];

fn no_objects_matched(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no urls matched") || stderr.contains("matched no objects")
}

fn instance_of(handle: &JobHandle) -> Result<&str> {
    match handle {
        JobHandle::Instance { name } => Ok(name),
        other => Err(SweepError::Backend(format!(
            "cloud_vm backend cannot use handle {}",
            other
        ))),
    }
}

impl CloudVmBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: CloudVmSettings, retry: PollRetry) -> Self {
        Self {
            runner,
            settings,
            retry,
        }
    }

    fn job_uri(&self, name: &str, leaf: &str) -> String {
        format!("{}/{}/{}", self.settings.staging_uri, name, leaf)
    }

    fn with_project(&self, mut args: Vec<String>) -> Vec<String> {
        if let Some(project) = &self.settings.project {
            args.push("--project".to_string());
            args.push(project.clone());
        }
        args
    }

    fn render_startup_script(&self, job: &JobDescriptor, name: &str) -> String {
        let work_dir = shell_quote(&job.work_dir.to_string_lossy());
        let output_dir = shell_quote(&job.output_dir.to_string_lossy());
        format!(
            "#!/bin/bash\n\
             mkdir -p {work} {out}\n\
             gsutil -m rsync -r {code} {work}\n\
             cd {work}\n\
             {cmd} > /var/log/{name}.out 2> /var/log/{name}.err\n\
             code=$?\n\
             gsutil -m rsync -r {out} {out_uri}\n\
             echo $code | gsutil cp - {exit_uri}\n\
             shutdown -h now\n",
            work = work_dir,
            out = output_dir,
            code = shell_quote(&self.job_uri(name, "code")),
            cmd = shell_join(&job.command_line()),
            name = name,
            out_uri = shell_quote(&self.job_uri(name, "out")),
            exit_uri = shell_quote(&self.job_uri(name, "exit")),
        )
    }

    /// Current instance status, or `None` once the instance is gone.
    fn instance_status(&self, name: &str) -> Result<Option<String>> {
        let args = self.with_project(vec![
            "compute".to_string(),
            "instances".to_string(),
            "list".to_string(),
            format!("--filter=name=({})", name),
            "--format=value(status)".to_string(),
        ]);
        let stdout = run_query(self.runner.as_ref(), "gcloud", &args)?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string))
    }

    /// Exit code uploaded by the startup script. `None` when the object does
    /// not exist, i.e. the instance died before the job finished.
    fn staged_exit_code(&self, name: &str) -> Result<Option<i32>> {
        let uri = self.job_uri(name, "exit");
        let output = self
            .runner
            .run("gsutil", &["cat".to_string(), uri.clone()])
            .map_err(|e| SweepError::TransientPoll(format!("could not run gsutil: {}", e)))?;
        if output.success() {
            return Ok(output.stdout.trim().parse::<i32>().ok());
        }
        if no_objects_matched(&output.stderr) {
            return Ok(None);
        }
        Err(SweepError::TransientPoll(format!(
            "gsutil cat {} failed: {}",
            uri,
            output.stderr.trim()
        )))
    }

    /// Remove everything an earlier instance of this job staged, the exit
    /// object included. An empty prefix is not an error.
    fn clear_staged(&self, name: &str, job: &JobDescriptor) -> Result<()> {
        let prefix = format!("{}/{}", self.settings.staging_uri, name);
        let output = self
            .runner
            .run(
                "gsutil",
                &["-m".to_string(), "rm".to_string(), "-r".to_string(), prefix.clone()],
            )
            .map_err(|e| SweepError::Submission {
                job: job.id().to_string(),
                message: format!("could not run gsutil: {}", e),
            })?;
        if output.success() {
            debug!(instance = name, %prefix, "removed stale staged objects");
            return Ok(());
        }
        if no_objects_matched(&output.stderr) {
            return Ok(());
        }
        Err(SweepError::Submission {
            job: job.id().to_string(),
            message: format!("gsutil rm {} {}", prefix, output.describe()),
        })
    }

    fn delete_instance(&self, name: &str, job: &JobDescriptor) -> Result<()> {
        let zone = job
            .resource_request
            .zone
            .as_ref()
            .or(self.settings.zone.as_ref())
            .ok_or_else(|| SweepError::config("cloud_vm: no zone for instance deletion"))?;
        let args = self.with_project(vec![
            "compute".to_string(),
            "instances".to_string(),
            "delete".to_string(),
            name.to_string(),
            "--zone".to_string(),
            zone.clone(),
            "--quiet".to_string(),
        ]);
        if let Err(e) = run_query(self.runner.as_ref(), "gcloud", &args) {
            // Already deleted is fine; anything else is confirmed by the
            // listing in `wait_until_gone`.
            debug!(instance = name, error = %e, "instance delete reported an error");
        }
        Ok(())
    }

    fn wait_until_gone(&self, name: &str) -> Result<()> {
        let clock = self.retry.clock.as_ref();
        let started = clock.now();
        loop {
            match self.instance_status(name) {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => debug!(instance = name, %status, "waiting for teardown"),
                Err(e) => warn!(instance = name, error = %e, "teardown listing failed"),
            }
            let waited = (clock.now() - started).to_std().unwrap_or(Duration::ZERO);
            if waited >= self.settings.teardown_timeout {
                return Err(SweepError::Backend(format!(
                    "instance {} still present after {:?}",
                    name, self.settings.teardown_timeout
                )));
            }
            clock.sleep(self.settings.teardown_poll);
        }
    }
}

impl Backend for CloudVmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::CloudVm
    }

    fn check_and_fill_defaults(&self, request: &ResourceRequest) -> Result<ResourceRequest> {
        let mut filled = request.clone();
        if filled.zone.is_none() {
            filled.zone = Some(self.settings.zone.clone().ok_or_else(|| {
                SweepError::config(
                    "cloud_vm: resources.zone is required (or set runtime.cloud.zone)",
                )
            })?);
        }
        filled
            .machine_type
            .get_or_insert_with(|| self.settings.machine_type.clone());
        if let Some(walltime) = filled.walltime.as_deref() {
            parse_walltime(walltime)?;
        }
        if !self.settings.staging_uri.starts_with("gs://") {
            return Err(SweepError::config(format!(
                "cloud_vm: staging_uri must be a gs:// uri, got '{}'",
                self.settings.staging_uri
            )));
        }
        Ok(filled)
    }

    fn submit(&self, job: &JobDescriptor) -> Result<JobHandle> {
        let name = job.job_name();
        let req = &job.resource_request;
        let zone = req.zone.clone().ok_or_else(|| SweepError::Submission {
            job: job.id().to_string(),
            message: "resource request has no zone".to_string(),
        })?;
        let machine_type = req
            .machine_type
            .clone()
            .unwrap_or_else(|| self.settings.machine_type.clone());

        self.clear_staged(&name, job)?;
        run_submission(
            self.runner.as_ref(),
            job,
            "gsutil",
            &[
                "-m".to_string(),
                "rsync".to_string(),
                "-r".to_string(),
                "-x".to_string(),
                "^logs/".to_string(),
                job.work_dir.to_string_lossy().to_string(),
                self.job_uri(&name, "code"),
            ],
        )?;

        ensure_dir(&job.transient_dir())?;
        let startup = transient_path(job, "startup.sh");
        atomic_write_bytes(&startup, self.render_startup_script(job, &name).as_bytes())?;

        let mut args = vec![
            "compute".to_string(),
            "instances".to_string(),
            "create".to_string(),
            name.clone(),
            "--zone".to_string(),
            zone,
            "--machine-type".to_string(),
            machine_type,
            "--image-family".to_string(),
            self.settings.image_family.clone(),
            "--image-project".to_string(),
            self.settings.image_project.clone(),
            "--scopes".to_string(),
            "storage-rw".to_string(),
            "--metadata-from-file".to_string(),
            format!("startup-script={}", startup.display()),
        ];
        if let Some(gpus) = req.gpus.filter(|g| *g > 0) {
            args.push("--accelerator".to_string());
            args.push(format!(
                "type={},count={}",
                self.settings.accelerator_type, gpus
            ));
            args.push("--maintenance-policy".to_string());
            args.push("TERMINATE".to_string());
        }
        if let Some(walltime) = req.walltime.as_deref() {
            args.push("--max-run-duration".to_string());
            args.push(format!("{}s", parse_walltime(walltime)?));
            args.push("--instance-termination-action".to_string());
            args.push("STOP".to_string());
        }
        let args = self.with_project(args);
        run_submission(self.runner.as_ref(), job, "gcloud", &args)?;
        info!(job = %job.id(), instance = %name, "created compute instance");
        Ok(JobHandle::Instance { name })
    }

    fn poll(&self, handle: &JobHandle, _job: &JobDescriptor) -> Result<PollStatus> {
        let name = instance_of(handle)?;
        self.retry.run("gcloud instances list", || {
            if let Some(status) = self.instance_status(name)? {
                if ACTIVE_STATES.contains(&status.as_str()) {
                    return Ok(PollStatus::Running);
                }
            }
            Ok(match self.staged_exit_code(name)? {
                Some(0) => PollStatus::Succeeded,
                _ => PollStatus::Failed,
            })
        })
    }

    fn terminate(&self, handle: &JobHandle, job: &JobDescriptor) -> Result<()> {
        let name = instance_of(handle)?;
        self.delete_instance(name, job)
    }

    fn cleanup(&self, handle: &JobHandle, job: &JobDescriptor) -> Result<()> {
        let name = instance_of(handle)?;
        let fetch = run_query(
            self.runner.as_ref(),
            "gsutil",
            &[
                "-m".to_string(),
                "rsync".to_string(),
                "-r".to_string(),
                self.job_uri(name, "out"),
                job.output_dir.to_string_lossy().to_string(),
            ],
        );
        if let Err(e) = fetch {
            warn!(instance = name, error = %e, "could not fetch instance outputs");
        }
        self.delete_instance(name, job)?;
        let staged = format!("{}/{}", self.settings.staging_uri, name);
        if let Err(e) = run_query(
            self.runner.as_ref(),
            "gsutil",
            &["-m".to_string(), "rm".to_string(), "-r".to_string(), staged],
        ) {
            warn!(instance = name, error = %e, "could not remove staged code");
        }
        self.wait_until_gone(name)?;
        info!(instance = name, "instance torn down");
        remove_transient_files(job)
    }
}
