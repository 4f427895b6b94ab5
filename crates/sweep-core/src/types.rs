use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::SweepError;

/// Execution target a job is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Spawned child process on this machine.
    Local,
    /// Slurm batch cluster.
    Slurm,
    /// Sun Grid Engine batch cluster.
    Sge,
    /// Google Compute Engine instance per job.
    CloudVm,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Slurm => "slurm",
            BackendKind::Sge => "sge",
            BackendKind::CloudVm => "cloud_vm",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(BackendKind::Local),
            "slurm" => Ok(BackendKind::Slurm),
            "sge" => Ok(BackendKind::Sge),
            "cloud_vm" | "cloud-vm" | "gcp" => Ok(BackendKind::CloudVm),
            other => Err(SweepError::config(format!(
                "unknown backend '{}' (expected local | slurm | sge | cloud_vm)",
                other
            ))),
        }
    }
}

/// Resources asked of a backend. Every field is optional in the experiment
/// file; each backend fills its own defaults and rejects what it cannot
/// default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub walltime: Option<String>,
    #[serde(default)]
    pub cores: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub gpus: Option<u32>,
    #[serde(default)]
    pub machine_type: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
}

/// Identity of a job: one configuration evaluated under one seed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId {
    pub config_id: String,
    pub seed: u64,
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/seed_{}", self.config_id, self.seed)
    }
}

/// Everything needed to submit one seed of one configuration. Never mutated
/// once it has been queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub experiment_id: String,
    pub backend_kind: BackendKind,
    /// argv prefix of the training/evaluation program.
    pub executable: Vec<String>,
    pub config_id: String,
    /// Persisted configuration payload handed to the program via `--config`.
    pub config_path: PathBuf,
    pub seed: u64,
    pub resource_request: ResourceRequest,
    pub argument_overrides: BTreeMap<String, String>,
    /// Directory the program writes its per-seed artifact into.
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
}

impl JobDescriptor {
    pub fn id(&self) -> JobId {
        JobId {
            config_id: self.config_id.clone(),
            seed: self.seed,
        }
    }

    /// Replace the resource request. Used once, when backend defaults are
    /// filled in before the descriptor is queued.
    pub fn with_resources(mut self, resource_request: ResourceRequest) -> Self {
        self.resource_request = resource_request;
        self
    }

    /// Name usable by every backend: lowercase ascii alphanumerics and '-',
    /// starting with a letter, at most 63 characters.
    pub fn job_name(&self) -> String {
        let raw = format!("sweep-{}-{}-s{}", self.experiment_id, self.config_id, self.seed);
        let mut name: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        while name.contains("--") {
            name = name.replace("--", "-");
        }
        if name.len() > 63 {
            // Keep the seed suffix, which is what distinguishes siblings.
            let suffix = format!("-s{}", self.seed);
            name.truncate(63 - suffix.len());
            name = format!("{}{}", name.trim_end_matches('-'), suffix);
        }
        name
    }

    /// Full argv: executable, then the standard flags, then one
    /// `--key value` pair per override in key order.
    pub fn command_line(&self) -> Vec<String> {
        let mut argv = self.executable.clone();
        argv.push("--config".to_string());
        argv.push(self.config_path.to_string_lossy().to_string());
        argv.push("--seed".to_string());
        argv.push(self.seed.to_string());
        argv.push("--log-dir".to_string());
        argv.push(self.output_dir.to_string_lossy().to_string());
        for (key, value) in &self.argument_overrides {
            argv.push(format!("--{}", key));
            argv.push(value.clone());
        }
        argv
    }

    /// Directory for generated scripts, logs and exit-code files.
    pub fn transient_dir(&self) -> PathBuf {
        self.output_dir.join(".sweep")
    }
}

/// Opaque reference to a submitted job, owned by the job that created it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobHandle {
    Process { pid: u32 },
    Queue { job_id: String },
    Instance { name: String },
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobHandle::Process { pid } => write!(f, "pid:{}", pid),
            JobHandle::Queue { job_id } => write!(f, "queue:{}", job_id),
            JobHandle::Instance { name } => write!(f, "instance:{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Submitted,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Submitted or Running: occupies a concurrency slot.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Submitted | JobState::Running)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Submitted)
                | (Queued, Failed)
                | (Submitted, Running)
                | (Running, Succeeded)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Submitted => write!(f, "submitted"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}
