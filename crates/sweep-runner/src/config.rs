//! Experiment file loading.
//!
//! The YAML file is converted to JSON, checked for every required pointer in
//! one pass, then deserialized into typed sections. The resulting
//! `SweepConfig` is passed explicitly to everything that needs it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sweep_core::{BackendKind, ResourceRequest, Result, SweepError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Finish each batch before submitting the next.
    Sync,
    /// Refill free slots as soon as jobs finish.
    #[default]
    Async,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Sync => write!(f, "sync"),
            Mode::Async => write!(f, "async"),
        }
    }
}

impl FromStr for Mode {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sync" => Ok(Mode::Sync),
            "async" => Ok(Mode::Async),
            other => Err(SweepError::config(format!(
                "unknown mode '{}' (expected sync | async)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub experiment: ExperimentSection,
    pub design: DesignSection,
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub aggregation: AggregationSection,
    pub configs: Vec<ConfigPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSection {
    pub id: String,
    /// Experiment directory, relative to the experiment file.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    pub executable: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignSection {
    /// Seeds per configuration.
    pub seeds: usize,
    #[serde(default)]
    pub base_seed: u64,
    #[serde(default)]
    pub mode: Mode,
    pub max_concurrent: usize,
    /// Sync mode batch size; defaults to `max_concurrent`.
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_submit_attempts")]
    pub submit_attempts: u32,
    #[serde(default = "default_submit_backoff_secs")]
    pub submit_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSection {
    pub backend: BackendKind,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default = "default_poll_retries")]
    pub poll_retries: u32,
    #[serde(default = "default_poll_retry_delay_ms")]
    pub poll_retry_delay_ms: u64,
    /// Cluster jobs gone from the queue get this long for their exit file
    /// to appear before they count as failed.
    #[serde(default = "default_exit_file_grace_secs")]
    pub exit_file_grace_secs: u64,
    #[serde(default)]
    pub slurm: ClusterSection,
    #[serde(default)]
    pub sge: ClusterSection,
    #[serde(default)]
    pub cloud: Option<CloudSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSection {
    /// Account whose queue listing is polled; `$USER` when unset.
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSection {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    pub staging_uri: String,
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
    #[serde(default = "default_image_family")]
    pub image_family: String,
    #[serde(default = "default_image_project")]
    pub image_project: String,
    #[serde(default = "default_accelerator_type")]
    pub accelerator_type: String,
    #[serde(default = "default_teardown_timeout_secs")]
    pub teardown_timeout_secs: u64,
    #[serde(default = "default_teardown_poll_secs")]
    pub teardown_poll_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationSection {
    #[serde(default = "default_aggregation_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_aggregation_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub cleanup_seed_artifacts: bool,
}

impl Default for AggregationSection {
    fn default() -> Self {
        Self {
            retry_delay_secs: default_aggregation_retry_delay_secs(),
            max_attempts: default_aggregation_max_attempts(),
            cleanup_seed_artifacts: false,
        }
    }
}

/// One configuration to evaluate across all seeds. `params` is persisted as
/// the file the program reads via `--config`; `args` become extra flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigPayload {
    pub id: String,
    #[serde(default = "empty_object")]
    pub params: Value,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_submit_attempts() -> u32 {
    1
}

fn default_submit_backoff_secs() -> u64 {
    10
}

fn default_poll_retries() -> u32 {
    3
}

fn default_poll_retry_delay_ms() -> u64 {
    2000
}

fn default_exit_file_grace_secs() -> u64 {
    30
}

fn default_machine_type() -> String {
    "n1-standard-4".to_string()
}

fn default_image_family() -> String {
    "pytorch-latest-cpu".to_string()
}

fn default_image_project() -> String {
    "deeplearning-platform-release".to_string()
}

fn default_accelerator_type() -> String {
    "nvidia-tesla-t4".to_string()
}

fn default_teardown_timeout_secs() -> u64 {
    600
}

fn default_teardown_poll_secs() -> u64 {
    5
}

fn default_aggregation_retry_delay_secs() -> u64 {
    2
}

fn default_aggregation_max_attempts() -> u32 {
    60
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// A parsed experiment file plus where it lives.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: SweepConfig,
    pub experiment_dir: PathBuf,
}

impl LoadedConfig {
    pub fn logs_dir(&self) -> PathBuf {
        self.experiment_dir.join("logs")
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.experiment_dir.join("configs")
    }
}

pub fn load_config(path: &Path) -> Result<LoadedConfig> {
    let raw_yaml = fs::read_to_string(path)?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw_yaml)?;
    let raw: Value = serde_json::to_value(yaml_value)?;
    let config = parse_config(&raw)?;

    let file_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_dir = file_dir
        .canonicalize()
        .unwrap_or_else(|_| file_dir.to_path_buf());
    let experiment_dir = match &config.experiment.dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => file_dir.join(dir),
        None => file_dir,
    };
    Ok(LoadedConfig {
        config,
        experiment_dir,
    })
}

pub fn parse_config(raw: &Value) -> Result<SweepConfig> {
    validate_required_fields(raw)?;
    let config: SweepConfig = serde_json::from_value(raw.clone())
        .map_err(|e| SweepError::config(format!("invalid experiment file: {}", e)))?;
    config.validate()?;
    Ok(config)
}

const REQUIRED_POINTERS: &[&str] = &[
    "/experiment/id",
    "/experiment/executable",
    "/design/seeds",
    "/design/max_concurrent",
    "/runtime/backend",
    "/configs",
];

/// Report every missing required field at once.
pub fn validate_required_fields(raw: &Value) -> Result<()> {
    let missing: Vec<&str> = REQUIRED_POINTERS
        .iter()
        .copied()
        .filter(|p| raw.pointer(p).map(Value::is_null).unwrap_or(true))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SweepError::config(format!(
            "missing required fields: {}",
            missing.join(", ")
        )))
    }
}

impl SweepConfig {
    /// Semantic checks run after parsing and again after CLI overrides.
    pub fn validate(&self) -> Result<()> {
        if self.experiment.executable.is_empty() {
            return Err(SweepError::config("/experiment/executable must not be empty"));
        }
        if self.design.seeds == 0 {
            return Err(SweepError::config("/design/seeds must be at least 1"));
        }
        if self
            .design
            .base_seed
            .checked_add(self.design.seeds as u64)
            .is_none()
        {
            return Err(SweepError::config(
                "/design/base_seed plus /design/seeds overflows the seed range",
            ));
        }
        if self.design.max_concurrent == 0 {
            return Err(SweepError::config("/design/max_concurrent must be at least 1"));
        }
        if self.design.batch_size == Some(0) {
            return Err(SweepError::config("/design/batch_size must be at least 1"));
        }
        if self.design.submit_attempts == 0 {
            return Err(SweepError::config("/design/submit_attempts must be at least 1"));
        }
        if self.runtime.backend == BackendKind::CloudVm && self.runtime.cloud.is_none() {
            return Err(SweepError::config("backend cloud_vm requires /runtime/cloud"));
        }
        validate_payloads(&self.configs)
    }
}

/// Payload ids become directory and file names, so they must be unique and
/// path-safe.
pub fn validate_payloads(payloads: &[ConfigPayload]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for payload in payloads {
        let id = payload.id.as_str();
        let safe = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c));
        if !safe {
            return Err(SweepError::config(format!(
                "config id '{}' must be non-empty ascii [A-Za-z0-9-_.] and not start with '.'",
                id
            )));
        }
        if !seen.insert(id) {
            return Err(SweepError::config(format!("duplicate config id '{}'", id)));
        }
        if !payload.params.is_object() {
            return Err(SweepError::config(format!(
                "config '{}': params must be a mapping",
                id
            )));
        }
    }
    Ok(())
}
