use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sweep_analysis::discard_seed_artifact;
use sweep_core::{BackendKind, JobDescriptor, JobHandle, JobId, JobState, Result};
use tracing::{debug, info, warn};

use crate::backend::{Backend, PollStatus};

/// One seed of one configuration, bound to the backend that runs it.
///
/// The backend is resolved once when the job is built; nothing downstream
/// inspects `backend_kind` again.
pub struct Job {
    descriptor: JobDescriptor,
    backend: Arc<dyn Backend>,
    pub(crate) state: JobState,
    pub(crate) handle: Option<JobHandle>,
    /// Sync mode batch index; always 0 in async mode.
    pub(crate) batch: usize,
    pub(crate) attempts: u32,
    pub(crate) retry_at: Option<DateTime<Utc>>,
    pub(crate) submitted_at: Option<DateTime<Utc>>,
    pub(crate) terminal_at: Option<DateTime<Utc>>,
    pub(crate) error: Option<String>,
    cleaned: bool,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.descriptor.id())
            .field("backend", &self.backend.kind())
            .field("state", &self.state)
            .field("handle", &self.handle)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl Job {
    pub fn new(descriptor: JobDescriptor, backend: Arc<dyn Backend>, batch: usize) -> Self {
        Self {
            descriptor,
            backend,
            state: JobState::Queued,
            handle: None,
            batch,
            attempts: 0,
            retry_at: None,
            submitted_at: None,
            terminal_at: None,
            error: None,
            cleaned: false,
        }
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> JobId {
        self.descriptor.id()
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn handle(&self) -> Option<&JobHandle> {
        self.handle.as_ref()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Hand the job to its backend. Counts the attempt whatever the outcome.
    /// Submit one attempt. Any artifact this seed left in `group_dir` from an
    /// earlier run is removed first so it cannot stand in for this run's.
    pub(crate) fn submit(&mut self, group_dir: &Path) -> Result<JobHandle> {
        self.attempts += 1;
        if discard_seed_artifact(group_dir, self.descriptor.seed)? {
            info!(job = %self.id(), "removed stale seed artifact");
        }
        self.backend.submit(&self.descriptor)
    }

    /// Poll a submitted job. A job without a handle has nothing to ask about.
    pub(crate) fn poll(&self) -> Option<Result<PollStatus>> {
        self.handle
            .as_ref()
            .map(|handle| self.backend.poll(handle, &self.descriptor))
    }

    pub(crate) fn terminate(&self) {
        if let Some(handle) = &self.handle {
            if let Err(e) = self.backend.terminate(handle, &self.descriptor) {
                warn!(job = %self.id(), %handle, error = %e, "terminate failed");
            }
        }
    }

    /// Release backend resources once. Errors are logged; a job that has
    /// already reached a terminal state keeps it.
    pub(crate) fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        let Some(handle) = &self.handle else {
            return;
        };
        match self.backend.cleanup(handle, &self.descriptor) {
            Ok(()) => debug!(job = %self.id(), %handle, "cleaned up"),
            Err(e) => warn!(job = %self.id(), %handle, error = %e, "cleanup failed"),
        }
    }

    pub fn record(&self) -> JobRecord {
        JobRecord {
            config_id: self.descriptor.config_id.clone(),
            seed: self.descriptor.seed,
            backend: self.backend.kind(),
            state: self.state,
            handle: self.handle.clone(),
            batch: self.batch,
            attempts: self.attempts,
            submitted_at: self.submitted_at,
            terminal_at: self.terminal_at,
            error: self.error.clone(),
        }
    }
}

/// What happened to one job over a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub config_id: String,
    pub seed: u64,
    pub backend: BackendKind,
    pub state: JobState,
    pub handle: Option<JobHandle>,
    pub batch: usize,
    pub attempts: u32,
    pub submitted_at: Option<DateTime<Utc>>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl JobRecord {
    pub fn id(&self) -> JobId {
        JobId {
            config_id: self.config_id.clone(),
            seed: self.seed,
        }
    }
}
