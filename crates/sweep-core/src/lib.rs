//! Shared types and filesystem helpers for the sweep workspace.

mod error;
mod fsutil;
mod types;

pub use error::{Result, SweepError};
pub use fsutil::{
    atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir,
    sha256_bytes,
};
pub use types::{BackendKind, JobDescriptor, JobHandle, JobId, JobState, ResourceRequest};
