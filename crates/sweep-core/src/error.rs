use thiserror::Error;

/// Error kinds shared by the backends, the scheduler and the aggregator.
///
/// Only `Configuration` is fatal to a run. Submission failures fail a single
/// job, transient poll failures are retried on the next tick and incomplete
/// aggregations are deferred.
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("submission of {job} failed: {message}")]
    Submission { job: String, message: String },

    #[error("status query failed: {0}")]
    TransientPoll(String),

    #[error(
        "aggregation of {config_id} incomplete: expected {expected} seed artifacts, found {found}"
    )]
    AggregationIncomplete {
        config_id: String,
        expected: usize,
        found: usize,
    },

    #[error("aggregation error: {0}")]
    Aggregation(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SweepError {
    pub fn config(message: impl Into<String>) -> Self {
        SweepError::Configuration(message.into())
    }

    /// True for errors that must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SweepError::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, SweepError>;
