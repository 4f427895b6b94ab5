//! Merges per-seed result artifacts into one bundle per evaluation.

mod aggregate;

pub use aggregate::{
    aggregate_group, bundle_path, discard_seed_artifact, group_dir, list_seed_artifacts, load_seed_artifact,
    merge_seeds, seed_artifact_path, supersede_bundle, write_seed_artifact, AggregateOptions,
    AggregateReport, AlignmentPolicy, MetricSummary, ResultBundle, SeedArtifact,
    BUNDLE_SCHEMA_VERSION,
};
