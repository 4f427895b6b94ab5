use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sweep_core::{atomic_write_bytes, ensure_dir, Result, SweepError};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const BUNDLE_SCHEMA_VERSION: &str = "result_bundle_v1";

/// One seed's output, written by the training program into its log dir.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedArtifact {
    pub seed: u64,
    /// Metric name to per-iteration values.
    pub metrics: BTreeMap<String, Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

/// How seed series of unequal length are aligned. Only truncation exists;
/// it is recorded in every bundle so the loss is visible to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentPolicy {
    TruncateToShortest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBundle {
    pub schema_version: String,
    pub config_id: String,
    pub seeds: Vec<u64>,
    pub policy: AlignmentPolicy,
    /// Number of aligned steps per metric.
    pub steps: BTreeMap<String, usize>,
    /// Original per-seed lengths (in `seeds` order) of metrics that were cut.
    pub truncated: BTreeMap<String, Vec<usize>>,
    /// Metrics missing from at least one seed.
    pub dropped_metrics: Vec<String>,
    pub metrics: BTreeMap<String, MetricSummary>,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    /// Delete the per-seed artifacts once the bundle is durable.
    pub cleanup_seed_artifacts: bool,
}

#[derive(Debug, Clone)]
pub struct AggregateReport {
    pub bundle_path: PathBuf,
    pub bundle: ResultBundle,
    pub superseded: bool,
    pub removed_seed_artifacts: usize,
}

pub fn group_dir(logs_dir: &Path, config_id: &str) -> PathBuf {
    logs_dir.join(config_id)
}

pub fn seed_artifact_path(group_dir: &Path, seed: u64) -> PathBuf {
    group_dir.join(format!("seed_{}.json", seed))
}

pub fn bundle_path(logs_dir: &Path, config_id: &str) -> PathBuf {
    logs_dir.join(format!("{}.bundle.json", config_id))
}

/// Seed artifacts present directly under `group_dir`, sorted by path.
pub fn list_seed_artifacts(group_dir: &Path) -> Result<Vec<PathBuf>> {
    if !group_dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(group_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| SweepError::Aggregation(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with("seed_") && name.ends_with(".json") {
            out.push(entry.path().to_path_buf());
        }
    }
    out.sort();
    Ok(out)
}

pub fn load_seed_artifact(path: &Path) -> Result<SeedArtifact> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn write_seed_artifact(group_dir: &Path, artifact: &SeedArtifact) -> Result<PathBuf> {
    ensure_dir(group_dir)?;
    let path = seed_artifact_path(group_dir, artifact.seed);
    let bytes = serde_json::to_vec_pretty(artifact)?;
    atomic_write_bytes(&path, &bytes)?;
    Ok(path)
}

/// Remove the artifact for `seed` if one is already on disk. Returns whether
/// a file was removed.
pub fn discard_seed_artifact(group_dir: &Path, seed: u64) -> Result<bool> {
    match fs::remove_file(seed_artifact_path(group_dir, seed)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Merge seed artifacts into a bundle. Pure: no filesystem access.
///
/// Series are aligned by iteration index and cut to the shortest seed.
/// Mean and population standard deviation are accumulated with Welford's
/// update so identical inputs reproduce exactly.
pub fn merge_seeds(config_id: &str, artifacts: &[SeedArtifact]) -> Result<ResultBundle> {
    if artifacts.is_empty() {
        return Err(SweepError::Aggregation(format!(
            "no seed artifacts to merge for {}",
            config_id
        )));
    }
    let mut sorted: Vec<&SeedArtifact> = artifacts.iter().collect();
    sorted.sort_by_key(|a| a.seed);
    let seeds: Vec<u64> = sorted.iter().map(|a| a.seed).collect();
    let unique: BTreeSet<u64> = seeds.iter().copied().collect();
    if unique.len() != seeds.len() {
        return Err(SweepError::Aggregation(format!(
            "duplicate seeds in artifacts for {}: {:?}",
            config_id, seeds
        )));
    }

    let all_names: BTreeSet<&String> = sorted.iter().flat_map(|a| a.metrics.keys()).collect();
    let mut steps = BTreeMap::new();
    let mut truncated = BTreeMap::new();
    let mut dropped_metrics = Vec::new();
    let mut metrics = BTreeMap::new();

    for name in all_names {
        let series: Option<Vec<&Vec<f64>>> = sorted.iter().map(|a| a.metrics.get(name)).collect();
        let Some(series) = series else {
            warn!(config_id, metric = %name, "metric missing from some seeds, dropped");
            dropped_metrics.push(name.clone());
            continue;
        };
        let lengths: Vec<usize> = series.iter().map(|s| s.len()).collect();
        let len = lengths.iter().copied().min().unwrap_or(0);
        if lengths.iter().any(|l| *l != len) {
            warn!(
                config_id,
                metric = %name,
                ?lengths,
                kept = len,
                "seed series differ in length, truncating to shortest"
            );
            truncated.insert(name.clone(), lengths);
        }

        let mut mean = Vec::with_capacity(len);
        let mut std = Vec::with_capacity(len);
        for step in 0..len {
            let mut m = 0.0_f64;
            let mut m2 = 0.0_f64;
            for (k, values) in series.iter().enumerate() {
                let x = values[step];
                let prev = m;
                m += (x - prev) / (k as f64 + 1.0);
                m2 += (x - prev) * (x - m);
            }
            mean.push(m);
            std.push((m2 / series.len() as f64).sqrt());
        }
        steps.insert(name.clone(), len);
        metrics.insert(name.clone(), MetricSummary { mean, std });
    }

    Ok(ResultBundle {
        schema_version: BUNDLE_SCHEMA_VERSION.to_string(),
        config_id: config_id.to_string(),
        seeds,
        policy: AlignmentPolicy::TruncateToShortest,
        steps,
        truncated,
        dropped_metrics,
        metrics,
    })
}

/// Aggregate one evaluation group if all of its seed artifacts are on disk.
///
/// Returns `AggregationIncomplete` when some expected artifact has not been
/// flushed yet; callers retry later. Any previous bundle with the same
/// identity is deleted before the new one is written.
pub fn aggregate_group(
    logs_dir: &Path,
    config_id: &str,
    seeds: &[u64],
    options: &AggregateOptions,
) -> Result<AggregateReport> {
    let dir = group_dir(logs_dir, config_id);
    let expected: Vec<PathBuf> = seeds.iter().map(|s| seed_artifact_path(&dir, *s)).collect();
    let found = expected.iter().filter(|p| p.is_file()).count();
    if found < expected.len() {
        debug!(config_id, expected = expected.len(), found, "seed artifacts not all flushed");
        return Err(SweepError::AggregationIncomplete {
            config_id: config_id.to_string(),
            expected: expected.len(),
            found,
        });
    }
    let on_disk = list_seed_artifacts(&dir)?.len();
    if on_disk > expected.len() {
        debug!(config_id, on_disk, expected = expected.len(), "ignoring extra seed artifacts");
    }

    let mut artifacts = Vec::with_capacity(expected.len());
    for (path, seed) in expected.iter().zip(seeds) {
        let artifact = load_seed_artifact(path)?;
        if artifact.seed != *seed {
            return Err(SweepError::Aggregation(format!(
                "{} declares seed {} but was expected to hold seed {}",
                path.display(),
                artifact.seed,
                seed
            )));
        }
        artifacts.push(artifact);
    }
    let bundle = merge_seeds(config_id, &artifacts)?;

    let out_path = bundle_path(logs_dir, config_id);
    let superseded = out_path.exists();
    if superseded {
        fs::remove_file(&out_path)?;
    }
    let mut bytes = serde_json::to_vec_pretty(&bundle)?;
    bytes.push(b'\n');
    atomic_write_bytes(&out_path, &bytes)?;
    info!(
        config_id,
        seeds = bundle.seeds.len(),
        path = %out_path.display(),
        superseded,
        "wrote result bundle"
    );

    let mut removed = 0;
    if options.cleanup_seed_artifacts {
        for path in &expected {
            fs::remove_file(path)?;
            removed += 1;
        }
    }

    Ok(AggregateReport {
        bundle_path: out_path,
        bundle,
        superseded,
        removed_seed_artifacts: removed,
    })
}

/// Explicitly discard any existing bundle and recompute it from the seeds.
pub fn supersede_bundle(
    logs_dir: &Path,
    config_id: &str,
    seeds: &[u64],
    options: &AggregateOptions,
) -> Result<AggregateReport> {
    let stale = bundle_path(logs_dir, config_id);
    if stale.exists() {
        info!(config_id, path = %stale.display(), "removing stale result bundle");
        fs::remove_file(&stale)?;
    }
    aggregate_group(logs_dir, config_id, seeds, options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(seed: u64, metrics: &[(&str, Vec<f64>)]) -> SeedArtifact {
        SeedArtifact {
            seed,
            metrics: metrics
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn identical_seeds_give_exact_mean_and_zero_std() {
        let values = vec![0.1, 0.7, 1e-9, 12345.678];
        let seeds: Vec<SeedArtifact> = (0..7)
            .map(|s| artifact(s, &[("loss", values.clone())]))
            .collect();
        let bundle = merge_seeds("cfg", &seeds).expect("merge");
        let loss = &bundle.metrics["loss"];
        assert_eq!(loss.mean, values);
        assert!(loss.std.iter().all(|s| *s == 0.0), "std: {:?}", loss.std);
    }

    #[test]
    fn mean_and_population_std() {
        let seeds = vec![
            artifact(0, &[("acc", vec![1.0, 2.0])]),
            artifact(1, &[("acc", vec![3.0, 2.0])]),
        ];
        let bundle = merge_seeds("cfg", &seeds).expect("merge");
        assert_eq!(bundle.metrics["acc"].mean, vec![2.0, 2.0]);
        assert_eq!(bundle.metrics["acc"].std, vec![1.0, 0.0]);
    }

    #[test]
    fn uneven_series_are_truncated_and_recorded() {
        let seeds = vec![
            artifact(2, &[("loss", vec![1.0, 1.0, 1.0])]),
            artifact(0, &[("loss", vec![3.0, 3.0])]),
        ];
        let bundle = merge_seeds("cfg", &seeds).expect("merge");
        assert_eq!(bundle.seeds, vec![0, 2]);
        assert_eq!(bundle.steps["loss"], 2);
        assert_eq!(bundle.truncated["loss"], vec![2, 3]);
        assert_eq!(bundle.metrics["loss"].mean, vec![2.0, 2.0]);
        assert_eq!(bundle.policy, AlignmentPolicy::TruncateToShortest);
    }

    #[test]
    fn metrics_missing_from_a_seed_are_dropped() {
        let seeds = vec![
            artifact(0, &[("loss", vec![1.0]), ("lr", vec![0.1])]),
            artifact(1, &[("loss", vec![3.0])]),
        ];
        let bundle = merge_seeds("cfg", &seeds).expect("merge");
        assert_eq!(bundle.dropped_metrics, vec!["lr".to_string()]);
        assert!(bundle.metrics.contains_key("loss"));
        assert!(!bundle.metrics.contains_key("lr"));
    }

    #[test]
    fn duplicate_seeds_are_rejected() {
        let seeds = vec![artifact(1, &[]), artifact(1, &[])];
        assert!(merge_seeds("cfg", &seeds).is_err());
        assert!(merge_seeds("cfg", &[]).is_err());
    }

    #[test]
    fn aggregate_defers_until_all_seeds_flushed() {
        let logs = tempfile::tempdir().expect("tempdir");
        let dir = group_dir(logs.path(), "cfg");
        write_seed_artifact(&dir, &artifact(0, &[("loss", vec![1.0])])).expect("write");
        write_seed_artifact(&dir, &artifact(1, &[("loss", vec![2.0])])).expect("write");

        let err = aggregate_group(logs.path(), "cfg", &[0, 1, 2], &AggregateOptions::default())
            .expect_err("must defer");
        match err {
            SweepError::AggregationIncomplete { expected, found, .. } => {
                assert_eq!((expected, found), (3, 2));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!bundle_path(logs.path(), "cfg").exists());

        write_seed_artifact(&dir, &artifact(2, &[("loss", vec![3.0])])).expect("write");
        let report = aggregate_group(logs.path(), "cfg", &[0, 1, 2], &AggregateOptions::default())
            .expect("aggregate");
        assert_eq!(report.bundle.metrics["loss"].mean, vec![2.0]);
        assert!(!report.superseded);
    }

    #[test]
    fn aggregate_twice_is_byte_identical() {
        let logs = tempfile::tempdir().expect("tempdir");
        let dir = group_dir(logs.path(), "cfg");
        for seed in 0..3 {
            let loss: Vec<f64> = (0..20).map(|i| (i as f64 + seed as f64) * 0.37).collect();
            write_seed_artifact(&dir, &artifact(seed, &[("loss", loss)])).expect("write");
        }
        let options = AggregateOptions::default();
        let first = aggregate_group(logs.path(), "cfg", &[0, 1, 2], &options).expect("first");
        let first_bytes = fs::read(&first.bundle_path).expect("read");
        let second = aggregate_group(logs.path(), "cfg", &[0, 1, 2], &options).expect("second");
        let second_bytes = fs::read(&second.bundle_path).expect("read");
        assert!(second.superseded);
        assert_eq!(first_bytes, second_bytes);
    }

    #[test]
    fn cleanup_removes_seed_artifacts_after_write() {
        let logs = tempfile::tempdir().expect("tempdir");
        let dir = group_dir(logs.path(), "cfg");
        for seed in 0..2 {
            write_seed_artifact(&dir, &artifact(seed, &[("loss", vec![1.0])])).expect("write");
        }
        let report = aggregate_group(
            logs.path(),
            "cfg",
            &[0, 1],
            &AggregateOptions {
                cleanup_seed_artifacts: true,
            },
        )
        .expect("aggregate");
        assert_eq!(report.removed_seed_artifacts, 2);
        assert!(report.bundle_path.exists());
        assert!(list_seed_artifacts(&dir).expect("list").is_empty());
    }

    #[test]
    fn supersede_replaces_stale_bundle() {
        let logs = tempfile::tempdir().expect("tempdir");
        let stale = bundle_path(logs.path(), "cfg");
        atomic_write_bytes(&stale, b"{\"partial\": true}").expect("stale");
        let dir = group_dir(logs.path(), "cfg");
        write_seed_artifact(&dir, &artifact(0, &[("loss", vec![4.0])])).expect("write");

        let report = supersede_bundle(logs.path(), "cfg", &[0], &AggregateOptions::default())
            .expect("supersede");
        let loaded: ResultBundle =
            serde_json::from_slice(&fs::read(&report.bundle_path).expect("read")).expect("parse");
        assert_eq!(loaded, report.bundle);
        assert_eq!(loaded.metrics["loss"].mean, vec![4.0]);
    }

    #[test]
    fn list_ignores_temp_and_unrelated_files() {
        let logs = tempfile::tempdir().expect("tempdir");
        let dir = group_dir(logs.path(), "cfg");
        write_seed_artifact(&dir, &artifact(5, &[])).expect("write");
        fs::write(dir.join(".seed_6.json.tmp.1.2"), b"{}").expect("tmp");
        fs::write(dir.join("stdout.log"), b"").expect("log");
        ensure_dir(&dir.join(".sweep")).expect("transient");
        let listed = list_seed_artifacts(&dir).expect("list");
        assert_eq!(listed, vec![seed_artifact_path(&dir, 5)]);
    }

    #[test]
    fn discard_removes_only_the_named_seed() {
        let logs = tempfile::tempdir().expect("tempdir");
        let dir = group_dir(logs.path(), "cfg");
        write_seed_artifact(&dir, &artifact(0, &[("loss", vec![999.0])])).expect("write");
        write_seed_artifact(&dir, &artifact(1, &[("loss", vec![999.0])])).expect("write");
        assert!(discard_seed_artifact(&dir, 0).expect("discard"));
        assert!(!discard_seed_artifact(&dir, 0).expect("already gone"));
        assert!(!discard_seed_artifact(&group_dir(logs.path(), "missing"), 3).expect("no dir"));
        assert_eq!(
            list_seed_artifacts(&dir).expect("list"),
            vec![seed_artifact_path(&dir, 1)]
        );
    }
}
