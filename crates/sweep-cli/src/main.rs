use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use sweep_analysis::{supersede_bundle, AggregateOptions};
use sweep_core::BackendKind;
use sweep_runner::{EvaluationResult, ExperimentSummary, Mode, RunOptions, RunResult};
use tracing::debug;

#[derive(Parser)]
#[command(name = "sweep", version = "0.3.0", about = "Multi-backend experiment sweep runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    #[value(name = "local")]
    Local,
    #[value(name = "slurm")]
    Slurm,
    #[value(name = "sge")]
    Sge,
    #[value(name = "cloud_vm")]
    CloudVm,
}

impl From<BackendArg> for BackendKind {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Local => BackendKind::Local,
            BackendArg::Slurm => BackendKind::Slurm,
            BackendArg::Sge => BackendKind::Sge,
            BackendArg::CloudVm => BackendKind::CloudVm,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    #[value(name = "sync")]
    Sync,
    #[value(name = "async")]
    Async,
}

impl From<ModeArg> for Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Sync => Mode::Sync,
            ModeArg::Async => Mode::Async,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Submit every configuration x seed and wait for all bundles.
    Run {
        experiment: PathBuf,
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        #[arg(long)]
        max_concurrent: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        poll_interval_secs: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    Describe {
        experiment: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Recompute one evaluation's bundle from its seed artifacts.
    Aggregate {
        #[arg(long)]
        logs_dir: PathBuf,
        #[arg(long)]
        config_id: String,
        #[arg(long)]
        seeds: u64,
        #[arg(long, default_value_t = 0)]
        base_seed: u64,
        #[arg(long)]
        cleanup: bool,
        #[arg(long)]
        json: bool,
    },
}

/// What a command prints and the process exit code.
struct CommandOutput {
    payload: Option<Value>,
    exit_code: i32,
}

impl CommandOutput {
    fn ok(payload: Option<Value>) -> Self {
        Self {
            payload,
            exit_code: 0,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(output) => {
            if let Some(payload) = &output.payload {
                emit_json(payload);
            }
            if output.exit_code != 0 {
                std::process::exit(output.exit_code);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<CommandOutput> {
    match command {
        Commands::Run {
            experiment,
            backend,
            mode,
            max_concurrent,
            batch_size,
            poll_interval_secs,
            json,
        } => {
            let options = RunOptions {
                backend: backend.map(Into::into),
                mode: mode.map(Into::into),
                max_concurrent,
                batch_size,
                poll_interval_secs,
                ..RunOptions::default()
            };
            let summary = sweep_runner::describe_experiment_with_options(&experiment, &options)?;
            debug!(total_jobs = summary.total_jobs, "experiment loaded");
            let result = sweep_runner::run_experiment(&experiment, &options)?;
            let exit_code = if result.outcome.is_success() { 0 } else { 1 };
            if json {
                return Ok(CommandOutput {
                    payload: Some(json!({
                        "ok": exit_code == 0,
                        "command": "run",
                        "summary": summary_to_json(&summary),
                        "run": run_result_to_json(&result),
                    })),
                    exit_code,
                });
            }
            print_summary(&summary);
            print_run_result(&result);
            Ok(CommandOutput {
                payload: None,
                exit_code,
            })
        }
        Commands::Describe { experiment, json } => {
            let summary = sweep_runner::describe_experiment(&experiment)?;
            if json {
                return Ok(CommandOutput::ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary),
                }))));
            }
            print_summary(&summary);
            Ok(CommandOutput::ok(None))
        }
        Commands::Aggregate {
            logs_dir,
            config_id,
            seeds,
            base_seed,
            cleanup,
            json,
        } => {
            let seed_list = seed_range(base_seed, seeds)?;
            let options = AggregateOptions {
                cleanup_seed_artifacts: cleanup,
            };
            let report = supersede_bundle(&logs_dir, &config_id, &seed_list, &options)?;
            if json {
                return Ok(CommandOutput::ok(Some(json!({
                    "ok": true,
                    "command": "aggregate",
                    "config_id": config_id,
                    "bundle_path": report.bundle_path.display().to_string(),
                    "superseded": report.superseded,
                    "removed_seed_artifacts": report.removed_seed_artifacts,
                    "bundle": report.bundle,
                }))));
            }
            println!("bundle: {}", report.bundle_path.display());
            println!("seeds: {:?}", report.bundle.seeds);
            println!("superseded: {}", report.superseded);
            for (metric, steps) in &report.bundle.steps {
                println!("metric {}: {} steps", metric, steps);
            }
            if !report.bundle.dropped_metrics.is_empty() {
                println!("dropped_metrics: {:?}", report.bundle.dropped_metrics);
            }
            if cleanup {
                println!("removed_seed_artifacts: {}", report.removed_seed_artifacts);
            }
            Ok(CommandOutput::ok(None))
        }
    }
}

fn seed_range(base_seed: u64, seeds: u64) -> Result<Vec<u64>> {
    let end = base_seed.checked_add(seeds).ok_or_else(|| {
        anyhow!(
            "--base-seed {} plus --seeds {} does not fit in a u64 seed",
            base_seed,
            seeds
        )
    })?;
    Ok((base_seed..end).collect())
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Aggregate { json, .. } => *json,
    }
}

fn summary_to_json(summary: &ExperimentSummary) -> Value {
    serde_json::to_value(summary).unwrap_or_else(|_| json!({}))
}

fn run_result_to_json(result: &RunResult) -> Value {
    json!({
        "run_id": result.run_id,
        "experiment_dir": result.experiment_dir.display().to_string(),
        "logs_dir": result.logs_dir.display().to_string(),
        "cancelled": result.outcome.cancelled,
        "ticks": result.outcome.ticks.len(),
        "evaluations": result.outcome.per_evaluation,
        "jobs": result.outcome.jobs,
    })
}

fn print_summary(summary: &ExperimentSummary) {
    println!("experiment: {}", summary.experiment_id);
    println!("experiment_dir: {}", summary.experiment_dir.display());
    println!("backend: {}", summary.backend);
    println!("mode: {}", summary.mode);
    println!("max_concurrent: {}", summary.max_concurrent);
    if let Some(b) = summary.batch_size {
        println!("batch_size: {}", b);
    }
    println!("configs: {}", summary.config_count);
    println!("seeds_per_config: {}", summary.seeds_per_config);
    println!("total_jobs: {}", summary.total_jobs);
    println!("batches: {}", summary.num_batches);
    println!("command: {:?}", summary.command_preview);
    if summary.existing_seed_artifacts > 0 || summary.existing_bundles > 0 {
        println!(
            "existing: {} seed artifacts, {} bundles",
            summary.existing_seed_artifacts, summary.existing_bundles
        );
    }
}

fn print_run_result(result: &RunResult) {
    println!("run_id: {}", result.run_id);
    println!("logs_dir: {}", result.logs_dir.display());
    for evaluation in &result.outcome.per_evaluation {
        match &evaluation.result {
            EvaluationResult::Bundle { path, .. } => {
                println!("{}: ok -> {}", evaluation.config_id, path.display())
            }
            EvaluationResult::Failure(record) => println!(
                "{}: {:?} (seeds {:?}): {}",
                evaluation.config_id, record.reason, record.failed_seeds, record.message
            ),
        }
    }
    let failures = result.outcome.failures().count();
    if failures > 0 {
        println!(
            "{} of {} evaluations failed",
            failures,
            result.outcome.per_evaluation.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_range_starts_at_base_seed() {
        assert_eq!(seed_range(10, 3).unwrap(), vec![10, 11, 12]);
        assert_eq!(seed_range(u64::MAX - 2, 2).unwrap(), vec![u64::MAX - 2, u64::MAX - 1]);
        assert!(seed_range(7, 0).unwrap().is_empty());
    }

    #[test]
    fn seed_range_overflow_is_an_error() {
        let err = seed_range(u64::MAX, 1).expect_err("overflow");
        assert!(err.to_string().contains("--base-seed"), "{}", err);
    }
}
