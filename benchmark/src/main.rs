mod workload;

use std::fs::{File, create_dir_all};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use tidemark::IsolationLevel;
use tracing_subscriber::EnvFilter;

use workload::{KillPlan, RunMeasurement, WorkloadConfig};

#[derive(Parser, Debug)]
#[command(name = "tidemark-benchmark")]
struct Args {
    /// Label for this run (used in output).
    #[arg(long, default_value = "run")]
    label: String,

    /// Number of transactions to run.
    #[arg(long, default_value_t = 1000)]
    transactions: usize,

    /// Operations per transaction.
    #[arg(long, default_value_t = 4)]
    ops_per_txn: usize,

    /// Share of operations that are reads, in percent.
    #[arg(long, default_value_t = 50)]
    read_percent: u32,

    /// Size of the key space.
    #[arg(long, default_value_t = 1000)]
    keys: usize,

    /// Number of parallel client workers to run.
    #[arg(long, default_value_t = 5)]
    threads: usize,

    #[arg(long, default_value_t = 3)]
    nodes: u32,

    #[arg(long, default_value_t = 32)]
    partitions: u32,

    #[arg(long, value_enum, default_value_t = IsolationArg::RepeatableRead)]
    isolation: IsolationArg,

    /// Age in ms after which open transactions are expired.
    #[arg(long, default_value_t = 200)]
    max_age_ms: u64,

    /// Optional transaction index at which to kill a node.
    #[arg(long)]
    kill_at: Option<usize>,

    /// Node id to kill when `--kill-at` is set.
    #[arg(long, default_value_t = 1)]
    kill_node_id: u32,

    /// Number of times to run the experiment (the fastest and slowest are
    /// trimmed when there are more than two).
    #[arg(long, default_value_t = 5)]
    runs: usize,

    /// Optional directory to write the JSON report to.
    #[arg(long)]
    report_dir: Option<PathBuf>,
}

#[derive(Serialize)]
struct RunSnapshot {
    run: usize,
    duration_ms: u128,
    ops: usize,
    commits: usize,
    conflicts: usize,
    expired: usize,
    failures: usize,
    commits_per_sec: f64,
}

#[derive(Serialize)]
struct TrimmedStats {
    runs_used: usize,
    mean_ms: f64,
    commits_per_sec: f64,
    durations_ms: Vec<u128>,
}

#[derive(Serialize)]
struct ExperimentReport {
    name: String,
    runs: Vec<RunSnapshot>,
    trimmed: TrimmedStats,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let workload = WorkloadConfig {
        transactions: args.transactions,
        ops_per_txn: args.ops_per_txn,
        read_percent: args.read_percent.min(100),
        keys: args.keys,
        threads: args.threads,
        nodes: args.nodes,
        partitions: args.partitions,
        isolation: args.isolation.into(),
        max_age: Duration::from_millis(args.max_age_ms),
        kill: args.kill_at.map(|at_txn| KillPlan {
            at_txn,
            node: args.kill_node_id,
        }),
    };

    println!("=== {} ===", args.label);
    let mut runs = Vec::new();
    for run_idx in 0..args.runs {
        let measurement = workload::run_workload(&workload, run_idx).await?;
        println!(
            "  run {:>2}: {:>8.2?} ({:.1} commits/s, conflicts={}, expired={}, failures={})",
            run_idx + 1,
            measurement.duration,
            commits_per_sec(&measurement),
            measurement.conflicts,
            measurement.expired,
            measurement.failures
        );
        runs.push(measurement);
    }

    let report = summarize(&args.label, &runs);
    println!(
        "  trimmed (middle {}): mean {:.2} ms, {:.1} commits/s",
        report.trimmed.runs_used, report.trimmed.mean_ms, report.trimmed.commits_per_sec
    );
    if let Some(dir) = &args.report_dir {
        create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", args.label));
        serde_json::to_writer_pretty(File::create(&path)?, &report)?;
        println!("    wrote {}", path.display());
    } else {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(())
}

fn commits_per_sec(run: &RunMeasurement) -> f64 {
    run.commits as f64 / run.duration.as_secs_f64().max(f64::EPSILON)
}

fn summarize(label: &str, runs: &[RunMeasurement]) -> ExperimentReport {
    let snapshots = runs
        .iter()
        .enumerate()
        .map(|(idx, run)| RunSnapshot {
            run: idx + 1,
            duration_ms: run.duration.as_millis(),
            ops: run.ops,
            commits: run.commits,
            conflicts: run.conflicts,
            expired: run.expired,
            failures: run.failures,
            commits_per_sec: commits_per_sec(run),
        })
        .collect();

    ExperimentReport {
        name: label.to_string(),
        runs: snapshots,
        trimmed: trim_runs(runs),
    }
}

fn trim_runs(runs: &[RunMeasurement]) -> TrimmedStats {
    let mut ordered = runs
        .iter()
        .map(|run| (run.duration.as_millis(), commits_per_sec(run)))
        .collect::<Vec<_>>();
    ordered.sort_by_key(|(d, _)| *d);

    let slice: Vec<(u128, f64)> = if ordered.len() > 2 {
        ordered[1..ordered.len() - 1].to_vec()
    } else {
        ordered
    };
    if slice.is_empty() {
        return TrimmedStats {
            runs_used: 0,
            mean_ms: 0.0,
            commits_per_sec: 0.0,
            durations_ms: Vec::new(),
        };
    }

    let durations_ms = slice.iter().map(|(d, _)| *d).collect::<Vec<_>>();
    let mean_ms = durations_ms.iter().copied().sum::<u128>() as f64 / (durations_ms.len() as f64);
    let commits_per_sec = slice.iter().map(|(_, rate)| *rate).sum::<f64>() / (slice.len() as f64);

    TrimmedStats {
        runs_used: slice.len(),
        mean_ms,
        commits_per_sec,
        durations_ms,
    }
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum IsolationArg {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl From<IsolationArg> for IsolationLevel {
    fn from(arg: IsolationArg) -> Self {
        match arg {
            IsolationArg::ReadUncommitted => IsolationLevel::ReadUncommitted,
            IsolationArg::ReadCommitted => IsolationLevel::ReadCommitted,
            IsolationArg::RepeatableRead => IsolationLevel::RepeatableRead,
            IsolationArg::Serializable => IsolationLevel::Serializable,
        }
    }
}
