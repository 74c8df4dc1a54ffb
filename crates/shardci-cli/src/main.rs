//! shardci - sharded CI test execution and coverage aggregation
//!
//! ## Commands
//!
//! - `plan`: print the deterministic tranche assignment for a corpus
//! - `run`: execute the full pipeline for a trigger event
//! - `merge`: aggregate already-stored tranche artifacts into a report
//! - `gate`: evaluate the run gate for a trigger event

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use shardci_core::{
    aggregate_coverage, plan_corpus, run_prefix, CoverageUploader, FsArtifactStore, GatePolicy,
    JobOutcome, MemoryCommentSink, Pipeline, PipelineConfig, ProcessExecutor, RetryPolicy,
    TrancheResult, TrancheStatus, TriggerEvent,
};

#[derive(Parser)]
#[command(name = "shardci")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sharded test execution and coverage aggregation", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum EventKind {
    Push,
    PullRequest,
    Manual,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the tranche assignment for a corpus as JSON
    Plan {
        /// Number of tranches
        #[arg(short, long, default_value = "4")]
        count: usize,

        /// File with one test identity per line
        #[arg(long)]
        corpus_file: PathBuf,
    },

    /// Execute the full pipeline for a trigger event
    Run {
        /// Number of tranches
        #[arg(short, long, default_value = "4")]
        count: usize,

        /// Test command template; tranche coordinates are injected via
        /// SHARDCI_TRANCHE_INDEX / SHARDCI_TRANCHE_COUNT
        #[arg(long)]
        cmd: String,

        /// File with one test identity per line
        #[arg(long)]
        corpus_file: PathBuf,

        /// Artifact store directory
        #[arg(long, default_value = ".shardci/artifacts")]
        store: PathBuf,

        /// Directory the test command writes per-tranche LCOV files into
        #[arg(long, default_value = ".shardci/coverage")]
        output_dir: PathBuf,

        /// Directory the merged report files are written to
        #[arg(long, default_value = ".shardci/report")]
        report_dir: PathBuf,

        /// Trigger event kind
        #[arg(long, value_enum, default_value = "manual")]
        event: EventKind,

        /// Ref the event fired on
        #[arg(long, default_value = "main")]
        r#ref: String,

        /// Actor who caused the event
        #[arg(long, default_value = "shardci", env = "SHARDCI_ACTOR")]
        actor: String,

        /// Target branch (pull requests)
        #[arg(long)]
        target_branch: Option<String>,

        /// PR head repository identity (pull requests)
        #[arg(long)]
        head_repo: Option<String>,

        /// Change identifier the sticky comment is tied to
        #[arg(long, default_value = "local")]
        change: String,

        /// Maximum attempts per tranche
        #[arg(long, default_value = "2")]
        max_attempts: u32,

        /// Wait between attempts, in seconds
        #[arg(long, default_value = "30")]
        wait_secs: u64,

        /// Per-attempt timeout, in seconds
        #[arg(long, default_value = "1800")]
        timeout_secs: u64,

        /// Reported outcome of a required external job, as
        /// `name=passed` or `name=failed`; repeatable
        #[arg(long = "job", value_name = "NAME=RESULT")]
        jobs: Vec<String>,

        /// Forward the merged report to the external reporting service
        #[arg(long)]
        upload: bool,
    },

    /// Aggregate already-stored tranche artifacts into a report
    Merge {
        /// Artifact store directory
        #[arg(long, default_value = ".shardci/artifacts")]
        store: PathBuf,

        /// Run id whose artifacts are merged (printed by `run`)
        #[arg(long)]
        run: String,

        /// Number of tranches the run was planned with
        #[arg(short, long, default_value = "4")]
        count: usize,

        /// Directory the merged report files are written to
        #[arg(long, default_value = ".shardci/report")]
        report_dir: PathBuf,
    },

    /// Evaluate the run gate for a trigger event and print the decision
    Gate {
        /// Trigger event kind
        #[arg(long, value_enum)]
        event: EventKind,

        /// Ref the event fired on
        #[arg(long)]
        r#ref: String,

        /// Actor who caused the event
        #[arg(long, default_value = "shardci")]
        actor: String,

        /// Target branch (pull requests)
        #[arg(long)]
        target_branch: Option<String>,

        /// PR head repository identity (pull requests)
        #[arg(long)]
        head_repo: Option<String>,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("SHARDCI_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_corpus(path: &PathBuf) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read corpus file {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

fn build_event(
    kind: EventKind,
    ref_name: String,
    actor: String,
    target_branch: Option<String>,
    head_repo: Option<String>,
) -> Result<TriggerEvent> {
    Ok(match kind {
        EventKind::Push => TriggerEvent::push(ref_name, actor),
        EventKind::Manual => TriggerEvent::manual(ref_name, actor),
        EventKind::PullRequest => {
            let target = target_branch
                .context("--target-branch is required for pull request events")?;
            let head = head_repo.context("--head-repo is required for pull request events")?;
            TriggerEvent::pull_request(ref_name, actor, target, head)
        }
    })
}

fn parse_jobs(raw: &[String]) -> Result<Vec<JobOutcome>> {
    raw.iter()
        .map(|entry| {
            let (name, result) = entry
                .split_once('=')
                .with_context(|| format!("--job '{entry}' is not NAME=RESULT"))?;
            let passed = match result {
                "passed" | "pass" | "ok" => true,
                "failed" | "fail" => false,
                other => bail!("--job result '{other}' must be passed or failed"),
            };
            Ok(JobOutcome::new(name, passed))
        })
        .collect()
}

fn write_report_files(report_dir: &PathBuf, report: &shardci_core::AggregatedReport) -> Result<()> {
    std::fs::create_dir_all(report_dir)?;
    std::fs::write(report_dir.join("coverage.lcov"), &report.lcov)?;
    std::fs::write(report_dir.join("coverage.xml"), &report.xml)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    match cli.command {
        Commands::Plan { count, corpus_file } => {
            let corpus = read_corpus(&corpus_file)?;
            let tranches = plan_corpus(&corpus, count)?;
            println!("{}", serde_json::to_string_pretty(&tranches)?);
        }

        Commands::Gate {
            event,
            r#ref,
            actor,
            target_branch,
            head_repo,
        } => {
            let event = build_event(event, r#ref, actor, target_branch, head_repo)?;
            let decision = GatePolicy::default().evaluate(&event);
            println!("{}", serde_json::to_string_pretty(&decision)?);
            if !decision.proceed {
                std::process::exit(1);
            }
        }

        Commands::Merge {
            store,
            run,
            count,
            report_dir,
        } => {
            let store = FsArtifactStore::new(&store)?;
            // Presence in the store is the record of success: absent
            // tranches are flagged as missing in the report.
            let stored = shardci_core::ArtifactStore::list_matching(&store, &run_prefix(&run))?;
            let results: Vec<TrancheResult> = (0..count)
                .map(|index| {
                    let key = shardci_core::artifact_key(&run, index);
                    let present = stored.iter().any(|(k, _)| *k == key);
                    TrancheResult {
                        index,
                        status: if present {
                            TrancheStatus::Success
                        } else {
                            TrancheStatus::Failed
                        },
                        attempts: 1,
                        artifact: None,
                        error: None,
                    }
                })
                .collect();

            let report = aggregate_coverage(&store, &run, &results)?;
            write_report_files(&report_dir, &report)?;
            println!("{}", serde_json::to_string_pretty(&report.summary)?);
            if !report.missing.is_empty() {
                info!(missing = ?report.missing, "tranches missing from merge");
            }
        }

        Commands::Run {
            count,
            cmd,
            corpus_file,
            store,
            output_dir,
            report_dir,
            event,
            r#ref,
            actor,
            target_branch,
            head_repo,
            change,
            max_attempts,
            wait_secs,
            timeout_secs,
            jobs,
            upload,
        } => {
            let corpus = read_corpus(&corpus_file)?;
            let required_jobs = parse_jobs(&jobs)?;
            let command: Vec<String> = cmd.split_whitespace().map(String::from).collect();
            if command.is_empty() {
                bail!("--cmd must not be empty");
            }
            std::fs::create_dir_all(&output_dir)?;

            let event = build_event(event, r#ref, actor, target_branch, head_repo)?;
            let config = PipelineConfig {
                tranche_count: count,
                retry: RetryPolicy {
                    max_attempts,
                    wait: std::time::Duration::from_secs(wait_secs),
                    timeout: std::time::Duration::from_secs(timeout_secs),
                },
                ..PipelineConfig::default()
            };

            let sink = Arc::new(MemoryCommentSink::new());
            let uploader = upload.then(CoverageUploader::from_env);
            let pipeline = Pipeline::new(
                Arc::new(ProcessExecutor::new(command, output_dir)),
                Arc::new(FsArtifactStore::new(&store)?),
                sink.clone(),
                uploader,
                config,
            );

            let outcome = pipeline.run(&event, &change, &corpus, &required_jobs).await?;

            write_report_files(&report_dir, &outcome.report)?;
            if let Some(comment) = sink.comment(&change, shardci_core::COMMENT_MARKER) {
                std::fs::write(report_dir.join("comment.md"), comment)?;
            }

            info!(
                run_id = %outcome.run_id,
                passed = outcome.passed_count(),
                total = outcome.tranches.len(),
                percent = outcome.report.summary.percent,
                "run finished"
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&outcome.report.summary)?
            );

            if !outcome.succeeded() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
