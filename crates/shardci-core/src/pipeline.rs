//! Pipeline orchestration: gate, fan-out, join, aggregate, publish.
//!
//! Tranches run as independent tokio tasks with no communication
//! between them; the join over all tranche handles is the sole
//! synchronization point, and aggregation runs only after every worker
//! has terminated (success or exhausted retry). A newer run on the same
//! `(workflow, ref)` key cancels the whole in-flight run atomically,
//! and a superseded run's artifacts never reach any report.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregate::{aggregate, AggregatedReport};
use crate::error::{CiError, Result};
use crate::obs;
use crate::plan::{plan_corpus, TrancheSpec};
use crate::publish::{render_comment, CommentSink, CoverageUploader, COMMENT_MARKER};
use crate::retry::RetryPolicy;
use crate::runner::{run_tranche, TrancheExecutor, TrancheResult, TrancheStatus};
use crate::store::{run_prefix, ArtifactStore};
use crate::trigger::{GatePolicy, JobOutcome, RunState, TestScope, TriggerEvent};

/// Concurrency-group registry: at most one active run per
/// `(workflow, ref)` key. Entering a key cancels the previous holder.
#[derive(Default)]
pub struct ConcurrencyGroups {
    groups: Mutex<HashMap<(String, String), watch::Sender<bool>>>,
}

impl ConcurrencyGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run for the key, cancelling any run already
    /// holding it. The returned receiver flips to `true` when this run
    /// is itself superseded.
    pub fn enter(&self, workflow: &str, ref_name: &str) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        let mut groups = self.groups.lock().expect("group mutex poisoned");
        if let Some(prev) = groups.insert((workflow.to_string(), ref_name.to_string()), tx) {
            // Previous run for this ref is superseded.
            let _ = prev.send(true);
        }
        rx
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Workflow name, half of the concurrency-group key.
    pub workflow: String,

    /// Tranche fan-out for sharded runs.
    pub tranche_count: usize,

    /// Retry policy applied uniformly to every tranche.
    pub retry: RetryPolicy,

    /// Run gate policy.
    pub gate: GatePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workflow: "ci".to_string(),
            tranche_count: 4,
            retry: RetryPolicy::default(),
            gate: GatePolicy::default(),
        }
    }
}

/// Final outcome of one pipeline run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Run ID.
    pub run_id: Uuid,

    /// When the run was triggered.
    pub started_at: DateTime<Utc>,

    /// Terminal run state: Succeeded iff every tranche and every
    /// required external job passed.
    pub state: RunState,

    /// Whether privileged side effects were permitted for this run.
    pub trusted: bool,

    /// Terminal result of every tranche, ordered by index.
    pub tranches: Vec<TrancheResult>,

    /// The merged coverage report (best-effort over surviving tranches).
    pub report: AggregatedReport,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    /// Number of tranches that passed.
    pub fn passed_count(&self) -> usize {
        self.tranches.iter().filter(|t| t.passed()).count()
    }
}

/// The sharded CI pipeline.
pub struct Pipeline {
    executor: Arc<dyn TrancheExecutor>,
    store: Arc<dyn ArtifactStore>,
    sink: Arc<dyn CommentSink>,
    uploader: Option<CoverageUploader>,
    groups: ConcurrencyGroups,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        executor: Arc<dyn TrancheExecutor>,
        store: Arc<dyn ArtifactStore>,
        sink: Arc<dyn CommentSink>,
        uploader: Option<CoverageUploader>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            executor,
            store,
            sink,
            uploader,
            groups: ConcurrencyGroups::new(),
            config,
        }
    }

    /// Execute one full run for a trigger event.
    ///
    /// `required_jobs` carries the reported outcomes of jobs outside
    /// this pipeline (build, lint); the run only reaches `Succeeded`
    /// when every one of them passed in addition to every tranche.
    ///
    /// Returns `Ok` with the outcome when the pipeline ran to
    /// completion (the outcome itself may be `Failed` on tranche or
    /// required-job failures). Gate rejection, supersession, and
    /// aggregation faults surface as errors; publication faults never do.
    pub async fn run(
        &self,
        event: &TriggerEvent,
        change_id: &str,
        corpus: &[String],
        required_jobs: &[JobOutcome],
    ) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let mut state = RunState::Idle.advance(RunState::Triggered);

        // Entering the concurrency group cancels any in-flight run on
        // the same ref before this run even gates.
        let cancel = self.groups.enter(&self.config.workflow, &event.ref_name);

        state = state.advance(RunState::Gated);
        let decision = self.config.gate.evaluate(event);
        if !decision.proceed {
            info!(run_id = %run_id, reason = %decision.reason, "run gated out");
            return Err(CiError::Gated(decision.reason));
        }

        // Release refs run the full suite in a single tranche.
        let count = match decision.test_scope {
            TestScope::Full => 1,
            TestScope::Sharded => self.config.tranche_count,
        };

        // Artifact keys are scoped to this run's id, so concurrent runs
        // sharing a store never read or clear each other's uploads.
        let tranches = plan_corpus(corpus, count)?;
        state = state.advance(RunState::Running);
        obs::emit_run_started(&run_id.to_string(), &event.ref_name, count);

        let run_key = run_id.to_string();
        let mut handles = Vec::with_capacity(count);
        for (index, tests) in tranches.into_iter().enumerate() {
            let executor = Arc::clone(&self.executor);
            let store = Arc::clone(&self.store);
            let policy = self.config.retry.clone();
            let mut cancel = cancel.clone();
            let run = run_key.clone();
            let spec = TrancheSpec { index, count };

            handles.push(tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = cancel.changed() => None,
                    result = run_tranche(
                        executor.as_ref(),
                        store.as_ref(),
                        &run,
                        spec,
                        &tests,
                        &policy,
                    ) => Some(result),
                }
            }));
        }

        // Join barrier: every tranche worker must terminate before
        // aggregation may run.
        let mut results = Vec::with_capacity(count);
        let mut superseded = false;
        for (index, joined) in join_all(handles).await.into_iter().enumerate() {
            match joined {
                Ok(Some(result)) => results.push(result),
                Ok(None) => superseded = true,
                Err(join_err) => {
                    // A panicked worker is that tranche's terminal failure,
                    // not a pipeline abort; the barrier still sees N results.
                    warn!(tranche = index, error = %join_err, "tranche worker panicked");
                    results.push(TrancheResult {
                        index,
                        status: TrancheStatus::Failed,
                        attempts: self.config.retry.max_attempts,
                        artifact: None,
                        error: Some(format!("worker panicked: {join_err}")),
                    });
                }
            }
        }

        if superseded || *cancel.borrow() {
            obs::emit_run_superseded(&run_key);
            // Only this run's partial artifacts are removed; the
            // superseding run's fresh uploads live under its own prefix.
            self.store.clear_matching(&run_prefix(&run_key))?;
            return Err(CiError::Superseded);
        }

        results.sort_by_key(|r| r.index);
        for result in &results {
            obs::emit_tranche_finished(
                &run_id.to_string(),
                result.index,
                result.attempts,
                result.passed(),
            );
        }

        // Only the gate aggregates per-job outcomes into the final run
        // status: every tranche and every required external job.
        let all_passed = results.iter().all(TrancheResult::passed)
            && required_jobs.iter().all(|job| job.passed);
        let report = aggregate(self.store.as_ref(), &run_key, &results)?;

        state = if all_passed {
            state.advance(RunState::Succeeded)
        } else {
            state.advance(RunState::Failed)
        };

        // Publication: sequential, each surface in its own failure
        // domain, neither affecting the run's pass/fail state.
        let body = render_comment(&report, &run_id.to_string());
        if let Err(err) = self.sink.upsert(change_id, COMMENT_MARKER, &body).await {
            warn!(run_id = %run_id, error = %err, "sticky comment update failed, continuing");
        }
        if let Some(uploader) = &self.uploader {
            uploader.forward(&report, &run_id.to_string()).await;
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_run_finished(&run_id.to_string(), duration_ms, state == RunState::Succeeded);

        Ok(RunOutcome {
            run_id,
            started_at,
            state,
            trusted: decision.trusted,
            tranches: results,
            report,
            duration_ms,
        })
    }
}
