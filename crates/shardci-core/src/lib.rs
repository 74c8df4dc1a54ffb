//! shardci - sharded test execution and coverage aggregation
//!
//! Provides a CI pipeline that:
//! - Deterministically partitions a test corpus into tranches
//! - Runs tranches as parallel workers under a retry policy
//! - Collects one coverage artifact per tranche in a keyed blob store
//! - Merges all artifacts into one report and publishes it back to the
//!   originating change

pub mod aggregate;
pub mod coverage;
pub mod error;
pub mod obs;
pub mod pipeline;
pub mod plan;
pub mod publish;
pub mod retry;
pub mod runner;
pub mod store;
pub mod trigger;

// Re-export key types
pub use aggregate::{aggregate as aggregate_coverage, AggregatedReport};
pub use coverage::{merge, Band, CoverageRecord, CoverageSummary};
pub use error::{CiError, Result};
pub use pipeline::{ConcurrencyGroups, Pipeline, PipelineConfig, RunOutcome};
pub use plan::{plan_corpus, TrancheSpec};
pub use publish::{render_comment, CommentSink, CoverageUploader, MemoryCommentSink, UploaderConfig, COMMENT_MARKER};
pub use retry::{retry, RetryOutcome, RetryPolicy};
pub use runner::{run_tranche, ProcessExecutor, TrancheExecutor, TrancheResult, TrancheStatus};
pub use store::{artifact_key, run_prefix, ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use trigger::{GateDecision, GatePolicy, JobOutcome, RunState, TestScope, TriggerEvent, TriggerKind};
