//! Tranche execution.
//!
//! A tranche runner executes exactly the tests assigned to its index,
//! with coverage instrumentation, and uploads one LCOV artifact on
//! success. Execution is wrapped in the retry combinator; every attempt
//! is a fresh invocation, which is why executors must be idempotent and
//! side-effect-free across repeated runs.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{CiError, Result};
use crate::plan::TrancheSpec;
use crate::retry::{retry, RetryPolicy};
use crate::store::{artifact_key, ArtifactStore};

/// Terminal status of one tranche.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrancheStatus {
    Success,
    Failed,
}

/// Result of one tranche after retries are exhausted or success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrancheResult {
    /// Tranche index.
    pub index: usize,

    /// Terminal status.
    pub status: TrancheStatus,

    /// Attempts consumed (1-based).
    pub attempts: u32,

    /// LCOV bytes; present iff the tranche succeeded.
    pub artifact: Option<Vec<u8>>,

    /// Failure detail for failed tranches.
    pub error: Option<String>,
}

impl TrancheResult {
    /// Whether the tranche passed.
    pub fn passed(&self) -> bool {
        self.status == TrancheStatus::Success
    }
}

/// Executes one tranche's test subset and returns its LCOV bytes.
///
/// Implementations must run only the given subset (tests outside it
/// would double-count in the merged report) and must tolerate being
/// invoked repeatedly for the same spec.
#[async_trait]
pub trait TrancheExecutor: Send + Sync {
    async fn execute(&self, spec: &TrancheSpec, tests: &[String]) -> Result<Vec<u8>>;
}

/// Runs the configured test command in a subprocess.
///
/// The tranche coordinates are injected through environment variables
/// (`SHARDCI_TRANCHE_INDEX`, `SHARDCI_TRANCHE_COUNT`) and the selected
/// test ids are passed on stdin-free argv after the template, so the
/// command under test can restrict itself to the subset. The command is
/// expected to write its LCOV output to `output_dir/tranche-<index>.lcov`.
pub struct ProcessExecutor {
    /// Command template; first element is the executable.
    pub command: Vec<String>,

    /// Directory the command writes per-tranche LCOV files into.
    pub output_dir: PathBuf,
}

impl ProcessExecutor {
    pub fn new(command: Vec<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            output_dir: output_dir.into(),
        }
    }

    fn lcov_path(&self, index: usize) -> PathBuf {
        self.output_dir.join(format!("tranche-{index}.lcov"))
    }
}

#[async_trait]
impl TrancheExecutor for ProcessExecutor {
    async fn execute(&self, spec: &TrancheSpec, tests: &[String]) -> Result<Vec<u8>> {
        if self.command.is_empty() {
            return Err(CiError::TrancheFailed {
                index: spec.index,
                attempts: 1,
                message: "empty tranche command".to_string(),
            });
        }

        // Empty tranche: trivial success with an empty artifact, so the
        // missing-artifact policy stays uniform (Success => artifact).
        if tests.is_empty() {
            return Ok(Vec::new());
        }

        let exe = &self.command[0];
        let args = &self.command[1..];

        let output = Command::new(exe)
            .args(args)
            .args(tests)
            .env("SHARDCI_TRANCHE_INDEX", spec.index.to_string())
            .env("SHARDCI_TRANCHE_COUNT", spec.count.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?
            .wait_with_output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CiError::TrancheFailed {
                index: spec.index,
                attempts: 1,
                message: format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }

        let lcov = tokio::fs::read(self.lcov_path(spec.index)).await?;
        Ok(lcov)
    }
}

/// Run one tranche under the retry policy and upload its artifact.
///
/// The returned result is terminal: either a success with the artifact
/// stored under the run-scoped tranche key, or a failure after the
/// attempt cap. A store upload fault is an infrastructure error and
/// fails the tranche even though the tests themselves passed.
pub async fn run_tranche(
    executor: &dyn TrancheExecutor,
    store: &dyn ArtifactStore,
    run_id: &str,
    spec: TrancheSpec,
    tests: &[String],
    policy: &RetryPolicy,
) -> TrancheResult {
    let outcome = retry(policy, |attempt| {
        info!(tranche = spec.index, attempt, tests = tests.len(), "running tranche");
        executor.execute(&spec, tests)
    })
    .await;

    match outcome.result {
        Ok(lcov) => {
            if let Err(err) = store.put(&artifact_key(run_id, spec.index), &lcov) {
                warn!(tranche = spec.index, error = %err, "artifact upload failed");
                return TrancheResult {
                    index: spec.index,
                    status: TrancheStatus::Failed,
                    attempts: outcome.attempts,
                    artifact: None,
                    error: Some(format!("artifact upload failed: {err}")),
                };
            }
            TrancheResult {
                index: spec.index,
                status: TrancheStatus::Success,
                attempts: outcome.attempts,
                artifact: Some(lcov),
                error: None,
            }
        }
        Err(err) => {
            warn!(tranche = spec.index, attempts = outcome.attempts, error = %err, "tranche failed terminally");
            TrancheResult {
                index: spec.index,
                status: TrancheStatus::Failed,
                attempts: outcome.attempts,
                artifact: None,
                error: Some(err.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryArtifactStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyExecutor {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TrancheExecutor for FlakyExecutor {
        async fn execute(&self, spec: &TrancheSpec, _tests: &[String]) -> Result<Vec<u8>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(CiError::TrancheFailed {
                    index: spec.index,
                    attempts: 1,
                    message: "simulated transient fault".to_string(),
                })
            } else {
                Ok(b"SF:src/lib.rs\nDA:1,1\nend_of_record\n".to_vec())
            }
        }
    }

    fn spec() -> TrancheSpec {
        TrancheSpec::new(0, 4).unwrap()
    }

    #[tokio::test]
    async fn test_flaky_tranche_succeeds_on_retry() {
        let executor = FlakyExecutor {
            fail_first: 1,
            calls: AtomicU32::new(0),
        };
        let store = MemoryArtifactStore::new();
        let result = run_tranche(
            &executor,
            &store,
            "run-a",
            spec(),
            &["a".to_string()],
            &RetryPolicy::immediate(2),
        )
        .await;

        assert_eq!(result.status, TrancheStatus::Success);
        assert_eq!(result.attempts, 2, "one failure, one success");
        assert!(result.artifact.is_some());
        assert!(store.get(&artifact_key("run-a", 0)).is_ok(), "artifact uploaded");
    }

    #[tokio::test]
    async fn test_exhausted_tranche_has_no_artifact() {
        let executor = FlakyExecutor {
            fail_first: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let store = MemoryArtifactStore::new();
        let result = run_tranche(
            &executor,
            &store,
            "run-a",
            spec(),
            &["a".to_string()],
            &RetryPolicy::immediate(2),
        )
        .await;

        assert_eq!(result.status, TrancheStatus::Failed);
        assert_eq!(result.attempts, 2);
        assert!(result.artifact.is_none());
        assert!(store.get(&artifact_key("run-a", 0)).is_err(), "nothing uploaded");
    }

    #[tokio::test]
    async fn test_process_executor_empty_tranche_trivial_success() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessExecutor::new(vec!["false".to_string()], dir.path());
        // No tests selected: the command must not even run.
        let lcov = executor.execute(&spec(), &[]).await.unwrap();
        assert!(lcov.is_empty());
    }

    #[tokio::test]
    async fn test_process_executor_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessExecutor::new(
            vec!["sh".to_string(), "-c".to_string(), "echo boom >&2; exit 3".to_string()],
            dir.path(),
        );
        let err = executor
            .execute(&spec(), &["t1".to_string()])
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"), "{msg}");
        assert!(msg.contains("boom"), "{msg}");
    }

    #[tokio::test]
    async fn test_process_executor_reads_lcov_output() {
        let dir = tempfile::tempdir().unwrap();
        let lcov_path = dir.path().join("tranche-0.lcov");
        let script = format!(
            "printf 'SF:a.rs\\nDA:1,1\\nend_of_record\\n' > {}",
            lcov_path.display()
        );
        let executor = ProcessExecutor::new(
            vec!["sh".to_string(), "-c".to_string(), script],
            dir.path(),
        );
        let lcov = executor.execute(&spec(), &["t1".to_string()]).await.unwrap();
        assert!(String::from_utf8_lossy(&lcov).contains("SF:a.rs"));
    }
}
