//! Report publication.
//!
//! Two surfaces, both written after the join and each in its own
//! failure domain: an idempotent "sticky" comment on the originating
//! change, and a best-effort forward of the merged LCOV to an external
//! reporting service. Neither outcome feeds back into the run's
//! pass/fail status.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::aggregate::AggregatedReport;
use crate::error::Result;

/// Hidden marker that identifies the coverage comment for replacement.
pub const COMMENT_MARKER: &str = "<!-- shardci-coverage -->";

/// Render the sticky comment body for a report.
///
/// The marker line makes re-publication replace the previous comment
/// instead of appending a new one. Missing tranches are called out
/// explicitly rather than letting the percentage silently under-report.
pub fn render_comment(report: &AggregatedReport, run_id: &str) -> String {
    let summary = &report.summary;
    let mut md = String::new();
    md.push_str(COMMENT_MARKER);
    md.push('\n');
    md.push_str("## Coverage Report\n\n");
    md.push_str(&format!(
        "![coverage](https://img.shields.io/badge/coverage-{:.1}%25-{})\n\n",
        summary.percent,
        summary.band.color()
    ));
    md.push_str(&format!(
        "**{:.2}%** lines covered ({} of {})\n",
        summary.percent, summary.covered_lines, summary.total_lines
    ));

    if !report.missing.is_empty() {
        md.push_str("\n> [!WARNING]\n");
        let indexes: Vec<String> = report.missing.iter().map(usize::to_string).collect();
        md.push_str(&format!(
            "> Coverage is incomplete: tranche(s) {} failed and contributed no data.\n",
            indexes.join(", ")
        ));
    }

    md.push_str(&format!("\n<sub>run `{run_id}`</sub>\n"));
    md
}

/// Destination for sticky comments on a change.
#[async_trait]
pub trait CommentSink: Send + Sync {
    /// Create or replace the comment on `change_id` that carries `marker`.
    async fn upsert(&self, change_id: &str, marker: &str, body: &str) -> Result<()>;
}

/// In-memory sink for tests: one comment slot per (change, marker).
#[derive(Default)]
pub struct MemoryCommentSink {
    comments: Mutex<HashMap<(String, String), String>>,
}

impl MemoryCommentSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current comment body for (change, marker), if any.
    pub fn comment(&self, change_id: &str, marker: &str) -> Option<String> {
        let comments = self.comments.lock().expect("sink mutex poisoned");
        comments
            .get(&(change_id.to_string(), marker.to_string()))
            .cloned()
    }

    /// Total comments across all changes.
    pub fn len(&self) -> usize {
        self.comments.lock().expect("sink mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CommentSink for MemoryCommentSink {
    async fn upsert(&self, change_id: &str, marker: &str, body: &str) -> Result<()> {
        let mut comments = self.comments.lock().expect("sink mutex poisoned");
        comments.insert(
            (change_id.to_string(), marker.to_string()),
            body.to_string(),
        );
        Ok(())
    }
}

/// External coverage reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// Reporting endpoint URL.
    pub endpoint: String,

    /// Upload token; absent means the forward is skipped entirely.
    pub token: Option<String>,
}

impl UploaderConfig {
    /// Read endpoint and token from `SHARDCI_COVERAGE_URL` /
    /// `SHARDCI_COVERAGE_TOKEN`.
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("SHARDCI_COVERAGE_URL")
                .unwrap_or_else(|_| "https://coverage.stevedores.org/upload".to_string()),
            token: std::env::var("SHARDCI_COVERAGE_TOKEN").ok(),
        }
    }
}

/// Best-effort client that forwards the merged LCOV to an external
/// reporting service.
pub struct CoverageUploader {
    config: UploaderConfig,
    http_client: reqwest::Client,
}

impl CoverageUploader {
    pub fn new(config: UploaderConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("shardci/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to create HTTP client");
        Self {
            config,
            http_client,
        }
    }

    pub fn from_env() -> Self {
        Self::new(UploaderConfig::from_env())
    }

    /// Forward the merged LCOV. Never fails the run: a missing token
    /// degrades to a skip, and transport errors are logged and dropped.
    pub async fn forward(&self, report: &AggregatedReport, run_id: &str) {
        let token = match &self.config.token {
            Some(token) => token.clone(),
            None => {
                debug!(run_id, "no coverage token configured, skipping upload");
                return;
            }
        };

        let response = self
            .http_client
            .post(&self.config.endpoint)
            .bearer_auth(token)
            .header("x-shardci-run", run_id)
            .body(report.lcov.clone())
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                debug!(run_id, "coverage upload accepted");
            }
            Ok(resp) => {
                warn!(run_id, status = %resp.status(), "coverage upload rejected, continuing");
            }
            Err(err) => {
                warn!(run_id, error = %err, "coverage upload unreachable, continuing");
            }
        }
    }
}
