//! Join-side coverage aggregation.
//!
//! Runs once, after every tranche worker has terminated. Merges
//! whatever artifacts exist into one report; terminally-failed tranches
//! are flagged as missing rather than silently under-reported, while a
//! successful tranche with no stored artifact is an infrastructure
//! fault and fails aggregation outright.

use tracing::info;

use crate::coverage::{merge, CoverageRecord, CoverageSummary};
use crate::error::{CiError, Result};
use crate::runner::TrancheResult;
use crate::store::{artifact_key, run_prefix, ArtifactStore};

/// The immutable merged coverage report for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedReport {
    /// Merged coverage over all available tranches.
    pub record: CoverageRecord,

    /// Derived line-coverage statistics.
    pub summary: CoverageSummary,

    /// Indexes of tranches whose coverage is absent (terminal failures).
    pub missing: Vec<usize>,

    /// Merged LCOV document.
    pub lcov: String,

    /// Normalized XML export for downstream tooling.
    pub xml: String,
}

impl AggregatedReport {
    /// Whether every tranche contributed coverage.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Merge the stored tranche artifacts of one run into one report.
///
/// `results` must contain the terminal result of every tranche in the
/// run; artifacts are fetched from the store by the run's key prefix in
/// one call and matched against them. Artifacts of other runs sharing
/// the store are never read.
pub fn aggregate(
    store: &dyn ArtifactStore,
    run_id: &str,
    results: &[TrancheResult],
) -> Result<AggregatedReport> {
    let stored = store.list_matching(&run_prefix(run_id))?;

    let mut records = Vec::new();
    let mut missing = Vec::new();

    for result in results {
        let key = artifact_key(run_id, result.index);
        let found = stored.iter().find(|(k, _)| *k == key);
        match (result.passed(), found) {
            (true, Some((_, bytes))) => {
                let text = String::from_utf8(bytes.clone()).map_err(|_| {
                    CiError::Aggregation(format!("artifact {key} is not valid UTF-8"))
                })?;
                records.push(CoverageRecord::parse_lcov(&text)?);
            }
            // Upload/storage fault: the tranche said Success but its
            // artifact is gone. Hard error, distinct from a failed tranche.
            (true, None) => return Err(CiError::MissingArtifact { index: result.index }),
            // Terminal failure: expected absence, flagged not fatal.
            (false, _) => missing.push(result.index),
        }
    }

    let record = merge(records);
    let summary = CoverageSummary::of(&record);
    missing.sort_unstable();

    info!(
        covered = summary.covered_lines,
        total = summary.total_lines,
        percent = summary.percent,
        missing = missing.len(),
        "coverage aggregated"
    );

    let lcov = record.to_lcov();
    let xml = record.to_xml();
    Ok(AggregatedReport {
        record,
        summary,
        missing,
        lcov,
        xml,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::TrancheStatus;
    use crate::store::MemoryArtifactStore;

    const RUN: &str = "test-run";

    fn success(index: usize) -> TrancheResult {
        TrancheResult {
            index,
            status: TrancheStatus::Success,
            attempts: 1,
            artifact: Some(Vec::new()),
            error: None,
        }
    }

    fn failed(index: usize) -> TrancheResult {
        TrancheResult {
            index,
            status: TrancheStatus::Failed,
            attempts: 2,
            artifact: None,
            error: Some("tests failed".to_string()),
        }
    }

    fn put_lcov(store: &MemoryArtifactStore, index: usize, body: &str) {
        store.put(&artifact_key(RUN, index), body.as_bytes()).unwrap();
    }

    #[test]
    fn test_aggregate_all_tranches() {
        let store = MemoryArtifactStore::new();
        put_lcov(&store, 0, "SF:a.rs\nDA:1,1\nend_of_record\n");
        put_lcov(&store, 1, "SF:a.rs\nDA:2,1\nend_of_record\n");

        let report = aggregate(&store, RUN, &[success(0), success(1)]).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.summary.total_lines, 2);
        assert_eq!(report.summary.covered_lines, 2);
    }

    #[test]
    fn test_failed_tranche_is_flagged_not_fatal() {
        let store = MemoryArtifactStore::new();
        put_lcov(&store, 0, "SF:a.rs\nDA:1,1\nend_of_record\n");
        put_lcov(&store, 1, "SF:a.rs\nDA:2,1\nend_of_record\n");
        put_lcov(&store, 2, "SF:a.rs\nDA:3,0\nend_of_record\n");

        let report =
            aggregate(&store, RUN, &[success(0), success(1), success(2), failed(3)]).unwrap();
        assert_eq!(report.missing, vec![3]);
        assert!(!report.is_complete());
        assert_eq!(report.summary.total_lines, 3, "built from tranches 0..=2");
    }

    #[test]
    fn test_missing_artifact_for_successful_tranche_is_hard_error() {
        let store = MemoryArtifactStore::new();
        put_lcov(&store, 0, "SF:a.rs\nDA:1,1\nend_of_record\n");
        // Tranche 1 reported success but its upload is gone.
        let err = aggregate(&store, RUN, &[success(0), success(1)]).unwrap_err();
        assert!(matches!(err, CiError::MissingArtifact { index: 1 }));
    }

    #[test]
    fn test_malformed_artifact_fails_aggregation() {
        let store = MemoryArtifactStore::new();
        put_lcov(&store, 0, "DA:1,1\n"); // data before SF
        let err = aggregate(&store, RUN, &[success(0)]).unwrap_err();
        assert!(matches!(err, CiError::Aggregation(_)));
    }

    #[test]
    fn test_no_artifacts_at_all_yields_empty_report() {
        let store = MemoryArtifactStore::new();
        let report = aggregate(&store, RUN, &[failed(0), failed(1)]).unwrap();
        assert_eq!(report.missing, vec![0, 1]);
        assert!(report.record.is_empty());
        assert_eq!(report.summary.percent, 0.0);
    }

    #[test]
    fn test_aggregate_ignores_other_runs_and_unrelated_keys() {
        let store = MemoryArtifactStore::new();
        put_lcov(&store, 0, "SF:a.rs\nDA:1,1\nend_of_record\n");
        store.put("report.md", b"not coverage").unwrap();
        store
            .put(
                &artifact_key("sibling-run", 0),
                b"SF:other.rs\nDA:1,1\nDA:2,1\nend_of_record\n",
            )
            .unwrap();

        let report = aggregate(&store, RUN, &[success(0)]).unwrap();
        assert_eq!(report.summary.total_lines, 1, "only this run's artifact");
        assert!(!report.record.files.contains_key("other.rs"));
    }
}
