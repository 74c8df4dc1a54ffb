//! Structured observability hooks for run lifecycle events.
//!
//! Events are emitted at `info!` level; the CLI wires the subscriber
//! (`SHARDCI_LOG` env filter, optional JSON format).

use tracing::info;

/// Emit event: run started with its tranche fan-out.
pub fn emit_run_started(run_id: &str, ref_name: &str, tranche_count: usize) {
    info!(event = "run.started", run_id = %run_id, ref_name = %ref_name, tranche_count);
}

/// Emit event: one tranche reached its terminal result.
pub fn emit_tranche_finished(run_id: &str, index: usize, attempts: u32, passed: bool) {
    info!(event = "tranche.finished", run_id = %run_id, index, attempts, passed);
}

/// Emit event: run finished with final state.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, succeeded: bool) {
    info!(event = "run.finished", run_id = %run_id, duration_ms, succeeded);
}

/// Emit event: run superseded by a newer run on the same ref.
pub fn emit_run_superseded(run_id: &str) {
    tracing::warn!(event = "run.superseded", run_id = %run_id);
}
