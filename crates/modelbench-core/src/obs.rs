//! Structured observability hooks for run and session lifecycle events.
//!
//! This module provides:
//! - Run- and session-scoped tracing spans
//! - Emission functions for run start, spawn failure, finish and rejection,
//!   and for session open/close
//!
//! Events are emitted at `info!` level (warn for failures). Filter with
//! `RUST_LOG`; for JSON output start the daemon with `--json`.

use tracing::{info, warn};

/// Span that tags everything a run's supervisor task logs with its job id.
///
/// # Example
///
/// ```ignore
/// use tracing::Instrument;
/// tokio::spawn(supervise(run).instrument(run_span("v1-knn-1700000000000")));
/// ```
pub fn run_span(job_id: &str) -> tracing::Span {
    tracing::info_span!("modelbench.run", job_id = %job_id)
}

/// Span for one client session's driver loop.
pub fn session_span(session_id: &str) -> tracing::Span {
    tracing::info_span!("modelbench.session", session_id = %session_id)
}

/// Emit event: a run was launched.
pub fn emit_run_started(job_id: &str, script_path: &str, pid: Option<u32>) {
    info!(event = "run.started", job_id = %job_id, script_path = %script_path, pid = ?pid);
}

/// Emit event: the script could not be started.
pub fn emit_spawn_failed(job_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.spawn_failed", job_id = %job_id, error = %error);
}

/// Emit event: a run reached its terminal state.
pub fn emit_run_finished(job_id: &str, exit_code: Option<i32>, duration_ms: u64, success: bool) {
    info!(
        event = "run.finished",
        job_id = %job_id,
        exit_code = ?exit_code,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: a request was refused before a job id was allocated.
pub fn emit_run_rejected(session_id: &str, reason: &dyn std::fmt::Display) {
    info!(event = "run.rejected", session_id = %session_id, reason = %reason);
}

/// Emit event: a client session connected.
pub fn emit_session_opened(session_id: &str) {
    info!(event = "session.opened", session_id = %session_id);
}

/// Emit event: a client session disconnected, leaving `orphaned` runs behind.
pub fn emit_session_closed(session_id: &str, orphaned: usize) {
    info!(event = "session.closed", session_id = %session_id, orphaned = orphaned);
}
