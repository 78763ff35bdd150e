//! Job execution span helpers.
//!
//! Every JobRunner runs inside a `job.execute` span and records its state
//! transitions on it.

use tracing::Span;

use crate::model::JobId;

/// Start a span for one reserved job.
///
/// The `job.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_job_span(tube: &str, job_id: JobId) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.tube" = tube,
        "job.id" = job_id.0,
        "job.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span.
///
/// Emits a tracing `debug` event scoped to the span and updates `job.state`.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
