//! Unit-of-work span helpers.
//!
//! Provides span creation and outcome recording for commit and abort.

use tracing::Span;
use uuid::Uuid;

/// Start a span for a commit.
///
/// `uow.transactional` and `uow.outcome` are declared empty and filled via
/// [`record_transactional`] and [`record_outcome`].
pub fn start_commit_span(uow_id: &Uuid, pending: usize) -> Span {
    tracing::info_span!(
        "uow.commit",
        "uow.id" = %uow_id,
        "uow.pending" = pending,
        "uow.transactional" = tracing::field::Empty,
        "uow.outcome" = tracing::field::Empty,
    )
}

/// Start a span for an abort.
pub fn start_abort_span(uow_id: &Uuid, pending: usize) -> Span {
    tracing::info_span!(
        "uow.abort",
        "uow.id" = %uow_id,
        "uow.pending" = pending,
        "uow.outcome" = tracing::field::Empty,
    )
}

pub fn record_transactional(span: &Span, transactional: bool) {
    span.record("uow.transactional", transactional);
}

/// Record the outcome ("committed" | "failed" | "aborted") on the span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("uow.outcome", outcome);
}
