//! Metric instrument factories for uow-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"uow-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for uow-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("uow-rs")
}

/// Counter: work units registered under a new key.
pub fn units_registered() -> Counter<u64> {
    meter()
        .u64_counter("uow.units.registered")
        .with_description("Number of work units registered")
        .build()
}

/// Counter: registrations that replaced a pending unit with the same key.
pub fn units_replaced() -> Counter<u64> {
    meter()
        .u64_counter("uow.units.replaced")
        .with_description("Number of work units replaced by a later registration")
        .build()
}

/// Counter: completed units of work.
/// Labels: `outcome` ("committed" | "aborted").
pub fn completed() -> Counter<u64> {
    meter()
        .u64_counter("uow.completed")
        .with_description("Number of completed units of work")
        .build()
}

/// Counter: failed commit or abort attempts. The unit of work stays active.
/// Labels: `stage` (see [`crate::error::Stage`]).
pub fn failures() -> Counter<u64> {
    meter()
        .u64_counter("uow.failures")
        .with_description("Number of failed commit or abort attempts")
        .build()
}

/// Counter: events handed to the publisher by successful commits.
pub fn events_published() -> Counter<u64> {
    meter()
        .u64_counter("uow.events.published")
        .with_description("Number of events published")
        .build()
}

/// Histogram: commit duration in milliseconds.
/// Labels: `outcome`.
pub fn commit_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("uow.commit.duration_ms")
        .with_description("Commit duration in milliseconds")
        .with_unit("ms")
        .build()
}
