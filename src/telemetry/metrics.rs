//! Metric instrument factories for juggler.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"juggler"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for juggler instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("juggler")
}

/// Counter: jobs reserved and handed to a JobRunner.
/// Labels: `tube`.
pub fn jobs_reserved() -> Counter<u64> {
    meter()
        .u64_counter("juggler.jobs.reserved")
        .with_description("Number of jobs reserved for processing")
        .build()
}

/// Counter: how jobs finished.
/// Labels: `tube`, `outcome` ("succeeded" | "failed" | "timed_out").
pub fn job_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("juggler.jobs.outcomes")
        .with_description("Number of jobs by outcome")
        .build()
}

/// Counter: terminal queue commands issued for a job.
/// Labels: `tube`, `operation` ("delete" | "release" | "bury"), `result` ("ok" | "error").
pub fn queue_dispositions() -> Counter<u64> {
    meter()
        .u64_counter("juggler.queue.dispositions")
        .with_description("Number of delete/release/bury commands")
        .build()
}

/// Counter: jobs whose payload could not be decoded and were deleted.
/// Labels: `tube`.
pub fn poison_payloads() -> Counter<u64> {
    meter()
        .u64_counter("juggler.jobs.poison")
        .with_description("Undecodable payloads deleted without processing")
        .build()
}

/// Counter: reservations that ended without a job.
/// Labels: `tube`, `error` ("deadline_soon" | "disconnected" | "other").
pub fn reserve_errors() -> Counter<u64> {
    meter()
        .u64_counter("juggler.reserve.errors")
        .with_description("Reservations that returned an error")
        .build()
}

/// Counter: JobRunner state transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("juggler.jobs.state_transitions")
        .with_description("Number of job runner state transitions")
        .build()
}

/// Histogram: time from reservation to disposal, in milliseconds.
/// Labels: `tube`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("juggler.jobs.duration_ms")
        .with_description("Job processing duration in milliseconds")
        .with_unit("ms")
        .build()
}
