//! Metric instrument factories for lightbox.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"lightbox"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for lightbox instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("lightbox")
}

/// Counter: files picked up by the discovery feed.
/// Labels: `category`.
pub fn files_discovered() -> Counter<u64> {
    meter()
        .u64_counter("lightbox.files.discovered")
        .with_description("Files picked up by the discovery feed")
        .build()
}

/// Counter: admission checks denied by the rate limiter.
pub fn admissions_denied() -> Counter<u64> {
    meter()
        .u64_counter("lightbox.admissions.denied")
        .with_description("Admission checks denied by the rate limiter")
        .build()
}

/// Counter: work item state transitions.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("lightbox.items.state_transitions")
        .with_description("Number of work item state transitions")
        .build()
}

/// Counter: items published and archived.
/// Labels: `category`.
pub fn items_published() -> Counter<u64> {
    meter()
        .u64_counter("lightbox.items.published")
        .with_description("Items published and archived")
        .build()
}

/// Counter: items abandoned to the failed location.
/// Labels: `kind`.
pub fn items_abandoned() -> Counter<u64> {
    meter()
        .u64_counter("lightbox.items.abandoned")
        .with_description("Items abandoned after retries or permanent failure")
        .build()
}

/// Histogram: full pipeline run duration in milliseconds.
pub fn pipeline_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("lightbox.pipeline.duration_ms")
        .with_description("Pipeline run duration in milliseconds")
        .with_unit("ms")
        .build()
}
