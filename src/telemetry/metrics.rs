//! Metric instrument factories for workpool.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workpool")
}

/// Counter: items inserted by enqueue.
/// Labels: `queue`.
pub fn items_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("workpool.items.enqueued")
        .with_description("Number of queue items enqueued")
        .build()
}

/// Counter: item lifecycle transitions.
/// Labels: `from`, `to` (`run`, `on_complete`, `deleted`).
pub fn phase_transitions() -> Counter<u64> {
    meter()
        .u64_counter("workpool.items.phase_transitions")
        .with_description("Number of queue item phase transitions")
        .build()
}

/// Counter: lease operations presented with a stale or missing token.
/// Labels: `target` (`item` | `pointer` | `scanner`), `operation`.
pub fn lease_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("workpool.lease.conflicts")
        .with_description("Lease operations rejected by token mismatch")
        .build()
}

/// Counter: scanner cycles.
/// Labels: `outcome` (`found` | `backoff` | `parked` | `idle`).
pub fn scanner_cycles() -> Counter<u64> {
    meter()
        .u64_counter("workpool.scanner.cycles")
        .with_description("Number of scanner cycles run")
        .build()
}

/// Counter: managers dispatched for claimed pointers.
pub fn managers_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("workpool.managers.dispatched")
        .with_description("Number of queue managers dispatched")
        .build()
}

/// Counter: completion callback attempts.
/// Labels: `result` (`delivered` | `timeout_retry` | `dropped`).
pub fn completion_deliveries() -> Counter<u64> {
    meter()
        .u64_counter("workpool.completion.deliveries")
        .with_description("Completion callback delivery attempts")
        .build()
}

/// Counter: idle pointers removed by garbage collection.
pub fn pointers_collected() -> Counter<u64> {
    meter()
        .u64_counter("workpool.pointers.collected")
        .with_description("Queue pointers deleted by garbage collection")
        .build()
}

/// Histogram: handler execution time in milliseconds.
/// Labels: `kind`, `outcome` (`success` | `failure` | `lease_lost`).
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workpool.handler.duration_ms")
        .with_description("Handler execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
