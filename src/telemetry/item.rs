//! Item execution span helpers.

use tracing::Span;

use crate::model::{ItemId, Phase};

/// Start a span covering one dispatch of a leased item.
///
/// The `item.phase` field is recorded by [`record_phase_transition`].
pub fn start_item_span(queue_id: &str, item_id: &ItemId, phase: Phase) -> Span {
    tracing::info_span!(
        "item.execute",
        "item.queue" = queue_id,
        "item.id" = %item_id,
        "item.phase" = %phase,
    )
}

/// Record a phase transition on the given span and bump the counter.
pub fn record_phase_transition(span: &Span, from: &str, to: &str) {
    span.record("item.phase", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "phase_transition");
    });
    super::metrics::phase_transitions().add(
        1,
        &[
            opentelemetry::KeyValue::new("from", from.to_string()),
            opentelemetry::KeyValue::new("to", to.to_string()),
        ],
    );
}
