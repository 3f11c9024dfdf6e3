//! Pipeline execution span helpers.

use tracing::Span;
use uuid::Uuid;

/// Start a span covering one pipeline run for one file.
///
/// Every external call made on behalf of the file runs inside this span,
/// so the trace id correlates the whole lifecycle.
pub fn start_item_span(trace_id: &Uuid, file_id: &str, category: &str) -> Span {
    tracing::info_span!(
        "pipeline.run",
        "item.trace_id" = %trace_id,
        "item.id" = file_id,
        "item.category" = category,
    )
}
