//! Prometheus metrics endpoint.

use crate::server::SyncServer;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Counters are monotonic since startup; the storage gauges are best effort.
pub async fn metrics_handler(Extension(server): Extension<Arc<SyncServer>>) -> impl IntoResponse {
    let m = server.metrics();

    let reads = m.reads_total.load(Ordering::Relaxed);
    let not_modified = m.not_modified_total.load(Ordering::Relaxed);
    let writes = m.writes_total.load(Ordering::Relaxed);
    let conflicts = m.conflicts_total.load(Ordering::Relaxed);
    let bytes_rx = m.bytes_received.load(Ordering::Relaxed);
    let bytes_tx = m.bytes_sent.load(Ordering::Relaxed);
    let lookups = m.profile_lookups_total.load(Ordering::Relaxed);
    let promotion_failures = m.promotion_failures.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);
    let cleaned = m.identifiers_cleaned.load(Ordering::Relaxed);
    let cleanup_errors = m.cleanup_errors.load(Ordering::Relaxed);

    let records = server.storage().count_records().await.unwrap_or(0);
    let identifiers = server.storage().count_active_identifiers().await.unwrap_or(0);

    let body = format!(
        r#"# HELP profile_sync_info Server information
# TYPE profile_sync_info gauge
profile_sync_info{{version="{version}"}} 1

# HELP profile_sync_reads_total Sync reads that returned a body
# TYPE profile_sync_reads_total counter
profile_sync_reads_total {reads}

# HELP profile_sync_not_modified_total Sync reads answered with 304
# TYPE profile_sync_not_modified_total counter
profile_sync_not_modified_total {not_modified}

# HELP profile_sync_writes_total Successful sync writes
# TYPE profile_sync_writes_total counter
profile_sync_writes_total {writes}

# HELP profile_sync_conflicts_total Conditional writes rejected with 412
# TYPE profile_sync_conflicts_total counter
profile_sync_conflicts_total {conflicts}

# HELP profile_sync_bytes_received_total Blob bytes accepted by writes
# TYPE profile_sync_bytes_received_total counter
profile_sync_bytes_received_total {bytes_rx}

# HELP profile_sync_bytes_sent_total Blob bytes returned by reads
# TYPE profile_sync_bytes_sent_total counter
profile_sync_bytes_sent_total {bytes_tx}

# HELP profile_sync_profile_lookups_total Profile identifier lookups served
# TYPE profile_sync_profile_lookups_total counter
profile_sync_profile_lookups_total {lookups}

# HELP profile_sync_promotion_failures_total Background promotions that failed
# TYPE profile_sync_promotion_failures_total counter
profile_sync_promotion_failures_total {promotion_failures}

# HELP profile_sync_rate_limit_hits_total Requests rejected by the rate limiter
# TYPE profile_sync_rate_limit_hits_total counter
profile_sync_rate_limit_hits_total {rate_limits}

# HELP profile_sync_errors_total Requests that ended in a server error
# TYPE profile_sync_errors_total counter
profile_sync_errors_total {errors}

# HELP profile_sync_identifiers_cleaned_total Identifier rows removed by cleanup
# TYPE profile_sync_identifiers_cleaned_total counter
profile_sync_identifiers_cleaned_total {cleaned}

# HELP profile_sync_cleanup_errors_total Failed cleanup scans or deletes
# TYPE profile_sync_cleanup_errors_total counter
profile_sync_cleanup_errors_total {cleanup_errors}

# HELP profile_sync_records Sync records in the database
# TYPE profile_sync_records gauge
profile_sync_records {records}

# HELP profile_sync_active_identifiers Active durable profile identifiers
# TYPE profile_sync_active_identifiers gauge
profile_sync_active_identifiers {identifiers}
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
