use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "roomsync_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "roomsync_http_request_duration_seconds";

/// Counter: booking attempts. Labels: outcome (booked, conflict).
pub const BOOKINGS_TOTAL: &str = "roomsync_bookings_total";

/// Counter: blocks written. Labels: source (admin, sync).
pub const BLOCKS_WRITTEN_TOTAL: &str = "roomsync_blocks_written_total";

// ── Feed sync ───────────────────────────────────────────────────

/// Counter: per-unit reconciliation results. Labels: status (ok, error, skipped).
pub const SYNC_UNITS_TOTAL: &str = "roomsync_sync_units_total";

/// Histogram: duration of a full sync pass in seconds.
pub const SYNC_PASS_DURATION_SECONDS: &str = "roomsync_sync_pass_duration_seconds";

/// Histogram: feed fetch latency in seconds.
pub const FEED_FETCH_DURATION_SECONDS: &str = "roomsync_feed_fetch_duration_seconds";

// ── Outbound side effects ───────────────────────────────────────

/// Counter: notification emails. Labels: status (sent, failed).
pub const MAIL_TOTAL: &str = "roomsync_mail_total";

/// Counter: payment intents requested. Labels: status (created, failed).
pub const PAYMENT_INTENTS_TOTAL: &str = "roomsync_payment_intents_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomsync_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomsync_wal_flush_batch_size";

/// Counter: WAL compactions run.
pub const WAL_COMPACTIONS_TOTAL: &str = "roomsync_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> anyhow::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Collapse a sync status line to a low-cardinality metric label.
pub fn sync_status_label(status: &str) -> &'static str {
    if status.starts_with("OK") {
        "ok"
    } else if status.starts_with("skipped") {
        "skipped"
    } else {
        "error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels() {
        assert_eq!(sync_status_label("OK — 3 events"), "ok");
        assert_eq!(sync_status_label("skipped (no iCal URL)"), "skipped");
        assert_eq!(sync_status_label("ERROR — HTTP 404"), "error");
    }
}
