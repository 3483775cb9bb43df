use std::net::SocketAddr;
use std::time::Instant;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations executed. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "slotbook_operations_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "slotbook_operation_duration_seconds";

// ── Notifications ───────────────────────────────────────────────

/// Counter: notices handed to the notifier successfully. Labels: kind.
pub const NOTIFICATIONS_SENT_TOTAL: &str = "slotbook_notifications_sent_total";

/// Counter: notices the notifier rejected. Labels: kind.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "slotbook_notifications_failed_total";

/// Counter: reminders delivered by the reminder sweep.
pub const REMINDERS_SENT_TOTAL: &str = "slotbook_reminders_sent_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: review drafts currently open.
pub const DRAFTS_OPEN: &str = "slotbook_review_drafts_open";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Count and time one engine operation.
pub fn record_operation<T>(op: &'static str, started: Instant, result: &Result<T, EngineError>) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
