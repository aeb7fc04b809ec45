use std::io;
use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "ptsched_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "ptsched_query_duration_seconds";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: bookings committed. Labels: modality.
pub const BOOKINGS_COMMITTED_TOTAL: &str = "ptsched_bookings_committed_total";

/// Counter: booking attempts rejected. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "ptsched_bookings_rejected_total";

/// Counter: bookings cancelled (repeat cancels not counted).
pub const BOOKINGS_CANCELLED_TOTAL: &str = "ptsched_bookings_cancelled_total";

/// Counter: low-credit alerts raised by settlement runs.
pub const CREDIT_ALERTS_TOTAL: &str = "ptsched_credit_alerts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "ptsched_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "ptsched_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "ptsched_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "ptsched_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "ptsched_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "ptsched_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "ptsched_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> io::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(io::Error::other)?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertMember { .. } => "insert_member",
        Command::SaveAvailabilityTemplate { .. } => "save_availability_template",
        Command::DeleteAvailabilityTemplate { .. } => "delete_availability_template",
        Command::InsertUnavailabilityTemplate { .. } => "insert_unavailability_template",
        Command::DeleteUnavailabilityTemplate { .. } => "delete_unavailability_template",
        Command::InsertSessionProduct { .. } => "insert_session_product",
        Command::DeleteSessionProduct { .. } => "delete_session_product",
        Command::ClaimClassCell { .. } => "claim_class_cell",
        Command::ReleaseClassCell { .. } => "release_class_cell",
        Command::InsertBooking { .. } => "insert_booking",
        Command::InsertRecurringOpenBookings { .. } => "insert_recurring_open_bookings",
        Command::GrantCredits { .. } => "grant_credits",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SettleOpenBookings { .. } => "settle_open_bookings",
        Command::SelectBlocks { .. } => "select_blocks",
        Command::SelectSegments { .. } => "select_segments",
        Command::SelectCreditBalance { .. } => "select_credit_balance",
        Command::SelectPtOccupancy { .. } => "select_pt_occupancy",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectLedgerAudit => "select_ledger_audit",
    }
}
