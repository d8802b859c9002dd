use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "tabletime_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tabletime_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: activities created. Labels: category.
pub const ACTIVITIES_CREATED_TOTAL: &str = "tabletime_activities_created_total";

/// Counter: rejected mutations. Labels: kind (conflict, policy, unauthorized, ...).
pub const REJECTIONS_TOTAL: &str = "tabletime_rejections_total";

/// Counter: reminders handed to the reminder sink.
pub const REMINDERS_SENT_TOTAL: &str = "tabletime_reminders_sent_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tabletime_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tabletime_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tabletime_connections_rejected_total";

/// Gauge: number of loaded club engines.
pub const CLUBS_ACTIVE: &str = "tabletime_clubs_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "tabletime_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tabletime_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tabletime_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectSlots(_) => "select_slots",
        Command::SelectActivities { .. } => "select_activities",
        Command::SelectActivity { .. } => "select_activity",
        Command::InsertBooking(_) => "insert_booking",
        Command::InsertBlock(_) => "insert_block",
        Command::ChangeStatus { .. } => "change_status",
        Command::DeleteActivity { .. } => "delete_activity",
        Command::SetAuthorization { .. } => "set_authorization",
        Command::SetRole { .. } => "set_role",
    }
}
