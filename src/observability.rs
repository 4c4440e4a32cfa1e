use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "bookd_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "bookd_query_duration_seconds";

// ── Lifecycle metrics ───────────────────────────────────────────

/// Counter: booking status writes. Labels: from, to.
pub const TRANSITIONS_TOTAL: &str = "bookd_transitions_total";

/// Counter: transitions refused before any side effect. Labels: reason.
pub const TRANSITION_REJECTIONS_TOTAL: &str = "bookd_transition_rejections_total";

/// Histogram: proposal scan time in seconds. Labels: mode.
pub const PROPOSAL_DURATION_SECONDS: &str = "bookd_proposal_duration_seconds";

/// Counter: proposals served. Labels: outcome (available, no_availability, error).
pub const PROPOSALS_TOTAL: &str = "bookd_proposals_total";

/// Counter: gateway capture attempts. Labels: status (ok, retry, failed).
pub const PAYMENT_CAPTURES_TOTAL: &str = "bookd_payment_captures_total";

/// Counter: schedule commits rejected because the slot was taken.
pub const COMMIT_CONFLICTS_TOTAL: &str = "bookd_commit_conflicts_total";

/// Counter: pending authorizations expired by the reaper.
pub const AUTHORIZATIONS_EXPIRED_TOTAL: &str = "bookd_authorizations_expired_total";

// ── Resource metrics ────────────────────────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "bookd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "bookd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bookd_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "bookd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookd_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a statement, for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProfile { .. } => "insert_profile",
        Command::SetWeeklyHours { .. } => "set_weekly_hours",
        Command::UpdatePreference { .. } => "update_preference",
        Command::InsertBlockedRange { .. } => "insert_blocked_range",
        Command::DeleteBlockedRange { .. } => "delete_blocked_range",
        Command::InsertProject { .. } => "insert_project",
        Command::InsertBooking { .. } => "insert_booking",
        Command::InsertQuote { .. } => "insert_quote",
        Command::InsertQuoteResponse { .. } => "insert_quote_response",
        Command::ReopenRfq { .. } => "reopen_rfq",
        Command::InsertTransition { .. } => "insert_transition",
        Command::InsertConfirmation { .. } => "insert_confirmation",
        Command::InsertPaymentCallback { .. } => "insert_payment_callback",
        Command::RetryPayment { .. } => "retry_payment",
        Command::InsertAnswers { .. } => "insert_answers",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectPayment { .. } => "select_payment",
        Command::SelectProposals { .. } => "select_proposals",
        Command::SelectFreeSpans { .. } => "select_free_spans",
    }
}
