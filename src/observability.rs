use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "agenda_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "agenda_query_duration_seconds";

/// Counter: bookings and reschedules refused because the slot was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "agenda_booking_conflicts_total";

/// Counter: completions whose deferred-payment credit could not be opened.
pub const CREDIT_FAILURES_TOTAL: &str = "agenda_credit_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "agenda_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "agenda_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "agenda_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "agenda_tenants_active";

/// Counter: connections that ended in a protocol or auth error.
pub const CONNECTION_ERRORS_TOTAL: &str = "agenda_connection_errors_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "agenda_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "agenda_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "agenda_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::SelectTenant => "select_tenant",
        Command::UpdateSettings { .. } => "update_settings",
        Command::SetWeeklyHours { .. } => "set_weekly_hours",
        Command::SelectWeeklyHours { .. } => "select_weekly_hours",
        Command::SetLunchBreak { .. } => "set_lunch_break",
        Command::SelectLunchBreak => "select_lunch_break",
        Command::UpsertSpecialDay { .. } => "upsert_special_day",
        Command::DeleteSpecialDay { .. } => "delete_special_day",
        Command::SelectSpecialDays => "select_special_days",
        Command::SaveOffering { .. } => "save_offering",
        Command::DeleteOffering { .. } => "delete_offering",
        Command::SelectOfferings { .. } => "select_offerings",
        Command::SaveProfessional { .. } => "save_professional",
        Command::DeleteProfessional { .. } => "delete_professional",
        Command::SelectProfessionals { .. } => "select_professionals",
        Command::SelectSlots { .. } => "select_slots",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::CompleteAppointment { .. } => "complete_appointment",
        Command::CancelAppointment { .. } => "cancel_appointment",
        Command::RescheduleAppointment { .. } => "reschedule_appointment",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::InsertCredit { .. } => "insert_credit",
        Command::DeleteCredit { .. } => "delete_credit",
        Command::SelectCredits { .. } => "select_credits",
        Command::InsertCreditPayment { .. } => "insert_credit_payment",
    }
}
