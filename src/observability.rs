use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: bookings accepted.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotbook_bookings_created_total";

/// Counter: booking attempts that lost a slot to a live booking.
pub const SLOT_CONFLICTS_TOTAL: &str = "slotbook_slot_conflicts_total";

/// Counter: status transitions applied. Labels: status (the new one).
pub const STATUS_TRANSITIONS_TOTAL: &str = "slotbook_status_transitions_total";

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
        Command::UpsertService { .. } => "upsert_service",
        Command::DeleteService { .. } => "delete_service",
        Command::UpsertMaster { .. } => "upsert_master",
        Command::DeleteMaster { .. } => "delete_master",
        Command::LinkMasterService { .. } => "link_master_service",
        Command::UnlinkMasterService { .. } => "unlink_master_service",
        Command::ReplaceSchedule { .. } => "replace_schedule",
        Command::ClearSchedule { .. } => "clear_schedule",
        Command::InsertBooking { .. } => "insert_booking",
        Command::InsertStatusChange { .. } => "insert_status_change",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::SelectServices => "select_services",
        Command::SelectMasters { .. } => "select_masters",
        Command::SelectMasterServices { .. } => "select_master_services",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectStatusChanges { .. } => "select_status_changes",
        Command::SelectBookingStats { .. } => "select_booking_stats",
        Command::SelectAdminStats => "select_admin_stats",
    }
}
