use std::net::SocketAddr;

use crate::engine::EngineError;

// ── Admission and lifecycle ─────────────────────────────────────

/// Counter: confirm attempts (single line or whole booking). Labels: outcome.
pub const ADMISSIONS_TOTAL: &str = "rentcap_admissions_total";

/// Counter: successful line transitions. Labels: event.
pub const TRANSITIONS_TOTAL: &str = "rentcap_transitions_total";

/// Histogram: time spent waiting for a product's admission lock, in seconds.
pub const ADMISSION_LOCK_WAIT_SECONDS: &str = "rentcap_admission_lock_wait_seconds";

/// Counter: lock acquisitions that timed out and returned `Busy`.
pub const BUSY_TOTAL: &str = "rentcap_busy_total";

/// Counter: negative availability or reserved stock missing on move-out.
pub const INVARIANT_VIOLATIONS_TOTAL: &str = "rentcap_invariant_violations_total";

/// Counter: lines moved to finished by the sweeper.
pub const SWEPT_LINES_TOTAL: &str = "rentcap_swept_lines_total";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rentcap_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rentcap_wal_flush_batch_size";

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

/// Short label for an admission result.
pub fn admission_outcome<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "admitted",
        Err(EngineError::InsufficientCapacity { .. }) => "insufficient_capacity",
        Err(EngineError::Busy(_)) => "busy",
        Err(EngineError::InvalidTransition { .. }) => "invalid_transition",
        Err(EngineError::InvariantViolation(_)) => "invariant_violation",
        Err(EngineError::NotFound(_)) => "not_found",
        Err(_) => "error",
    }
}
