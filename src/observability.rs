use std::net::SocketAddr;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const REQUESTS_TOTAL: &str = "roombook_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const REQUEST_DURATION_SECONDS: &str = "roombook_request_duration_seconds";

/// Counter: admission decisions. Labels: op, outcome.
pub const ADMISSIONS_TOTAL: &str = "roombook_admissions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: time spent waiting for a resource guard, in seconds.
pub const GUARD_WAIT_SECONDS: &str = "roombook_guard_wait_seconds";

/// Gauge: committed reservations held in memory.
pub const RESERVATIONS_LIVE: &str = "roombook_reservations_live";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roombook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roombook_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "roombook_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for an admission outcome.
pub fn outcome_label(result: &Result<(), &EngineError>) -> &'static str {
    match result {
        Ok(()) => "committed",
        Err(EngineError::SlotConflict(_)) => "rejected",
        Err(EngineError::InvalidInput(_) | EngineError::LimitExceeded(_)) => "invalid",
        Err(EngineError::NotFound(_) | EngineError::ResourceNotFound(_)) => "not_found",
        Err(EngineError::Busy(_)) => "busy",
        Err(EngineError::Unauthorized) => "unauthorized",
        Err(EngineError::WalError(_)) => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome_label(&Ok(())), "committed");
        assert_eq!(outcome_label(&Err(&EngineError::SlotConflict(Ulid::new()))), "rejected");
        assert_eq!(outcome_label(&Err(&EngineError::Busy("r".into()))), "busy");
        assert_eq!(outcome_label(&Err(&EngineError::LimitExceeded("x"))), "invalid");
    }
}
