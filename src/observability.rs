use std::net::SocketAddr;

// ── Negotiation ─────────────────────────────────────────────────

/// Counter: committed transitions. Labels: transition.
pub const TRANSITIONS_TOTAL: &str = "parley_transitions_total";

/// Counter: failed engine calls. Labels: code.
pub const ERRORS_TOTAL: &str = "parley_errors_total";

/// Counter: slots declared by the provider.
pub const SLOTS_DECLARED_TOTAL: &str = "parley_slots_declared_total";

/// Counter: waitlisted requests matched to a newly opened slot.
pub const WAITLIST_MATCHES_TOTAL: &str = "parley_waitlist_matches_total";

/// Counter: requests expired by the sweeper.
pub const SWEEP_EXPIRED_TOTAL: &str = "parley_sweep_expired_total";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "parley_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (records per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "parley_journal_flush_batch_size";

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
