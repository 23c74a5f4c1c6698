use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking admissions. Labels: outcome.
pub const ADMISSIONS_TOTAL: &str = "chairbook_admissions_total";

/// Counter: slot generation queries served.
pub const SLOT_QUERIES_TOTAL: &str = "chairbook_slot_queries_total";

/// Histogram: slot generation latency in seconds.
pub const SLOT_QUERY_DURATION_SECONDS: &str = "chairbook_slot_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "chairbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "chairbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "chairbook_wal_flush_batch_size";

/// Install the fmt subscriber, honouring `RUST_LOG`. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

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
