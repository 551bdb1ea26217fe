use std::net::SocketAddr;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Installs the process-wide Prometheus recorder for the `metrics` crate.
///
/// With an address, the exporter also serves `/metrics` there; without one,
/// counters are recorded but never exposed. Call once at startup, from within
/// the tokio runtime.
pub fn init_prometheus(listen: Option<SocketAddr>) -> anyhow::Result<()> {
    match listen {
        Some(addr) => {
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .with_context(|| format!("metrics: install Prometheus exporter on {addr}"))?;
            tracing::info!(addr = %addr, "metrics: exporter listening");
        }
        None => {
            PrometheusBuilder::new()
                .install_recorder()
                .context("metrics: install Prometheus recorder")?;
        }
    }
    describe();
    Ok(())
}

fn describe() {
    metrics::describe_counter!("rift_sessions_total", "Tunnel session attempts by outcome");
    metrics::describe_counter!(
        "rift_reconnect_signals_total",
        "Reconnect signals emitted after recoverable failures"
    );
    metrics::describe_counter!(
        "rift_inbound_connections_total",
        "Connections accepted on the remote listener"
    );
    metrics::describe_counter!(
        "rift_target_dial_failures_total",
        "Inbound connections dropped because the target was unreachable"
    );
    metrics::describe_counter!(
        "rift_bytes_inbound_total",
        metrics::Unit::Bytes,
        "Bytes copied from remote clients to the target"
    );
    metrics::describe_counter!(
        "rift_bytes_outbound_total",
        metrics::Unit::Bytes,
        "Bytes copied from the target back to remote clients"
    );
}
