use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;
    describe();
    Ok(handle)
}

fn describe() {
    metrics::describe_counter!("ktunnel_channels_total", "Channels opened through the tunnel");
    metrics::describe_gauge!("ktunnel_channels_active", "Channels currently registered");
    metrics::describe_counter!(
        "ktunnel_channels_refused_total",
        "Channels refused because max_tunnels was reached"
    );
    metrics::describe_counter!(
        "ktunnel_bytes_to_tunnel_total",
        metrics::Unit::Bytes,
        "Bytes read from direct sockets and sent into the tunnel"
    );
    metrics::describe_counter!(
        "ktunnel_bytes_from_tunnel_total",
        metrics::Unit::Bytes,
        "Bytes received from the tunnel and written to direct sockets"
    );
    metrics::describe_counter!(
        "ktunnel_control_sessions_total",
        "Control connections that logged in successfully"
    );
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
