//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::RelayError;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, RelayError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| RelayError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// `WebSocket` connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// `WebSocket` disconnections (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Currently connected peers (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Peer connection lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Inbound messages (counter, labels: type).
pub const MESSAGES_RECEIVED_TOTAL: &str = "relay_messages_received_total";
/// Inbound messages rejected before dispatch (counter).
pub const MESSAGES_REJECTED_TOTAL: &str = "relay_messages_rejected_total";
/// Broadcast sends that failed for a single peer (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "relay_broadcast_drops_total";
/// Keepalive probes issued (counter).
pub const KEEPALIVE_PROBES_TOTAL: &str = "relay_keepalive_probes_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_from_local_recorder() {
        // Build a recorder + handle (no global install to avoid test conflicts).
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            MESSAGES_RECEIVED_TOTAL,
            MESSAGES_REJECTED_TOTAL,
            BROADCAST_DROPS_TOTAL,
            KEEPALIVE_PROBES_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
