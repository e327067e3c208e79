use std::env;
use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Resolve the exporter port from `port_env`, falling back to `default_port`.
/// A value of `0` disables the exporter.
pub fn resolve_port(port_env: &str, default_port: u16) -> u16 {
    env::var(port_env)
        .ok()
        .and_then(|raw| raw.trim().parse::<u16>().ok())
        .unwrap_or(default_port)
}

/// Initialize a Prometheus exporter listening on `0.0.0.0:<port>`.
///
/// Returns the already-installed handle on repeat calls, and `None` when the
/// resolved port is `0` or the recorder could not be installed.
pub fn init_metrics(port_env: &str, default_port: u16) -> Option<&'static PrometheusHandle> {
    if let Some(existing) = PROMETHEUS_HANDLE.get() {
        return Some(existing);
    }

    let port = resolve_port(port_env, default_port);
    if port == 0 {
        info!(metrics_env = port_env, "prometheus exporter disabled");
        return None;
    }

    match PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install_recorder()
    {
        Ok(handle) => {
            let _ = PROMETHEUS_HANDLE.set(handle);
            info!(metrics_port = port, "started prometheus exporter");
            PROMETHEUS_HANDLE.get()
        }
        Err(err) => {
            warn!(error = %err, metrics_port = port, "failed to start prometheus exporter");
            PROMETHEUS_HANDLE.get()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_port_falls_back_on_missing_or_garbage() {
        assert_eq!(resolve_port("BV_METRICS_TEST_PORT_UNSET", 9464), 9464);

        unsafe { env::set_var("BV_METRICS_TEST_PORT_GARBAGE", "not-a-port") };
        assert_eq!(resolve_port("BV_METRICS_TEST_PORT_GARBAGE", 9100), 9100);
        unsafe { env::remove_var("BV_METRICS_TEST_PORT_GARBAGE") };
    }

    #[test]
    fn zero_port_disables_exporter() {
        unsafe { env::set_var("BV_METRICS_TEST_PORT_ZERO", "0") };
        assert!(init_metrics("BV_METRICS_TEST_PORT_ZERO", 9464).is_none());
        unsafe { env::remove_var("BV_METRICS_TEST_PORT_ZERO") };
    }
}
