//! Tracing subscriber and Prometheus recorder installation.

use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the fmt subscriber with env-driven filtering. Safe to call more
/// than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Ensure the global metrics recorder is installed and return its handle.
pub fn init_metrics_recorder() -> PrometheusHandle {
    PROM_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();

            if metrics::set_global_recorder(recorder).is_err() {
                tracing::warn!("metrics recorder already installed");
            }

            let upkeep_handle = handle.clone();
            thread::Builder::new()
                .name("prometheus-upkeep".into())
                .spawn(move || loop {
                    thread::sleep(Duration::from_secs(5));
                    upkeep_handle.run_upkeep();
                })
                .expect("failed to spawn prometheus upkeep thread");

            handle
        })
        .clone()
}
