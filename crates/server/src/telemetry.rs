use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder once and return a handle for `/metrics`.
///
/// Idempotent so tests and embedded setups can call it repeatedly.
pub fn init_metrics_recorder() -> PrometheusHandle {
    RECORDER
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("install prometheus recorder")
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_install_is_idempotent() {
        let first = init_metrics_recorder();
        let _second = init_metrics_recorder();
        metrics::counter!("meshmap_test_counter").increment(1);
        assert!(first.render().contains("meshmap_test_counter"));
    }
}
