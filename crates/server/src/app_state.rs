use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::AppConfig;
use crate::events::EventHub;
use crate::federation::Federation;
use crate::store::Store;

/// Shared application state passed into handlers.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<AppConfig>,
    pub store: Arc<Store>,
    pub hub: Arc<EventHub>,
    /// Present only when federation mode is enabled.
    pub federation: Option<Arc<Federation>>,
    pub client: reqwest::Client,
    pub metrics_handle: PrometheusHandle,
}

#[allow(dead_code)]
fn _assert_app_state_bounds() {
    fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
    assert_bounds::<AppState>();
}
