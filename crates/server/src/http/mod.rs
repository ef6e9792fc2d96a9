//! HTTP surface: read-only JSON endpoints, the event stream, and the
//! sanitized time-series proxy.

mod api;
mod events;
mod metrics_proxy;

use axum::extract::State;
use axum::http::header::{self, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::compression::CompressionLayer;

use crate::app_state::AppState;

pub fn build_router(state: AppState) -> Router {
    let mut router = Router::<AppState>::new()
        .merge(api::router())
        .merge(events::router())
        .merge(metrics_proxy::router())
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics));

    if state.federation.is_some() {
        router = router.merge(api::federation_router());
    }

    router
        // Gzip for clients that advertise it; the default predicate exempts
        // the text/event-stream endpoint.
        .layer(CompressionLayer::new())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics_handle.render(),
    )
        .into_response()
}

/// JSON response with an explicit Cache-Control directive.
pub(crate) fn cached_json<T: Serialize>(value: &T, cache_control: &'static str) -> Response {
    let mut resp = Json(value).into_response();
    resp.headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
    resp
}
