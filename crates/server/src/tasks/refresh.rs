//! Background refresh loops.
//!
//! Single-community mode runs one data ticker. Federation mode runs two
//! independent tickers: data refresh at the configured interval and full
//! re-discovery every 30 minutes. Every successful tick computes the diff
//! against the previously published snapshot and broadcasts it.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::diff;
use crate::store;

const DISCOVERY_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub async fn refresh_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(state.cfg.refresh_duration);
    // The initial refresh ran at startup; skip the immediate first tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let old = state.store.snapshot();
                if let Err(err) = store::refresh(&state.store, &state.client, &state.cfg).await {
                    warn!(?err, "data refresh failed");
                    continue;
                }
                let snap = state.store.snapshot();
                info!(
                    nodes = snap.stats.total_nodes,
                    online = snap.stats.online_nodes,
                    clients = snap.stats.total_clients,
                    links = snap.links.len(),
                    subscribers = state.hub.client_count(),
                    "data refreshed"
                );
                state.hub.broadcast(&diff::compute(&old, &snap));
            }
        }
    }
}

pub async fn federation_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let Some(federation) = state.federation.clone() else {
        return;
    };

    let mut data_ticker = tokio::time::interval(state.cfg.refresh_duration);
    let mut discovery_ticker = tokio::time::interval(DISCOVERY_INTERVAL);
    // Startup already refreshed (or restored) once; skip the immediate ticks.
    data_ticker.tick().await;
    discovery_ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = discovery_ticker.tick() => {
                let old = state.store.snapshot();
                if let Err(err) = federation.discover_and_refresh().await {
                    warn!(?err, "federation re-discovery failed");
                    continue;
                }
                let snap = state.store.snapshot();
                info!(
                    nodes = snap.stats.total_nodes,
                    online = snap.stats.online_nodes,
                    clients = snap.stats.total_clients,
                    subscribers = state.hub.client_count(),
                    "federation re-discovery complete"
                );
                state.hub.broadcast(&diff::compute(&old, &snap));
            }
            _ = data_ticker.tick() => {
                let old = state.store.snapshot();
                if let Err(err) = federation.refresh_all_sources().await {
                    warn!(?err, "federation data refresh failed");
                    continue;
                }
                let snap = state.store.snapshot();
                info!(
                    nodes = snap.stats.total_nodes,
                    online = snap.stats.online_nodes,
                    clients = snap.stats.total_clients,
                    subscribers = state.hub.client_count(),
                    "federation data refreshed"
                );
                state.hub.broadcast(&diff::compute(&old, &snap));
            }
        }
    }
}
