pub mod app_state;
pub mod coerce;
pub mod config;
pub mod diff;
pub mod error;
pub mod events;
pub mod federation;
pub mod fetch;
pub mod formats;
pub mod http;
pub mod snapshot;
pub mod store;
pub mod tasks;
pub mod telemetry;
pub mod urlsafe;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app_state::AppState;
use crate::events::EventHub;
use crate::federation::Federation;
use crate::store::Store;

/// Parse argv: at most one positional config path.
pub fn parse_args() -> Result<Option<String>> {
    let mut args = std::env::args().skip(1);
    let Some(first) = args.next() else {
        return Ok(None);
    };

    match first.as_str() {
        "--help" | "-h" => {
            println!(
                "Usage: meshmap-server [config-path]\n\
                 Without arguments, ./config.{{toml,json,yaml}} is loaded when present."
            );
            std::process::exit(0);
        }
        _ if first.starts_with('-') => anyhow::bail!("unknown argument: {first}"),
        path => Ok(Some(path.to_string())),
    }
}

/// Boot the server: load config, restore or fetch initial data, start the
/// refresh loops, and serve HTTP until shutdown.
pub async fn run(config_path: Option<&str>) -> Result<()> {
    let cfg = Arc::new(config::load(config_path)?);
    let metrics_handle = telemetry::init_metrics_recorder();
    let client = fetch::build_client()?;
    let store = Arc::new(Store::new());
    let hub = Arc::new(EventHub::new());
    let federation = cfg
        .federation
        .then(|| Arc::new(Federation::new(cfg.clone(), client.clone(), store.clone())));

    let state = AppState {
        cfg: cfg.clone(),
        store: store.clone(),
        hub: hub.clone(),
        federation: federation.clone(),
        client,
        metrics_handle,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(federation) = &federation {
        if federation.restore_state().await {
            info!("serving cached federation data, refreshing in background");
            let federation = federation.clone();
            let background_state = state.clone();
            tokio::spawn(async move {
                let old = background_state.store.snapshot();
                if let Err(err) = federation.discover_and_refresh().await {
                    warn!(?err, "background federation refresh failed");
                    return;
                }
                let snap = background_state.store.snapshot();
                info!(
                    nodes = snap.stats.total_nodes,
                    online = snap.stats.online_nodes,
                    "background federation refresh complete"
                );
                background_state
                    .hub
                    .broadcast(&diff::compute(&old, &snap));
            });
        } else {
            info!("no federation cache, performing initial discovery");
            if let Err(err) = federation.discover_and_refresh().await {
                warn!(?err, "initial federation discovery failed");
            }
        }
        tokio::spawn(tasks::refresh::federation_loop(
            state.clone(),
            shutdown_rx.clone(),
        ));
    } else {
        if let Err(err) = store::refresh(&store, &state.client, &cfg).await {
            warn!(?err, "initial data fetch failed");
        }
        tokio::spawn(tasks::refresh::refresh_loop(
            state.clone(),
            shutdown_rx.clone(),
        ));
    }

    let addr: SocketAddr = cfg
        .listen
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address {}: {err}", cfg.listen))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, site = %cfg.site_name, federation = cfg.federation, "meshmap listening");

    let app = http::build_router(state);

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // Open event streams would hold graceful shutdown forever; closing the
    // hub ends them once the signal fires.
    let hub_on_shutdown = hub.clone();
    let mut hub_shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        let _ = hub_shutdown_rx.changed().await;
        hub_on_shutdown.close_all();
    });

    let mut serve_shutdown_rx = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown_rx.changed().await;
        })
        .await?;

    info!("shutdown complete");
    Ok(())
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }

    // Give in-flight responses a moment before the listener closes.
    tokio::time::sleep(Duration::from_millis(100)).await;
}
