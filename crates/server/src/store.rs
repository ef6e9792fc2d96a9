//! Published-snapshot store and the single-community refresh path.

use std::sync::{Arc, RwLock};

use anyhow::{bail, Context};

use crate::config::AppConfig;
use crate::fetch;
use crate::formats::{self, RawSnapshot, SourceFormat};
use crate::snapshot::{self, Snapshot};
use crate::urlsafe;

/// Upstream snapshot documents are capped at 20 MiB.
pub const SNAPSHOT_BODY_CAP: usize = 20 * 1024 * 1024;

/// Holds the currently published snapshot.
///
/// Publication swaps a single `Arc` under the write lock; readers clone the
/// `Arc` under the read lock, so no reader ever sees a half-built snapshot
/// and published snapshots are never mutated.
pub struct Store {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().expect("snapshot lock poisoned").clone()
    }

    pub fn publish(&self, snapshot: Arc<Snapshot>) {
        *self.snapshot.write().expect("snapshot lock poisoned") = snapshot;
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetch and parse one richformat snapshot document.
pub async fn fetch_snapshot(
    client: &reqwest::Client,
    url: &str,
    allow_private: bool,
) -> anyhow::Result<RawSnapshot> {
    if !urlsafe::check_url(url, allow_private).await {
        bail!("unsafe data url {url}");
    }
    let resp = client
        .get(url)
        .send()
        .await
        .context("fetching data source")?;
    if resp.status().as_u16() != 200 {
        bail!("unexpected status {} from data source", resp.status());
    }
    let body = fetch::read_capped(resp, SNAPSHOT_BODY_CAP).await?;
    formats::parse(SourceFormat::Richformat, &body)
}

/// Single-community refresh: fetch the configured source, rebuild, publish.
pub async fn refresh(
    store: &Store,
    client: &reqwest::Client,
    cfg: &AppConfig,
) -> anyhow::Result<()> {
    let raw = fetch_snapshot(client, &cfg.data_url, cfg.allow_private_upstreams).await?;
    let snap = snapshot::build(&raw, &cfg.domain_names);
    store.publish(Arc::new(snap));
    Ok(())
}
