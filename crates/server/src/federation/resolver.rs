//! Concurrent probing of candidate data URLs.
//!
//! Each community is probed on its own task, bounded by the fetch
//! concurrency cap. Within one community the probe ladder is sequential:
//! richformat candidates first, then nodelists, then document locations
//! derived from the nodelist bases. A host that fails fatally (DNS, refused,
//! TLS, timeout) is skipped for the remainder of that community's pass and
//! retried on the next one.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use reqwest::header::CONTENT_TYPE;
use tracing::debug;
use url::Url;

use super::{Community, CommunitySource};
use crate::formats::SourceFormat;
use crate::snapshot::append_unique;
use crate::urlsafe;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(8);

/// Outcome of probing one URL.
pub enum Probe {
    Ok,
    /// The host itself is unreachable; other URLs on it are pointless.
    HostDead(String),
    Failed,
}

/// HEAD-probe a URL, demanding a non-HTML 200.
///
/// Single-page map frontends answer 200 `text/html` for any path, which
/// would mask a missing document endpoint, so HTML responses are rejected.
pub async fn probe_url(client: &reqwest::Client, url: &str, allow_private: bool) -> Probe {
    if !urlsafe::check_url(url, allow_private).await {
        return Probe::Failed;
    }
    let host = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();

    let resp = match client.head(url).timeout(PROBE_TIMEOUT).send().await {
        Ok(resp) => resp,
        Err(err) if err.is_timeout() || err.is_connect() => return Probe::HostDead(host),
        Err(_) => return Probe::Failed,
    };

    if resp.status().as_u16() != 200 {
        return Probe::Failed;
    }
    let html = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/html"));
    if html {
        return Probe::Failed;
    }
    Probe::Ok
}

/// Resolve one working source per community, deduplicated by final URL.
pub async fn resolve_sources(
    client: &reqwest::Client,
    communities: &[Community],
    concurrency: usize,
    allow_private: bool,
) -> Vec<CommunitySource> {
    let resolved: Vec<Vec<CommunitySource>> = stream::iter(communities.iter().cloned())
        .map(|community| {
            let client = client.clone();
            async move { resolve_community(&client, community, allow_private).await }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    dedup_by_url(resolved.into_iter().flatten().collect())
}

async fn resolve_community(
    client: &reqwest::Client,
    community: Community,
    allow_private: bool,
) -> Vec<CommunitySource> {
    let map_urls = collect_map_bases(&community);
    let mut dead_hosts: HashSet<String> = HashSet::new();
    let mut found: Vec<CommunitySource> = Vec::new();

    let source = |url: &str, format: SourceFormat| CommunitySource {
        community_key: community.key.clone(),
        community_keys: community.all_keys.clone(),
        data_url: url.to_string(),
        format,
        grafana_url: community.grafana_url.clone(),
        map_urls: map_urls.clone(),
    };

    // Probe every richformat candidate: one community may expose several
    // distinct data endpoints across domains or subpaths.
    for url in &community.snapshot_urls {
        if probe(client, url, &mut dead_hosts, allow_private).await {
            let format = if url.ends_with("/nodes.json") {
                SourceFormat::Nodes
            } else {
                SourceFormat::Richformat
            };
            found.push(source(url, format));
        }
    }

    // Nodelists only matter when nothing richer answered; one is enough.
    if found.is_empty() {
        for url in &community.nodelist_urls {
            if probe(client, url, &mut dead_hosts, allow_private).await {
                found.push(source(url, SourceFormat::Nodelist));
                break;
            }
        }
    }

    // A nodelist-only community may still serve a richer document next to
    // the nodelist; prefer adding that as an extra source.
    if !found.is_empty() && community.snapshot_urls.is_empty() {
        let mut tried: HashSet<String> = HashSet::new();
        for url in &community.nodelist_urls {
            let base = parent_path(url);
            for (candidate, format) in [
                (format!("{base}/meshviewer.json"), SourceFormat::Richformat),
                (format!("{base}/nodes.json"), SourceFormat::Nodes),
            ] {
                if tried.insert(candidate.clone()) && probe(client, &candidate, &mut dead_hosts, allow_private).await
                {
                    found.push(source(&candidate, format));
                    break;
                }
            }
        }
    }

    // Last resort: derive document locations from the nodelist directories.
    if found.is_empty() {
        let mut tried: HashSet<String> = community.snapshot_urls.iter().cloned().collect();
        'derive: for url in &community.nodelist_urls {
            let base = parent_path(url);
            for (candidate, format) in [
                (format!("{base}/meshviewer.json"), SourceFormat::Richformat),
                (format!("{base}/nodes.json"), SourceFormat::Nodes),
            ] {
                if tried.insert(candidate.clone()) && probe(client, &candidate, &mut dead_hosts, allow_private).await
                {
                    found.push(source(&candidate, format));
                    break 'derive;
                }
            }
        }
    }

    if found.is_empty() {
        debug!(community = %community.key, "no reachable data source");
    }
    found
}

async fn probe(
    client: &reqwest::Client,
    url: &str,
    dead_hosts: &mut HashSet<String>,
    allow_private: bool,
) -> bool {
    if let Ok(parsed) = Url::parse(url) {
        if let Some(host) = parsed.host_str() {
            if dead_hosts.contains(host) {
                return false;
            }
        }
    }
    match probe_url(client, url, allow_private).await {
        Probe::Ok => true,
        Probe::HostDead(host) => {
            if !host.is_empty() {
                dead_hosts.insert(host);
            }
            false
        }
        Probe::Failed => false,
    }
}

fn parent_path(url: &str) -> &str {
    match url.rfind('/') {
        Some(idx) if idx > 0 => &url[..idx],
        _ => url,
    }
}

/// Derive map-frontend base URLs from a document URL.
pub fn derive_bases(data_url: &str) -> Vec<String> {
    let mut bases = Vec::new();
    if let Some(idx) = data_url.rfind("/data/") {
        if idx > 0 {
            bases.push(data_url[..idx].to_string());
        }
    }
    if let Some(idx) = data_url.rfind('/') {
        // Anything shorter than "https://x" is just the scheme.
        if idx > 8 {
            let base = data_url[..idx].to_string();
            if bases.first() != Some(&base) {
                bases.push(base);
            }
        }
    }
    bases
}

/// All distinct map bases derivable from a community's candidate URLs.
pub fn collect_map_bases(community: &Community) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut bases = Vec::new();
    for url in community
        .snapshot_urls
        .iter()
        .chain(community.nodelist_urls.iter())
    {
        for base in derive_bases(url) {
            if seen.insert(base.clone()) {
                bases.push(base);
            }
        }
    }
    bases
}

/// Collapse sources sharing a data URL, unioning their alias keys.
fn dedup_by_url(sources: Vec<CommunitySource>) -> Vec<CommunitySource> {
    let mut keys_by_url: HashMap<String, Vec<String>> = HashMap::new();
    for source in &sources {
        let keys = keys_by_url.entry(source.data_url.clone()).or_default();
        for key in &source.community_keys {
            append_unique(keys, key);
        }
        append_unique(keys, &source.community_key);
    }

    let mut seen = HashSet::new();
    let mut deduped = Vec::with_capacity(sources.len());
    for mut source in sources {
        if seen.insert(source.data_url.clone()) {
            source.community_keys = keys_by_url
                .remove(&source.data_url)
                .unwrap_or_default();
            deduped.push(source);
        }
    }
    deduped
}
