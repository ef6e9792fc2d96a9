//! Community discovery from the global directory document.
//!
//! The directory is a JSON object keyed by community key. Each entry is
//! parsed tolerantly (a malformed entry is skipped, not fatal), candidate
//! data URLs are derived from its `nodeMaps`, and entries sharing a human
//! name are collapsed into one logical community.

use std::collections::HashMap;

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use url::Url;

use super::Community;
use crate::coerce;
use crate::fetch;
use crate::snapshot::append_unique;

/// Directory documents are capped at 10 MiB.
const DIRECTORY_BODY_CAP: usize = 10 * 1024 * 1024;

#[derive(Deserialize, Default)]
#[serde(default)]
struct DirEntry {
    name: String,
    url: String,
    metacommunity: String,
    location: Option<DirLocation>,
    state: Option<DirState>,
    #[serde(rename = "nodeMaps")]
    node_maps: Vec<DirNodeMap>,
    services: Vec<DirService>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DirLocation {
    lat: f64,
    lon: f64,
    #[serde(rename = "geoCode")]
    geo_code: Option<DirGeoCode>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DirGeoCode {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DirState {
    nodes: Value,
    lastchange: Value,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DirNodeMap {
    url: String,
    #[serde(rename = "technicalType")]
    technical_type: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DirService {
    #[serde(rename = "serviceName")]
    service_name: String,
    #[serde(rename = "externalUri")]
    external_uri: String,
    #[serde(rename = "internalUri")]
    internal_uri: String,
}

/// Fetch the directory and extract every community that has candidate URLs.
pub async fn discover_communities(
    client: &reqwest::Client,
    directory_url: &str,
) -> anyhow::Result<Vec<Community>> {
    let resp = client
        .get(directory_url)
        .send()
        .await
        .context("fetching community directory")?;
    if resp.status().as_u16() != 200 {
        bail!("community directory returned {}", resp.status());
    }
    let body = fetch::read_capped(resp, DIRECTORY_BODY_CAP).await?;
    let communities = parse_directory(&body)?;
    info!(
        communities = communities.len(),
        "consolidated directory into unique communities"
    );
    Ok(communities)
}

pub(crate) fn parse_directory(body: &[u8]) -> anyhow::Result<Vec<Community>> {
    let directory: HashMap<String, Value> =
        serde_json::from_slice(body).context("parsing directory JSON")?;

    let mut communities = Vec::new();
    // Deterministic iteration keeps collapse results stable across runs.
    let mut keys: Vec<&String> = directory.keys().collect();
    keys.sort();

    for key in keys {
        let Ok(entry) = serde_json::from_value::<DirEntry>(directory[key].clone()) else {
            continue;
        };
        if let Some(community) = community_from_entry(key, entry) {
            communities.push(community);
        }
    }

    Ok(collapse_by_name(communities))
}

fn community_from_entry(key: &str, entry: DirEntry) -> Option<Community> {
    let mut community = Community {
        key: key.to_string(),
        name: entry.name,
        url: entry.url,
        metacommunity: entry.metacommunity,
        ..Default::default()
    };

    if let Some(location) = entry.location {
        if location.lat != 0.0 {
            community.lat = location.lat;
            community.lng = location.lon;
        } else if let Some(geo) = location.geo_code {
            community.lat = geo.lat;
            community.lng = geo.lon;
        }
    }

    if let Some(state) = entry.state {
        community.nodes = coerce::as_i64(&state.nodes);
        community.last_changed = coerce::as_string(&state.lastchange);
    }

    for map in entry.node_maps {
        add_candidate_urls(&mut community, &map.url, &map.technical_type);
    }

    for service in entry.services {
        let name = service.service_name.to_lowercase();
        if !name.contains("grafana") && !name.contains("stats") {
            continue;
        }
        let uri = if service.external_uri.is_empty() {
            service.internal_uri
        } else {
            service.external_uri
        };
        if uri.starts_with("http://") || uri.starts_with("https://") {
            community.grafana_url = uri;
            break;
        }
    }

    if community.snapshot_urls.is_empty() && community.nodelist_urls.is_empty() {
        return None;
    }
    Some(community)
}

fn add_candidate_urls(community: &mut Community, raw_url: &str, technical_type: &str) {
    let mut url = raw_url.trim().to_string();
    if url.is_empty() {
        return;
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        url = format!("https://{url}");
    }

    let tt = technical_type.to_lowercase();
    let map_type = matches!(tt.as_str(), "meshviewer" | "hopglass" | "ffmap");

    if map_type && url.ends_with(".json") {
        // Direct document URL; the exact format is detected at resolve time.
        community.snapshot_urls.push(url);
    } else if tt == "nodelist" {
        community.nodelist_urls.push(url);
    } else if map_type {
        // A map frontend base: derive the usual document locations.
        let base = url.trim_end_matches('/').to_string();
        community.snapshot_urls.push(format!("{base}/data/meshviewer.json"));
        community.snapshot_urls.push(format!("{base}/meshviewer.json"));
        community.snapshot_urls.push(format!("{base}/data/nodes.json"));
        community.snapshot_urls.push(format!("{base}/nodes.json"));
        if let Ok(parsed) = Url::parse(&url) {
            if let Some(host) = parsed.host_str() {
                let root = format!("{}://{}/data/meshviewer.json", parsed.scheme(), host);
                if root != format!("{base}/data/meshviewer.json") {
                    community.snapshot_urls.push(root);
                }
            }
        }
    }
}

/// Collapse entries sharing a human name into one logical community.
///
/// The sub-entry reporting the most nodes becomes the primary key (ties break
/// to the lexicographically smaller key); URLs and alias keys are unioned.
fn collapse_by_name(communities: Vec<Community>) -> Vec<Community> {
    let mut merged: Vec<Community> = Vec::new();
    let mut index_by_name: HashMap<String, usize> = HashMap::new();

    for community in communities {
        let Some(&idx) = index_by_name.get(&community.name) else {
            index_by_name.insert(community.name.clone(), merged.len());
            let mut first = community;
            first.all_keys = vec![first.key.clone()];
            merged.push(first);
            continue;
        };

        let existing = &mut merged[idx];
        existing.all_keys.push(community.key.clone());

        if community.nodes > existing.nodes
            || (community.nodes == existing.nodes && community.key < existing.key)
        {
            existing.key = community.key;
            existing.nodes = community.nodes;
            existing.lat = community.lat;
            existing.lng = community.lng;
        }
        for url in &community.snapshot_urls {
            append_unique(&mut existing.snapshot_urls, url);
        }
        for url in &community.nodelist_urls {
            append_unique(&mut existing.nodelist_urls, url);
        }
        if existing.grafana_url.is_empty() && !community.grafana_url.is_empty() {
            existing.grafana_url = community.grafana_url;
        }
        if existing.metacommunity.is_empty() && !community.metacommunity.is_empty() {
            existing.metacommunity = community.metacommunity;
        }
    }

    merged.sort_by(|a, b| b.nodes.cmp(&a.nodes));
    merged
}
