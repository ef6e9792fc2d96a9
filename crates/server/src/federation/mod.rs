//! Federation: discover every community, resolve a working source per
//! community, fetch and merge all of them into one published snapshot.

pub mod directory;
pub mod grafana;
pub mod resolver;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::bail;
use chrono::{SecondsFormat, Utc};
use futures_util::stream::{self, StreamExt};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::fetch;
use crate::formats::{self, RawLink, RawLocation, RawNode, RawSnapshot, SourceFormat};
use crate::snapshot::{self, append_unique, Snapshot};
use crate::store::{Store, SNAPSHOT_BODY_CAP};
use crate::urlsafe;

pub use grafana::{GrafanaCache, GrafanaInfo};

pub const STATE_FILE: &str = "federation_state.json";

/// A discovered community. Replaced wholesale on re-discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Community {
    pub key: String,
    pub name: String,
    pub url: String,
    pub lat: f64,
    pub lng: f64,
    /// Node count reported by the directory, not by the community itself.
    pub nodes: i64,
    pub snapshot_urls: Vec<String>,
    pub nodelist_urls: Vec<String>,
    pub grafana_url: String,
    pub metacommunity: String,
    /// Sibling keys collapsed under this community's name.
    pub all_keys: Vec<String>,
    pub last_changed: String,
}

/// A resolved data endpoint for a community.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunitySource {
    pub community_key: String,
    /// Every alias key sharing this endpoint.
    pub community_keys: Vec<String>,
    pub data_url: String,
    pub format: SourceFormat,
    pub grafana_url: String,
    /// Map-frontend bases used by metadata discovery.
    pub map_urls: Vec<String>,
}

#[derive(Default)]
struct FedState {
    communities: Vec<Community>,
    sources: Vec<CommunitySource>,
    grafana: GrafanaCache,
    /// node id -> community keys that contributed it.
    node_communities: HashMap<String, Vec<String>>,
}

/// Orchestrates discovery, refresh, merge, and state persistence.
///
/// The orchestrator is the sole writer of both the published snapshot and
/// the on-disk state; HTTP handlers only read through the getters.
pub struct Federation {
    cfg: Arc<AppConfig>,
    client: reqwest::Client,
    store: Arc<Store>,
    inner: RwLock<FedState>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(default)]
struct StateCache {
    communities: Vec<Community>,
    sources: Vec<CommunitySource>,
    node_comm_map: HashMap<String, Vec<String>>,
    snapshot: Option<SnapshotCache>,
    saved_at: String,
}

#[derive(Serialize, Deserialize)]
struct SnapshotCache {
    nodes: Vec<RawNode>,
    links: Vec<RawLink>,
}

impl Federation {
    pub fn new(cfg: Arc<AppConfig>, client: reqwest::Client, store: Arc<Store>) -> Self {
        Self {
            cfg,
            client,
            store,
            inner: RwLock::new(FedState::default()),
        }
    }

    fn state_path(&self) -> PathBuf {
        PathBuf::from(&self.cfg.state_dir).join(STATE_FILE)
    }

    pub fn communities(&self) -> Vec<Community> {
        self.inner.read().expect("federation lock poisoned").communities.clone()
    }

    pub fn sources(&self) -> Vec<CommunitySource> {
        self.inner.read().expect("federation lock poisoned").sources.clone()
    }

    pub fn grafana_cache(&self) -> GrafanaCache {
        self.inner.read().expect("federation lock poisoned").grafana.clone()
    }

    /// Best time-series metadata for a node, plus the node's original id
    /// (gateway ids carry a `_{community-key}` suffix after the merge).
    pub fn grafana_info_for_node(&self, node_id: &str) -> (Option<GrafanaInfo>, String) {
        let state = self.inner.read().expect("federation lock poisoned");
        let keys = state
            .node_communities
            .get(node_id)
            .cloned()
            .unwrap_or_default();

        let mut original_id = node_id.to_string();
        for key in &keys {
            let suffix = format!("_{key}");
            if let Some(stripped) = node_id.strip_suffix(&suffix) {
                original_id = stripped.to_string();
                break;
            }
        }

        let mut fallback: Option<GrafanaInfo> = None;
        for key in &keys {
            if let Some(info) = state.grafana.get(key) {
                if info.datasource_id.is_some() {
                    return (Some(info.clone()), original_id);
                }
                if fallback.is_none() && !info.base_url.is_empty() {
                    fallback = Some(info.clone());
                }
            }
        }
        (fallback, original_id)
    }

    /// Load cached state from disk and publish a snapshot rebuilt from it.
    /// Returns false when there is no usable cache.
    pub async fn restore_state(&self) -> bool {
        let path = self.state_path();
        let Ok(data) = tokio::fs::read(&path).await else {
            return false;
        };

        let cache: StateCache = match serde_json::from_slice(&data) {
            Ok(cache) => cache,
            Err(err) => {
                warn!(?err, "corrupt federation state cache, ignoring");
                return false;
            }
        };
        let Some(snap_cache) = cache.snapshot else {
            return false;
        };
        if cache.communities.is_empty() || cache.sources.is_empty() {
            return false;
        }

        let grafana = grafana::load_cache(&grafana::cache_path(&self.cfg.state_dir)).await;

        let raw = RawSnapshot {
            timestamp: cache.saved_at.clone(),
            nodes: snap_cache.nodes,
            links: snap_cache.links,
        };
        let domain_names = augmented_domain_names(&cache.communities, &self.cfg.domain_names);
        let mut snap = snapshot::build(&raw, &domain_names);
        apply_community_tags(&mut snap, &cache.node_comm_map);

        info!(
            communities = cache.communities.len(),
            sources = cache.sources.len(),
            nodes = raw.nodes.len(),
            saved_at = %cache.saved_at,
            "restored federation state from cache"
        );

        {
            let mut state = self.inner.write().expect("federation lock poisoned");
            state.communities = cache.communities;
            state.sources = cache.sources;
            state.node_communities = cache.node_comm_map;
            state.grafana = grafana;
        }
        self.store.publish(Arc::new(snap));
        true
    }

    /// Persist communities, sources, the node/community multi-map, and the
    /// published snapshot in raw form. Best-effort: errors only log.
    pub async fn save_state(&self) {
        let (communities, sources, node_comm_map) = {
            let state = self.inner.read().expect("federation lock poisoned");
            (
                state.communities.clone(),
                state.sources.clone(),
                state.node_communities.clone(),
            )
        };

        let snap = self.store.snapshot();
        if snap.nodes.is_empty() {
            return;
        }

        let nodes: Vec<RawNode> = snap
            .order
            .iter()
            .filter_map(|id| snap.nodes.get(id))
            .map(raw_from_node)
            .collect();
        let links: Vec<RawLink> = snap
            .links
            .iter()
            .map(|l| RawLink {
                source: l.source.clone(),
                target: l.target.clone(),
                source_tq: l.source_tq,
                target_tq: l.target_tq,
                link_type: l.link_type.clone(),
            })
            .collect();

        let cache = StateCache {
            communities,
            sources,
            node_comm_map,
            snapshot: Some(SnapshotCache {
                nodes,
                links,
            }),
            saved_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };

        let data = match serde_json::to_vec(&cache) {
            Ok(data) => data,
            Err(err) => {
                warn!(?err, "failed to serialize federation state");
                return;
            }
        };
        let path = self.state_path();
        match tokio::fs::write(&path, &data).await {
            Ok(()) => info!(
                nodes = cache.snapshot.as_ref().map(|s| s.nodes.len()).unwrap_or(0),
                sources = cache.sources.len(),
                bytes = data.len(),
                "saved federation state"
            ),
            Err(err) => warn!(?err, path = %path.display(), "failed to write federation state"),
        }
    }

    /// Re-run community discovery, source resolution, and metadata
    /// discovery, then refresh all sources.
    pub async fn discover_and_refresh(&self) -> anyhow::Result<()> {
        info!(directory = %self.cfg.directory_url, "discovering communities");
        let mut communities =
            directory::discover_communities(&self.client, &self.cfg.directory_url).await?;
        info!(
            communities = communities.len(),
            "communities with candidate data URLs"
        );

        let mut sources = resolver::resolve_sources(
            &self.client,
            &communities,
            self.cfg.fetch_concurrency,
            self.cfg.allow_private_upstreams,
        )
        .await;
        info!(sources = sources.len(), "communities with reachable data sources");

        let mut cache = grafana::discover(
            &self.client,
            &sources,
            &communities,
            &grafana::cache_path(&self.cfg.state_dir),
            self.cfg.fetch_concurrency,
            self.cfg.allow_private_upstreams,
        )
        .await;

        // Copy discovered metadata onto alias keys and fill missing base
        // URLs on sources and communities.
        for community in &communities {
            if let Some(info) = cache.get(&community.key).cloned() {
                for alias in &community.all_keys {
                    cache.entry(alias.clone()).or_insert_with(|| info.clone());
                }
            }
        }
        for source in &mut sources {
            if source.grafana_url.is_empty() {
                if let Some(info) = cache.get(&source.community_key) {
                    source.grafana_url = info.base_url.clone();
                }
            }
        }
        for community in &mut communities {
            if community.grafana_url.is_empty() {
                if let Some(info) = cache.get(&community.key) {
                    community.grafana_url = info.base_url.clone();
                }
            }
        }

        graft_data_path_sources(
            &mut sources,
            &communities,
            &cache,
            self.cfg.allow_private_upstreams,
        )
        .await;

        {
            let mut state = self.inner.write().expect("federation lock poisoned");
            state.communities = communities;
            state.sources = sources;
            state.grafana = cache;
        }

        self.refresh_all_sources().await
    }

    /// Fetch every resolved source, merge, rebuild, publish, persist.
    pub async fn refresh_all_sources(&self) -> anyhow::Result<()> {
        let sources = self.sources();
        if sources.is_empty() {
            bail!("no data sources available");
        }

        let allow_private = self.cfg.allow_private_upstreams;
        let fetched: Vec<(CommunitySource, anyhow::Result<RawSnapshot>)> =
            stream::iter(sources.into_iter())
                .map(|source| {
                    let client = self.client.clone();
                    async move {
                        let result = fetch_source(&client, &source, allow_private).await;
                        (source, result)
                    }
                })
                .buffer_unordered(self.cfg.fetch_concurrency.max(1))
                .collect()
                .await;

        let total = fetched.len();
        let mut ok = Vec::with_capacity(total);
        let mut failures = 0usize;
        for (source, result) in fetched {
            match result {
                Ok(raw) => ok.push((source, raw)),
                Err(err) => {
                    failures += 1;
                    warn!(
                        community = %source.community_key,
                        url = %source.data_url,
                        ?err,
                        "source refresh failed"
                    );
                }
            }
        }
        counter!("meshmap_source_refreshes_total", "outcome" => "ok")
            .increment((total - failures) as u64);
        counter!("meshmap_source_refreshes_total", "outcome" => "error").increment(failures as u64);

        let succeeded = ok.len();
        let (merged, node_comm_map) = merge_sources(ok);
        info!(
            sources_ok = succeeded,
            sources_total = total,
            failures,
            nodes = merged.nodes.len(),
            links = merged.links.len(),
            "merged federation sources"
        );

        let communities = self.communities();
        let domain_names = augmented_domain_names(&communities, &self.cfg.domain_names);
        let mut snap = snapshot::build(&merged, &domain_names);
        apply_community_tags(&mut snap, &node_comm_map);
        gauge!("meshmap_nodes").set(snap.stats.total_nodes as f64);
        gauge!("meshmap_nodes_online").set(snap.stats.online_nodes as f64);

        {
            let mut state = self.inner.write().expect("federation lock poisoned");
            state.node_communities = node_comm_map;
        }
        self.store.publish(Arc::new(snap));

        self.save_state().await;
        Ok(())
    }
}

/// Fetch one source document and run it through the matching adapter.
async fn fetch_source(
    client: &reqwest::Client,
    source: &CommunitySource,
    allow_private: bool,
) -> anyhow::Result<RawSnapshot> {
    if !urlsafe::check_url(&source.data_url, allow_private).await {
        bail!("unsafe data url {}", source.data_url);
    }
    let resp = client.get(&source.data_url).send().await?;
    if resp.status().as_u16() != 200 {
        bail!("status {}", resp.status());
    }
    let body = fetch::read_capped(resp, SNAPSHOT_BODY_CAP).await?;
    formats::parse(source.format, &body)
}

/// Merge fetched snapshots into one raw document.
///
/// Gateway node ids are suffixed with `_{community-key}` so gateways with
/// identical ids in different communities stay distinct; links and
/// `gateway` back-references are rewritten in lockstep within the same
/// source. The first source to contribute a node id wins; later sources
/// only add their community keys to the multi-map. Links are deduplicated
/// by ordered `source>target` pair.
pub(crate) fn merge_sources(
    results: Vec<(CommunitySource, RawSnapshot)>,
) -> (RawSnapshot, HashMap<String, Vec<String>>) {
    let mut merged = RawSnapshot {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        ..Default::default()
    };
    let mut node_comm_map: HashMap<String, Vec<String>> = HashMap::new();
    let mut seen_links: std::collections::HashSet<String> = std::collections::HashSet::new();

    for (source, mut raw) in results {
        let all_keys = if source.community_keys.is_empty() {
            vec![source.community_key.clone()]
        } else {
            source.community_keys.clone()
        };

        let mut gateway_renames: HashMap<String, String> = HashMap::new();
        for node in &mut raw.nodes {
            if node.is_gateway && !node.node_id.is_empty() {
                let suffixed = format!("{}_{}", node.node_id, source.community_key);
                gateway_renames.insert(node.node_id.clone(), suffixed.clone());
                node.node_id = suffixed;
            }
        }
        for node in &mut raw.nodes {
            if let Some(renamed) = gateway_renames.get(&node.gateway) {
                node.gateway = renamed.clone();
            }
        }
        for link in &mut raw.links {
            if let Some(renamed) = gateway_renames.get(&link.source) {
                link.source = renamed.clone();
            }
            if let Some(renamed) = gateway_renames.get(&link.target) {
                link.target = renamed.clone();
            }
        }

        for mut node in raw.nodes {
            if node.node_id.is_empty() {
                continue;
            }
            if node.domain.is_empty() {
                node.domain = source.community_key.clone();
            }

            let keys = node_comm_map.entry(node.node_id.clone()).or_default();
            let already_present = !keys.is_empty();
            for key in &all_keys {
                append_unique(keys, key);
            }
            if !already_present {
                merged.nodes.push(node);
            }
        }

        for link in raw.links {
            let pair = format!("{}>{}", link.source, link.target);
            if seen_links.insert(pair) {
                merged.links.push(link);
            }
        }
    }

    (merged, node_comm_map)
}

/// Layer `{community key -> community name}` underneath the operator map.
fn augmented_domain_names(
    communities: &[Community],
    configured: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut names: HashMap<String, String> = communities
        .iter()
        .map(|c| (c.key.clone(), c.name.clone()))
        .collect();
    for (key, value) in configured {
        names.insert(key.clone(), value.clone());
    }
    names
}

/// Set `community`/`communities` on every tagged node and recount the
/// per-community stats.
fn apply_community_tags(snap: &mut Snapshot, node_comm_map: &HashMap<String, Vec<String>>) {
    let mut counts: HashMap<String, i64> = HashMap::new();
    for (id, node) in snap.nodes.iter_mut() {
        let Some(keys) = node_comm_map.get(id) else {
            continue;
        };
        if keys.is_empty() {
            continue;
        }
        node.community = keys[0].clone();
        node.communities = keys.clone();
        for key in keys {
            *counts.entry(key.clone()).or_default() += 1;
        }
    }
    snap.stats.communities = counts;
}

/// Communities with no resolved source but cached dataPath entries get
/// those grafted in as richformat sources; a dataPath equal to an existing
/// source URL tags the community's alias keys onto that source instead.
///
/// dataPath entries are scraped from upstream config documents, so each one
/// passes the URL gate before it can become a fetch target.
async fn graft_data_path_sources(
    sources: &mut Vec<CommunitySource>,
    communities: &[Community],
    cache: &GrafanaCache,
    allow_private: bool,
) {
    let mut has_source: std::collections::HashSet<String> = sources
        .iter()
        .map(|s| s.community_key.clone())
        .collect();
    let mut index_by_url: HashMap<String, usize> = sources
        .iter()
        .enumerate()
        .map(|(idx, s)| (s.data_url.clone(), idx))
        .collect();

    for community in communities {
        if has_source.contains(&community.key) {
            continue;
        }
        let Some(info) = cache.get(&community.key) else {
            continue;
        };
        for data_path in &info.data_paths {
            // Relative paths come from stale cache entries.
            if !data_path.starts_with("http://") && !data_path.starts_with("https://") {
                continue;
            }
            if !urlsafe::check_url(data_path, allow_private).await {
                warn!(community = %community.key, url = %data_path, "rejected unsafe dataPath");
                continue;
            }
            if let Some(&idx) = index_by_url.get(data_path) {
                for alias in &community.all_keys {
                    append_unique(&mut sources[idx].community_keys, alias);
                }
                has_source.insert(community.key.clone());
                info!(
                    community = %community.key,
                    source = %sources[idx].community_key,
                    url = %data_path,
                    "tagged alias keys onto existing source"
                );
                continue;
            }
            sources.push(CommunitySource {
                community_key: community.key.clone(),
                community_keys: community.all_keys.clone(),
                data_url: data_path.clone(),
                format: SourceFormat::Richformat,
                grafana_url: info.base_url.clone(),
                map_urls: community.snapshot_urls.clone(),
            });
            index_by_url.insert(data_path.clone(), sources.len() - 1);
            has_source.insert(community.key.clone());
            info!(community = %community.key, url = %data_path, "added dataPath source");
        }
    }
}

fn raw_from_node(node: &crate::snapshot::Node) -> RawNode {
    let mut raw = RawNode {
        node_id: node.node_id.clone(),
        hostname: node.hostname.clone(),
        is_online: node.is_online,
        is_gateway: node.is_gateway,
        clients: node.clients,
        clients_wifi24: node.clients_wifi24,
        clients_wifi5: node.clients_wifi5,
        clients_other: node.clients_other,
        domain: node.domain.clone(),
        mac: node.mac.clone(),
        owner: node.owner.clone(),
        uptime: node.uptime.clone(),
        load_avg: node.load_avg,
        memory_usage: node.mem_usage,
        rootfs_usage: node.rootfs_usage,
        gateway: node.gateway.clone(),
        lastseen: node.lastseen.clone(),
        firstseen: node.firstseen.clone(),
        nproc: node.nproc,
        addresses: node.addresses.clone(),
        model: node.model.clone(),
        ..Default::default()
    };
    raw.firmware.release = node.firmware.clone();
    raw.firmware.base = node.fw_base.clone();
    raw.firmware.image_name = node.image_name.clone();
    raw.autoupdater.enabled = node.autoupdater;
    raw.autoupdater.branch = node.branch.clone();
    if let (Some(lat), Some(lng)) = (node.lat, node.lng) {
        raw.location = Some(RawLocation {
            latitude: lat,
            longitude: lng,
        });
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::parse_richformat;

    fn source(key: &str, keys: &[&str]) -> CommunitySource {
        CommunitySource {
            community_key: key.to_string(),
            community_keys: keys.iter().map(|k| k.to_string()).collect(),
            data_url: format!("https://{key}.example.org/meshviewer.json"),
            format: SourceFormat::Richformat,
            ..Default::default()
        }
    }

    fn gateway_raw(community: &str) -> RawSnapshot {
        let client = format!("c-{community}");
        parse_richformat(
            format!(
                r#"{{
                    "nodes": [
                        {{"node_id": "11:22:33:44:55:66", "hostname": "gw", "is_gateway": true, "is_online": true}},
                        {{"node_id": "{client}", "hostname": "{client}", "is_online": true,
                         "gateway": "11:22:33:44:55:66"}}
                    ],
                    "links": [
                        {{"source": "11:22:33:44:55:66", "target": "{client}", "type": "vpn"}}
                    ]
                }}"#
            )
            .as_bytes(),
        )
        .expect("fixture parses")
    }

    #[test]
    fn gateway_id_collisions_are_suffixed_per_community() {
        let results = vec![
            (source("x", &["x"]), gateway_raw("x")),
            (source("y", &["y"]), gateway_raw("y")),
        ];

        let (merged, node_comm_map) = merge_sources(results);
        let ids: Vec<&str> = merged.nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert!(ids.contains(&"11:22:33:44:55:66_x"));
        assert!(ids.contains(&"11:22:33:44:55:66_y"));
        assert_eq!(merged.nodes.len(), 4);

        // Links and gateway back-references follow the rename.
        for link in &merged.links {
            assert!(link.source.ends_with("_x") || link.source.ends_with("_y"));
        }
        let c_x = merged.nodes.iter().find(|n| n.node_id == "c-x").expect("c-x");
        assert_eq!(c_x.gateway, "11:22:33:44:55:66_x");

        // Community tagging produces two nodes per key.
        let mut snap = snapshot::build(&merged, &HashMap::new());
        apply_community_tags(&mut snap, &node_comm_map);
        assert_eq!(snap.stats.communities["x"], 2);
        assert_eq!(snap.stats.communities["y"], 2);
        assert_eq!(snap.nodes["c-x"].community, "x");
    }

    #[test]
    fn duplicate_nodes_keep_the_first_and_union_keys() {
        let raw = parse_richformat(
            br#"{"nodes": [{"node_id": "shared", "hostname": "first"}]}"#,
        )
        .expect("parse");
        let raw_dup = parse_richformat(
            br#"{"nodes": [{"node_id": "shared", "hostname": "second"}]}"#,
        )
        .expect("parse");

        let (merged, node_comm_map) =
            merge_sources(vec![(source("a", &["a"]), raw), (source("b", &["b"]), raw_dup)]);

        assert_eq!(merged.nodes.len(), 1);
        assert_eq!(merged.nodes[0].hostname, "first");
        assert_eq!(node_comm_map["shared"], vec!["a", "b"]);
    }

    #[test]
    fn duplicate_links_are_dropped_by_ordered_pair() {
        let raw_a = parse_richformat(
            br#"{"nodes": [{"node_id": "1"}, {"node_id": "2"}],
                 "links": [{"source": "1", "target": "2", "type": "wifi"}]}"#,
        )
        .expect("parse");
        let raw_b = parse_richformat(
            br#"{"nodes": [{"node_id": "3"}],
                 "links": [{"source": "1", "target": "2", "type": "wifi"},
                            {"source": "2", "target": "1", "type": "wifi"}]}"#,
        )
        .expect("parse");

        let (merged, _) =
            merge_sources(vec![(source("a", &["a"]), raw_a), (source("b", &["b"]), raw_b)]);
        // "1>2" is deduplicated; the reversed pair is a distinct ordered key.
        assert_eq!(merged.links.len(), 2);
    }

    #[test]
    fn empty_domains_default_to_the_community_key() {
        let raw = parse_richformat(
            br#"{"nodes": [{"node_id": "n", "domain": ""}, {"node_id": "m", "domain": "kept"}]}"#,
        )
        .expect("parse");
        let (merged, _) = merge_sources(vec![(source("comm", &["comm"]), raw)]);
        assert_eq!(merged.nodes[0].domain, "comm");
        assert_eq!(merged.nodes[1].domain, "kept");
    }

    #[test]
    fn grafana_info_prefers_entries_with_datasource_ids() {
        let cfg = Arc::new(AppConfig::default());
        let fed = Federation::new(
            cfg,
            reqwest::Client::new(),
            Arc::new(Store::new()),
        );
        {
            let mut state = fed.inner.write().expect("lock");
            state
                .node_communities
                .insert("aa:bb_mycomm".into(), vec!["other".into(), "mycomm".into()]);
            state.grafana.insert(
                "other".into(),
                GrafanaInfo {
                    base_url: "https://other.example.org".into(),
                    ..Default::default()
                },
            );
            state.grafana.insert(
                "mycomm".into(),
                GrafanaInfo {
                    base_url: "https://grafana.example.org".into(),
                    datasource_id: Some(12),
                    database: "yanic".into(),
                    ..Default::default()
                },
            );
        }

        let (info, original) = fed.grafana_info_for_node("aa:bb_mycomm");
        let info = info.expect("metadata");
        assert_eq!(info.datasource_id, Some(12));
        assert_eq!(original, "aa:bb");
    }

    #[tokio::test]
    async fn graft_adds_data_path_sources_for_sourceless_communities() {
        let mut sources = vec![source("resolved", &["resolved"])];
        let communities = vec![
            Community {
                key: "resolved".into(),
                all_keys: vec!["resolved".into()],
                ..Default::default()
            },
            Community {
                key: "pathy".into(),
                all_keys: vec!["pathy".into(), "pathy-alt".into()],
                ..Default::default()
            },
        ];
        let mut cache = GrafanaCache::new();
        cache.insert(
            "pathy".into(),
            GrafanaInfo {
                base_url: "https://grafana.pathy.example.org".into(),
                data_paths: vec![
                    "https://data.pathy.example.org/meshviewer.json".into(),
                    "relative/path/meshviewer.json".into(),
                ],
                ..Default::default()
            },
        );

        graft_data_path_sources(&mut sources, &communities, &cache, true).await;
        assert_eq!(sources.len(), 2);
        let grafted = &sources[1];
        assert_eq!(grafted.community_key, "pathy");
        assert_eq!(grafted.data_url, "https://data.pathy.example.org/meshviewer.json");
        assert_eq!(grafted.format, SourceFormat::Richformat);
        assert_eq!(grafted.community_keys, vec!["pathy", "pathy-alt"]);
    }

    #[tokio::test]
    async fn graft_rejects_unsafe_data_paths() {
        let mut sources = vec![source("resolved", &["resolved"])];
        let communities = vec![Community {
            key: "evil".into(),
            all_keys: vec!["evil".into()],
            ..Default::default()
        }];
        let mut cache = GrafanaCache::new();
        cache.insert(
            "evil".into(),
            GrafanaInfo {
                data_paths: vec![
                    "http://169.254.169.254/latest/meta-data/meshviewer.json".into(),
                    "http://10.0.0.5:6379/meshviewer.json".into(),
                ],
                ..Default::default()
            },
        );

        graft_data_path_sources(&mut sources, &communities, &cache, false).await;
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].community_key, "resolved");
    }

    #[tokio::test]
    async fn fetch_source_gates_unsafe_urls() {
        let client = reqwest::Client::new();
        let unsafe_source = CommunitySource {
            data_url: "http://169.254.169.254/meshviewer.json".into(),
            ..Default::default()
        };

        // Metadata endpoints stay blocked even with the development flag.
        let err = fetch_source(&client, &unsafe_source, true)
            .await
            .expect_err("gated");
        assert!(err.to_string().contains("unsafe data url"));
    }

    #[tokio::test]
    async fn graft_tags_alias_keys_onto_matching_existing_sources() {
        let mut sources = vec![source("resolved", &["resolved"])];
        let url = sources[0].data_url.clone();
        let communities = vec![Community {
            key: "twin".into(),
            all_keys: vec!["twin".into()],
            ..Default::default()
        }];
        let mut cache = GrafanaCache::new();
        cache.insert(
            "twin".into(),
            GrafanaInfo {
                data_paths: vec![url],
                ..Default::default()
            },
        );

        graft_data_path_sources(&mut sources, &communities, &cache, true).await;
        assert_eq!(sources.len(), 1);
        assert!(sources[0].community_keys.contains(&"twin".to_string()));
    }

    #[tokio::test]
    async fn state_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = Arc::new(AppConfig {
            state_dir: dir.path().to_string_lossy().into_owned(),
            federation: true,
            ..AppConfig::default()
        });
        let store = Arc::new(Store::new());
        let fed = Federation::new(cfg.clone(), reqwest::Client::new(), store.clone());

        // Seed state and a published snapshot, then persist.
        let raw = parse_richformat(
            br#"{
                "timestamp": "2024-05-01T12:00:00Z",
                "nodes": [
                    {"node_id": "aa", "hostname": "alpha", "is_online": true, "clients": 3,
                     "location": {"latitude": 48.0, "longitude": 11.0}},
                    {"node_id": "bb", "hostname": "beta", "is_online": false}
                ],
                "links": [{"source": "aa", "target": "bb", "source_tq": 1, "target_tq": 1, "type": "wifi"}]
            }"#,
        )
        .expect("parse");
        let node_comm_map =
            HashMap::from([("aa".to_string(), vec!["comm".to_string()]),
                           ("bb".to_string(), vec!["comm".to_string()])]);
        let mut snap = snapshot::build(&raw, &HashMap::new());
        apply_community_tags(&mut snap, &node_comm_map);
        store.publish(Arc::new(snap));
        {
            let mut state = fed.inner.write().expect("lock");
            state.communities = vec![Community {
                key: "comm".into(),
                name: "Community".into(),
                all_keys: vec!["comm".into()],
                ..Default::default()
            }];
            state.sources = vec![source("comm", &["comm"])];
            state.node_communities = node_comm_map;
        }
        fed.save_state().await;

        // A fresh federation instance restores and republishes the snapshot.
        let restored_store = Arc::new(Store::new());
        let restored = Federation::new(cfg, reqwest::Client::new(), restored_store.clone());
        assert!(restored.restore_state().await);

        let snap = restored_store.snapshot();
        assert_eq!(snap.stats.total_nodes, 2);
        assert_eq!(snap.stats.online_nodes, 1);
        assert_eq!(snap.stats.total_clients, 3);
        assert_eq!(snap.nodes["aa"].community, "comm");
        assert_eq!(snap.stats.communities["comm"], 2);
        assert_eq!(snap.links.len(), 1);
        assert_eq!(snap.links[0].source, "aa");
        // Node names resolve through the community display-name layer.
        assert_eq!(snap.nodes["aa"].lat, Some(48.0));
        assert_eq!(restored.communities().len(), 1);
        assert_eq!(restored.sources().len(), 1);
    }

    #[tokio::test]
    async fn restore_state_rejects_missing_or_corrupt_caches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = Arc::new(AppConfig {
            state_dir: dir.path().to_string_lossy().into_owned(),
            federation: true,
            ..AppConfig::default()
        });
        let fed = Federation::new(cfg.clone(), reqwest::Client::new(), Arc::new(Store::new()));
        assert!(!fed.restore_state().await);

        tokio::fs::write(dir.path().join(STATE_FILE), b"{broken")
            .await
            .expect("write");
        assert!(!fed.restore_state().await);
    }
}
