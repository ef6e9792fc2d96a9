//! Time-series metadata discovery.
//!
//! For each community with a reachable source we try to learn the base URL
//! of its time-series frontend and a usable influxdb datasource id, probing
//! `config.json` first and falling back to scanning the map frontend's
//! landing page for inline configuration. Results are cached on disk by
//! community key; entries without a datasource id are re-probed next run.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use futures_util::stream::{self, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::resolver::{collect_map_bases, derive_bases, PROBE_TIMEOUT};
use super::{Community, CommunitySource};
use crate::fetch;
use crate::urlsafe;

pub const CACHE_FILE: &str = "grafana_cache.json";

const CONFIG_BODY_CAP: usize = 256 * 1024;
const PAGE_BODY_CAP: usize = 512 * 1024;
const DATASOURCE_BODY_CAP: usize = 512 * 1024;

/// Discovered time-series metadata for one community.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GrafanaInfo {
    pub base_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dashboard_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasource_id: Option<i64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub database: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub data_paths: Vec<String>,
}

/// Community key to discovered metadata.
pub type GrafanaCache = HashMap<String, GrafanaInfo>;

static GRAFANA_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^"'\s,}]+(?:grafana|stats)[^"'\s,}]*"#).expect("pattern compiles")
});
static NODE_INFO_HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href:"(https?://[^"]+/d/[^"]+)""#).expect("pattern compiles"));

pub fn cache_path(state_dir: &str) -> PathBuf {
    Path::new(state_dir).join(CACHE_FILE)
}

/// Load the on-disk cache. Corrupt files are ignored; the legacy
/// `{key: "base-url"}` layout is migrated in place.
pub async fn load_cache(path: &Path) -> GrafanaCache {
    let Ok(data) = tokio::fs::read(path).await else {
        return GrafanaCache::new();
    };

    match serde_json::from_slice::<GrafanaCache>(&data) {
        Ok(cache) => {
            info!(entries = cache.len(), "loaded time-series metadata cache");
            cache
        }
        Err(_) => match serde_json::from_slice::<HashMap<String, String>>(&data) {
            Ok(legacy) => {
                let cache: GrafanaCache = legacy
                    .into_iter()
                    .map(|(key, base_url)| {
                        (
                            key,
                            GrafanaInfo {
                                base_url,
                                ..Default::default()
                            },
                        )
                    })
                    .collect();
                info!(entries = cache.len(), "migrated legacy metadata cache");
                save_cache(path, &cache).await;
                cache
            }
            Err(err) => {
                warn!(?err, "corrupt time-series metadata cache, starting fresh");
                GrafanaCache::new()
            }
        },
    }
}

/// Best-effort write; file errors never fail a refresh.
pub async fn save_cache(path: &Path, cache: &GrafanaCache) {
    let data = match serde_json::to_vec_pretty(cache) {
        Ok(data) => data,
        Err(err) => {
            warn!(?err, "failed to serialize metadata cache");
            return;
        }
    };
    if let Err(err) = tokio::fs::write(path, data).await {
        warn!(?err, path = %path.display(), "failed to write metadata cache");
    }
}

/// Run metadata discovery for every community that needs it and return the
/// updated cache (also persisted to `path`).
pub async fn discover(
    client: &reqwest::Client,
    sources: &[CommunitySource],
    communities: &[Community],
    path: &Path,
    concurrency: usize,
    allow_private: bool,
) -> GrafanaCache {
    let mut cache = load_cache(path).await;

    // Directory-provided service hints seed entries that were never probed.
    for community in communities {
        if !community.grafana_url.is_empty() && !cache.contains_key(&community.key) {
            cache.insert(
                community.key.clone(),
                GrafanaInfo {
                    base_url: community.grafana_url.clone(),
                    ..Default::default()
                },
            );
        }
    }

    let mut need_discovery: Vec<CommunitySource> = Vec::new();
    let mut keys_with_sources: HashSet<&str> = HashSet::new();
    for source in sources {
        keys_with_sources.insert(source.community_key.as_str());
        match cache.get(&source.community_key) {
            None => need_discovery.push(source.clone()),
            // A bare base URL without a dashboard is worth re-probing.
            Some(entry) if !entry.base_url.is_empty() && entry.dashboard_url.is_empty() => {
                need_discovery.push(source.clone())
            }
            Some(_) => {}
        }
    }
    for community in communities {
        if keys_with_sources.contains(community.key.as_str())
            || cache.contains_key(&community.key)
        {
            continue;
        }
        let map_urls = collect_map_bases(community);
        if !map_urls.is_empty() {
            need_discovery.push(CommunitySource {
                community_key: community.key.clone(),
                community_keys: community.all_keys.clone(),
                map_urls,
                ..Default::default()
            });
        }
    }

    if need_discovery.is_empty() {
        info!(cached = cache.len(), "time-series metadata already cached");
    } else {
        info!(
            probing = need_discovery.len(),
            "probing communities for time-series metadata"
        );
        let discovered: Vec<(String, GrafanaInfo)> = stream::iter(need_discovery)
            .map(|source| {
                let client = client.clone();
                async move {
                    let info = discover_for_source(&client, &source, allow_private).await;
                    (source.community_key, info)
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut found = 0usize;
        for (key, info) in discovered {
            if !info.base_url.is_empty() || !info.data_paths.is_empty() {
                cache.insert(key, info);
                found += 1;
            }
        }
        info!(found, cached = cache.len(), "time-series metadata discovery done");
    }

    // Second pass: learn datasource ids for entries that still lack one.
    let need_datasource: Vec<(String, GrafanaInfo)> = cache
        .iter()
        .filter(|(_, info)| !info.base_url.is_empty() && info.datasource_id.is_none())
        .map(|(key, info)| (key.clone(), info.clone()))
        .collect();

    if !need_datasource.is_empty() {
        info!(
            probing = need_datasource.len(),
            "probing datasource lists for time-series metadata"
        );
        let resolved: Vec<(String, GrafanaInfo)> = stream::iter(need_datasource)
            .map(|(key, info)| {
                let client = client.clone();
                async move {
                    let updated = discover_datasource(&client, info, allow_private).await;
                    (key, updated)
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        for (key, info) in resolved {
            if info.datasource_id.is_some() {
                cache.insert(key, info);
            }
        }
    }

    save_cache(path, &cache).await;
    cache
}

async fn discover_for_source(
    client: &reqwest::Client,
    source: &CommunitySource,
    allow_private: bool,
) -> GrafanaInfo {
    let mut bases: Vec<String> = Vec::new();
    if !source.data_url.is_empty() {
        bases.extend(derive_bases(&source.data_url));
    }
    for base in &source.map_urls {
        if !bases.contains(base) {
            bases.push(base.clone());
        }
    }

    for base in &bases {
        let config_url = format!("{base}/config.json");
        let Some(body) = fetch_capped(client, &config_url, CONFIG_BODY_CAP, allow_private).await
        else {
            continue;
        };

        let info = extract_from_config(&body);
        if !info.base_url.is_empty() {
            return info;
        }

        // Raw-text fallback: some frontends inline the URL elsewhere.
        let text = String::from_utf8_lossy(&body);
        for found in GRAFANA_URL.find_iter(&text).take(3) {
            let url = found.as_str().trim_end_matches(['"', '\'', '>', ',', ';', ')']);
            if url.contains("grafana") || url.contains("stats.") {
                return GrafanaInfo {
                    base_url: url.to_string(),
                    data_paths: info.data_paths,
                    ..Default::default()
                };
            }
        }
    }

    for base in &bases {
        let Some(body) = fetch_capped(client, &format!("{base}/"), PAGE_BODY_CAP, allow_private).await
        else {
            continue;
        };
        let info = extract_from_inline(&String::from_utf8_lossy(&body));
        if !info.base_url.is_empty() || !info.data_paths.is_empty() {
            return info;
        }
    }

    GrafanaInfo::default()
}

async fn fetch_capped(
    client: &reqwest::Client,
    url: &str,
    cap: usize,
    allow_private: bool,
) -> Option<Vec<u8>> {
    if !urlsafe::check_url(url, allow_private).await {
        return None;
    }
    let resp = client
        .get(url)
        .timeout(PROBE_TIMEOUT)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .ok()?;
    if resp.status().as_u16() != 200 {
        return None;
    }
    fetch::read_capped(resp, cap).await.ok()
}

/// Pull metadata out of a meshviewer-style `config.json` document.
pub(crate) fn extract_from_config(body: &[u8]) -> GrafanaInfo {
    let Ok(cfg) = serde_json::from_slice::<Value>(body) else {
        return GrafanaInfo::default();
    };

    let mut info = GrafanaInfo::default();

    if let Some(paths) = cfg.get("dataPath").and_then(Value::as_array) {
        for path in paths {
            if let Some(s) = path.as_str() {
                if s.starts_with("http") {
                    info.data_paths
                        .push(format!("{}/meshviewer.json", s.trim_end_matches('/')));
                }
            }
        }
    }

    if let Some(entries) = cfg.get("nodeInfos").and_then(Value::as_array) {
        for entry in entries {
            let Some(href) = entry.get("href").and_then(Value::as_str) else {
                continue;
            };
            if href.contains("/d/") || href.contains("grafana") {
                if info.dashboard_url.is_empty() {
                    info.dashboard_url = href.to_string();
                }
                if let Some(idx) = href.find("/d/") {
                    if idx > 0 {
                        info.base_url = href[..idx].to_string();
                    }
                }
            }
        }
    }
    if !info.base_url.is_empty() {
        return info;
    }

    for key in ["grafana", "grafanaApi", "statisticsApi", "siteStatistics"] {
        match cfg.get(key) {
            Some(Value::String(s)) if s.starts_with("http") => {
                info.base_url = s.trim_end_matches('/').to_string();
                return info;
            }
            Some(Value::Object(map)) => {
                if let Some(url) = map.get("url").and_then(Value::as_str) {
                    if url.starts_with("http") {
                        info.base_url = url.trim_end_matches('/').to_string();
                        return info;
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(base) = deep_scan(&cfg) {
        info.base_url = base;
    }
    info
}

/// Recursive sweep for grafana-looking URLs anywhere in the document.
fn deep_scan(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if s.starts_with("http") && s.contains("grafana") => {
            if let Some(idx) = s.find("/d/") {
                if idx > 0 {
                    return Some(s[..idx].to_string());
                }
            }
            if let Some(idx) = s.find("/dashboard") {
                if idx > 0 {
                    return Some(s[..idx].to_string());
                }
            }
            Some(s.trim_end_matches('/').to_string())
        }
        Value::Object(map) => map.values().find_map(deep_scan),
        Value::Array(values) => values.iter().find_map(deep_scan),
        _ => None,
    }
}

/// Scan a frontend landing page for inline `dataPath:[…]` / `nodeInfos:[…]`
/// configuration.
pub(crate) fn extract_from_inline(text: &str) -> GrafanaInfo {
    let mut info = GrafanaInfo::default();

    if let Some(idx) = text.find("dataPath:") {
        let sub = &text[idx..];
        if let (Some(start), Some(end)) = (sub.find('['), sub.find(']')) {
            if end > start {
                if let Ok(paths) = serde_json::from_str::<Vec<String>>(&sub[start..=end]) {
                    for path in paths {
                        info.data_paths
                            .push(format!("{}/meshviewer.json", path.trim_end_matches('/')));
                    }
                }
            }
        }
    }

    if let Some(idx) = text.find("nodeInfos:") {
        if let Some(captures) = NODE_INFO_HREF.captures(&text[idx..]) {
            let href = &captures[1];
            info.dashboard_url = href.to_string();
            if let Some(didx) = href.find("/d/") {
                if didx > 0 {
                    info.base_url = href[..didx].to_string();
                }
            }
        }
    }

    if info.base_url.is_empty() {
        for found in GRAFANA_URL.find_iter(text).take(5) {
            let url = found.as_str().trim_end_matches(['"', '\'', '>', ',', ';', ')']);
            if !url.contains("grafana") {
                continue;
            }
            if let Some(idx) = url.find("/d/") {
                info.base_url = url[..idx].to_string();
            } else if let Some(idx) = url.find("/render") {
                info.base_url = url[..idx].to_string();
            } else {
                info.base_url = url.to_string();
            }
            break;
        }
    }

    info
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Datasource {
    id: i64,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    database: String,
    #[serde(rename = "isDefault")]
    is_default: bool,
    #[serde(rename = "jsonData")]
    json_data: DatasourceJsonData,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DatasourceJsonData {
    #[serde(rename = "dbName")]
    db_name: String,
}

impl Datasource {
    fn database(&self) -> String {
        if self.database.is_empty() {
            self.json_data.db_name.clone()
        } else {
            self.database.clone()
        }
    }
}

/// Query `{base}/api/datasources` and pick the best influxdb datasource:
/// prefer one whose name or database mentions "yanic", else the default,
/// else the first.
pub(crate) async fn discover_datasource(
    client: &reqwest::Client,
    mut info: GrafanaInfo,
    allow_private: bool,
) -> GrafanaInfo {
    let url = format!("{}/api/datasources", info.base_url.trim_end_matches('/'));
    let Some(body) = fetch_capped(client, &url, DATASOURCE_BODY_CAP, allow_private).await else {
        return info;
    };
    let Ok(datasources) = serde_json::from_slice::<Vec<Datasource>>(&body) else {
        return info;
    };

    let influx: Vec<&Datasource> = datasources
        .iter()
        .filter(|ds| ds.kind == "influxdb")
        .collect();

    let pick = influx
        .iter()
        .find(|ds| {
            ds.name.to_lowercase().contains("yanic")
                || ds.database().to_lowercase().contains("yanic")
        })
        .or_else(|| influx.iter().find(|ds| ds.is_default))
        .or_else(|| influx.first());

    if let Some(ds) = pick {
        info.datasource_id = Some(ds.id);
        info.database = ds.database();
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::build_client;
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use tempfile::tempdir;

    #[test]
    fn config_json_node_infos_yield_base_and_dashboard() {
        let body = br#"{
            "dataPath": ["https://data.example.org/data/"],
            "nodeInfos": [
                {"name": "stats", "href": "https://grafana.example.org/d/abc/node?var-node={NODE_ID}"}
            ]
        }"#;

        let info = extract_from_config(body);
        assert_eq!(info.base_url, "https://grafana.example.org");
        assert!(info.dashboard_url.starts_with("https://grafana.example.org/d/abc"));
        assert_eq!(
            info.data_paths,
            vec!["https://data.example.org/data/meshviewer.json"]
        );
    }

    #[test]
    fn config_json_string_keys_are_recognized() {
        let info = extract_from_config(br#"{"grafana": "https://stats.example.org/"}"#);
        assert_eq!(info.base_url, "https://stats.example.org");

        let info = extract_from_config(br#"{"statisticsApi": {"url": "https://g.example.org"}}"#);
        assert_eq!(info.base_url, "https://g.example.org");
    }

    #[test]
    fn deep_scan_finds_nested_grafana_urls() {
        let body = br#"{"theme": {"footer": {"statsLink": "https://grafana.example.org/d/xyz/overview"}}}"#;
        let info = extract_from_config(body);
        assert_eq!(info.base_url, "https://grafana.example.org");
    }

    #[test]
    fn inline_config_yields_data_paths_and_dashboard() {
        let page = r#"
            <script>
            window.config = {dataPath:["https://map.example.org/data/"],
            nodeInfos:[{href:"https://grafana.example.org/d/abc/node",name:"s"}]};
            </script>
        "#;

        let info = extract_from_inline(page);
        assert_eq!(
            info.data_paths,
            vec!["https://map.example.org/data/meshviewer.json"]
        );
        assert_eq!(info.base_url, "https://grafana.example.org");
        assert_eq!(info.dashboard_url, "https://grafana.example.org/d/abc/node");
    }

    #[test]
    fn malformed_config_yields_nothing() {
        assert_eq!(extract_from_config(b"<html></html>"), GrafanaInfo::default());
        assert_eq!(extract_from_inline("plain page"), GrafanaInfo::default());
    }

    #[tokio::test]
    async fn datasource_selection_prefers_yanic_then_default_then_first() {
        let server = MockServer::start();
        let _mock = server.mock(|when, then| {
            when.method(GET).path("/api/datasources");
            then.status(200).json_body(serde_json::json!([
                {"id": 1, "name": "graphite", "type": "graphite", "database": ""},
                {"id": 2, "name": "influx-main", "type": "influxdb", "database": "metrics", "isDefault": true},
                {"id": 12, "name": "influx-yanic", "type": "influxdb", "jsonData": {"dbName": "yanic"}}
            ]));
        });

        let client = build_client().expect("client builds");
        let info = discover_datasource(
            &client,
            GrafanaInfo {
                base_url: server.url(""),
                ..Default::default()
            },
            true,
        )
        .await;

        assert_eq!(info.datasource_id, Some(12));
        assert_eq!(info.database, "yanic");
    }

    #[tokio::test]
    async fn datasource_selection_falls_back_to_default() {
        let server = MockServer::start();
        let _mock = server.mock(|when, then| {
            when.method(GET).path("/api/datasources");
            then.status(200).json_body(serde_json::json!([
                {"id": 3, "name": "a", "type": "influxdb", "database": "other"},
                {"id": 4, "name": "b", "type": "influxdb", "database": "main", "isDefault": true}
            ]));
        });

        let client = build_client().expect("client builds");
        let info = discover_datasource(
            &client,
            GrafanaInfo {
                base_url: server.url(""),
                ..Default::default()
            },
            true,
        )
        .await;

        assert_eq!(info.datasource_id, Some(4));
        assert_eq!(info.database, "main");
    }

    #[tokio::test]
    async fn cache_round_trips_and_migrates_legacy_entries() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(CACHE_FILE);

        let mut cache = GrafanaCache::new();
        cache.insert(
            "alpha".into(),
            GrafanaInfo {
                base_url: "https://grafana.example.org".into(),
                datasource_id: Some(7),
                database: "yanic".into(),
                ..Default::default()
            },
        );
        save_cache(&path, &cache).await;
        let restored = load_cache(&path).await;
        assert_eq!(restored, cache);

        // Legacy layout migrates to the structured form.
        tokio::fs::write(&path, br#"{"beta": "https://stats.example.org"}"#)
            .await
            .expect("write legacy");
        let migrated = load_cache(&path).await;
        assert_eq!(
            migrated["beta"].base_url,
            "https://stats.example.org"
        );
        assert!(migrated["beta"].datasource_id.is_none());

        // Corrupt files start fresh.
        tokio::fs::write(&path, b"{nope").await.expect("write corrupt");
        assert!(load_cache(&path).await.is_empty());
    }

    #[tokio::test]
    async fn discovery_probes_config_json_and_caches_the_result() {
        let server = MockServer::start();
        let dashboard = format!("{}/d/abc/node", server.url(""));
        let _config = server.mock(|when, then| {
            when.method(GET).path("/map/config.json");
            then.status(200).json_body(serde_json::json!({
                "nodeInfos": [{"href": dashboard}]
            }));
        });
        let _datasources = server.mock(|when, then| {
            when.method(GET).path("/api/datasources");
            then.status(200).json_body(serde_json::json!([
                {"id": 9, "name": "influx-yanic", "type": "influxdb", "database": "yanic"}
            ]));
        });

        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(CACHE_FILE);
        let client = build_client().expect("client builds");

        let sources = vec![CommunitySource {
            community_key: "alpha".into(),
            community_keys: vec!["alpha".into()],
            data_url: server.url("/map/meshviewer.json"),
            ..Default::default()
        }];

        let cache = discover(&client, &sources, &[], &path, 4, true).await;
        assert_eq!(cache["alpha"].base_url, server.url(""));
        assert_eq!(cache["alpha"].datasource_id, Some(9));
        assert_eq!(cache["alpha"].database, "yanic");

        // The persisted file carries the same entry.
        let reloaded = load_cache(&path).await;
        assert_eq!(reloaded["alpha"].base_url, server.url(""));
    }
}
