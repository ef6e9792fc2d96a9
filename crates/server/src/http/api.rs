//! Read-only JSON endpoints over the published snapshot.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Serialize;

use super::cached_json;
use crate::app_state::AppState;
use crate::config::{ExternalLink, TileLayer};
use crate::error::{ApiResult, AppError};
use crate::snapshot::Node;

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/api/nodes", get(nodes))
        .route("/api/nodes/{node_id}", get(node_detail))
        .route("/api/links", get(links))
        .route("/api/stats", get(stats))
        .route("/api/config", get(client_config))
}

pub fn federation_router() -> Router<AppState> {
    Router::<AppState>::new().route("/api/communities", get(communities))
}

async fn nodes(State(state): State<AppState>) -> Response {
    let snap = state.store.snapshot();
    cached_json(&snap.node_list(), "public, max-age=30")
}

async fn links(State(state): State<AppState>) -> Response {
    let snap = state.store.snapshot();
    cached_json(&snap.links, "public, max-age=30")
}

async fn stats(State(state): State<AppState>) -> Response {
    let snap = state.store.snapshot();
    cached_json(&snap.stats, "public, max-age=30")
}

#[derive(Serialize)]
struct NeighbourInfo {
    node_id: String,
    hostname: String,
    is_online: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    link_type: String,
    #[serde(skip_serializing_if = "is_zero")]
    tq: f64,
    #[serde(skip_serializing_if = "is_zero")]
    distance: f64,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

#[derive(Serialize)]
struct NodeDetail {
    #[serde(flatten)]
    node: Node,
    neighbour_details: Vec<NeighbourInfo>,
}

async fn node_detail(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<Response> {
    let snap = state.store.snapshot();
    let Some(node) = snap.nodes.get(&node_id) else {
        return Err(AppError::not_found("node not found"));
    };

    let mut neighbour_details = Vec::with_capacity(node.neighbours.len());
    for neighbour_id in &node.neighbours {
        let mut info = NeighbourInfo {
            node_id: neighbour_id.clone(),
            hostname: String::new(),
            is_online: false,
            link_type: String::new(),
            tq: 0.0,
            distance: 0.0,
        };
        if let Some(neighbour) = snap.nodes.get(neighbour_id) {
            info.hostname = neighbour.hostname.clone();
            info.is_online = neighbour.is_online;
        }
        if let Some(link) = snap.links.iter().find(|l| {
            (l.source == node_id && l.target == *neighbour_id)
                || (l.target == node_id && l.source == *neighbour_id)
        }) {
            info.link_type = link.link_type.clone();
            info.tq = (link.source_tq + link.target_tq) / 2.0;
            info.distance = link.distance;
        }
        neighbour_details.push(info);
    }

    let detail = NodeDetail {
        node: node.clone(),
        neighbour_details,
    };
    Ok(cached_json(&detail, "public, max-age=30"))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientConfig<'a> {
    site_name: &'a str,
    map_center: [f64; 2],
    map_zoom: i64,
    tile_layers: &'a [TileLayer],
    domain_names: &'a HashMap<String, String>,
    links: &'a [ExternalLink],
    device_picture_url: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    eol_info_url: &'a str,
    grafana_url: &'a str,
    grafana_dashboard: &'a str,
    has_grafana: bool,
    federation: bool,
}

async fn client_config(State(state): State<AppState>) -> Response {
    let cfg = &state.cfg;
    let client_config = ClientConfig {
        site_name: &cfg.site_name,
        map_center: cfg.map_center,
        map_zoom: cfg.map_zoom,
        tile_layers: &cfg.tile_layers,
        domain_names: &cfg.domain_names,
        links: &cfg.links,
        device_picture_url: &cfg.device_picture_url,
        eol_info_url: &cfg.eol_info_url,
        grafana_url: &cfg.grafana_url,
        grafana_dashboard: &cfg.grafana_dashboard,
        has_grafana: !cfg.grafana_url.is_empty(),
        federation: cfg.federation,
    };
    cached_json(&client_config, "no-cache")
}

#[derive(Serialize)]
struct CommunityInfo {
    key: String,
    name: String,
    url: String,
    #[serde(skip_serializing_if = "is_zero")]
    lat: f64,
    #[serde(skip_serializing_if = "is_zero")]
    lng: f64,
    nodes: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    data_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    grafana_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    dashboard_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    metacommunity: String,
    active: bool,
}

async fn communities(State(state): State<AppState>) -> ApiResult<Response> {
    let Some(federation) = &state.federation else {
        return Err(AppError::not_found("federation disabled"));
    };

    let communities = federation.communities();
    let sources = federation.sources();
    let grafana_cache = federation.grafana_cache();

    let format_by_key: HashMap<&str, &str> = sources
        .iter()
        .map(|s| (s.community_key.as_str(), s.format.as_str()))
        .collect();

    let mut result = Vec::with_capacity(communities.len());
    for community in &communities {
        let data_type = format_by_key.get(community.key.as_str()).copied();
        let mut info = CommunityInfo {
            key: community.key.clone(),
            name: community.name.clone(),
            url: community.url.clone(),
            lat: community.lat,
            lng: community.lng,
            nodes: community.nodes,
            data_type: data_type.unwrap_or_default().to_string(),
            grafana_url: community.grafana_url.clone(),
            dashboard_url: String::new(),
            metacommunity: community.metacommunity.clone(),
            active: data_type.is_some(),
        };
        if let Some(cached) = grafana_cache.get(&community.key) {
            if info.grafana_url.is_empty() {
                info.grafana_url = cached.base_url.clone();
            }
            info.dashboard_url = cached.dashboard_url.clone();
        }
        result.push(info);
    }

    Ok(cached_json(&result, "public, max-age=300"))
}
