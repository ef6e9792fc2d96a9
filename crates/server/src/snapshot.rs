//! Canonical node/link model and the snapshot builder.
//!
//! A [`Snapshot`] is an immutable point-in-time view: nodes keyed by id, an
//! ordered node list (online first, then case-insensitive hostname), the link
//! list with derived distances, and aggregate statistics. Snapshots are built
//! once from raw input and never mutated after publication; neighbour lists
//! are derived during the build.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::formats::{RawLocation, RawSnapshot};

/// One mesh device.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Node {
    pub node_id: String,
    pub hostname: String,
    pub is_online: bool,
    pub is_gateway: bool,
    pub clients: i64,
    pub clients_wifi24: i64,
    pub clients_wifi5: i64,
    pub clients_other: i64,
    pub domain: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub domain_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub community: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub communities: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub firmware: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fw_base: String,
    pub autoupdater: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub branch: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub owner: String,
    pub mac: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uptime: String,
    pub load_avg: f64,
    pub mem_usage: f64,
    pub rootfs_usage: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub gateway: String,
    pub firstseen: String,
    pub lastseen: String,
    pub nproc: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub neighbours: Vec<String>,
}

/// Undirected mesh edge. Endpoints are node ids, never pointers.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Link {
    pub source: String,
    pub target: String,
    pub source_tq: f64,
    pub target_tq: f64,
    #[serde(rename = "type")]
    pub link_type: String,
    /// Meters between geolocated endpoints; 0 when either end is unlocated.
    #[serde(skip_serializing_if = "is_zero")]
    pub distance: f64,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// Aggregate counts over one snapshot.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Stats {
    pub total_nodes: i64,
    pub online_nodes: i64,
    pub total_clients: i64,
    pub gateways: i64,
    pub domains: HashMap<String, i64>,
    pub models: HashMap<String, i64>,
    pub firmwares: HashMap<String, i64>,
    pub firmware_bases: HashMap<String, i64>,
    pub communities: HashMap<String, i64>,
    pub timestamp: String,
}

/// Immutable point-in-time view of the mesh.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub nodes: HashMap<String, Node>,
    /// Node ids sorted online-first, then hostname ascending case-insensitive.
    pub order: Vec<String>,
    pub links: Vec<Link>,
    pub stats: Stats,
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    pub fn node_list(&self) -> Vec<&Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id)).collect()
    }
}

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin() * (d_lat / 2.0).sin()
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin() * (d_lon / 2.0).sin();
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Append `value` unless already present. Idempotent.
pub fn append_unique(values: &mut Vec<String>, value: &str) {
    if !values.iter().any(|v| v == value) {
        values.push(value.to_string());
    }
}

fn valid_location(loc: &RawLocation) -> bool {
    loc.latitude.abs() < 90.0
        && loc.longitude.abs() < 180.0
        && !(loc.latitude == 0.0 && loc.longitude == 0.0)
}

/// Build a snapshot from raw input. Inputs are not mutated.
pub fn build(raw: &RawSnapshot, domain_names: &HashMap<String, String>) -> Snapshot {
    let mut nodes: HashMap<String, Node> = HashMap::with_capacity(raw.nodes.len());
    let mut stats = Stats {
        timestamp: raw.timestamp.clone(),
        ..Default::default()
    };

    for rn in &raw.nodes {
        if rn.node_id.is_empty() {
            continue;
        }

        let mut node = Node {
            node_id: rn.node_id.clone(),
            hostname: rn.hostname.clone(),
            is_online: rn.is_online,
            is_gateway: rn.is_gateway,
            clients: rn.clients,
            clients_wifi24: rn.clients_wifi24,
            clients_wifi5: rn.clients_wifi5,
            clients_other: rn.clients_other,
            domain: rn.domain.clone(),
            model: rn.model.clone(),
            firmware: rn.firmware.release.clone(),
            fw_base: rn.firmware.base.clone(),
            autoupdater: rn.autoupdater.enabled,
            branch: rn.autoupdater.branch.clone(),
            owner: rn.owner.clone(),
            mac: rn.mac.clone(),
            uptime: rn.uptime.clone(),
            load_avg: rn.load_avg,
            mem_usage: rn.memory_usage,
            rootfs_usage: rn.rootfs_usage,
            gateway: rn.gateway.clone(),
            firstseen: rn.firstseen.clone(),
            lastseen: rn.lastseen.clone(),
            nproc: rn.nproc,
            addresses: rn.addresses.clone(),
            image_name: rn.firmware.image_name.clone(),
            ..Default::default()
        };

        if let Some(name) = domain_names.get(&rn.domain) {
            node.domain_name = name.clone();
        }

        if let Some(loc) = &rn.location {
            if valid_location(loc) {
                node.lat = Some(loc.latitude);
                node.lng = Some(loc.longitude);
            }
        }

        stats.total_nodes += 1;
        if rn.is_online {
            stats.online_nodes += 1;
            stats.total_clients += rn.clients;
        }
        if rn.is_gateway {
            stats.gateways += 1;
        }
        if !rn.domain.is_empty() {
            let display = domain_names
                .get(&rn.domain)
                .cloned()
                .unwrap_or_else(|| rn.domain.clone());
            *stats.domains.entry(display).or_default() += 1;
        }
        if !rn.model.is_empty() {
            *stats.models.entry(rn.model.clone()).or_default() += 1;
        }
        if !rn.firmware.release.is_empty() {
            *stats.firmwares.entry(rn.firmware.release.clone()).or_default() += 1;
        }
        if !rn.firmware.base.is_empty() {
            *stats
                .firmware_bases
                .entry(rn.firmware.base.clone())
                .or_default() += 1;
        }

        nodes.insert(rn.node_id.clone(), node);
    }

    let mut links = Vec::with_capacity(raw.links.len());
    for rl in &raw.links {
        let mut link = Link {
            source: rl.source.clone(),
            target: rl.target.clone(),
            source_tq: rl.source_tq,
            target_tq: rl.target_tq,
            link_type: rl.link_type.clone(),
            distance: 0.0,
        };

        let source_pos = nodes.get(&rl.source).and_then(|n| n.lat.zip(n.lng));
        let target_pos = nodes.get(&rl.target).and_then(|n| n.lat.zip(n.lng));
        if let (Some((slat, slng)), Some((tlat, tlng))) = (source_pos, target_pos) {
            link.distance = haversine(slat, slng, tlat, tlng);
        }

        if let Some(node) = nodes.get_mut(&rl.source) {
            append_unique(&mut node.neighbours, &rl.target);
        }
        if let Some(node) = nodes.get_mut(&rl.target) {
            append_unique(&mut node.neighbours, &rl.source);
        }

        links.push(link);
    }

    let mut order: Vec<String> = nodes.keys().cloned().collect();
    order.sort_by_cached_key(|id| {
        let node = &nodes[id];
        (!node.is_online, node.hostname.to_lowercase(), id.clone())
    });

    let timestamp = DateTime::parse_from_rfc3339(&raw.timestamp)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH);

    Snapshot {
        nodes,
        order,
        links,
        stats,
        timestamp,
    }
}
