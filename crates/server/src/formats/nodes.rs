//! Adapter for the nested nodes format (`nodeinfo`/`statistics`/`flags`).

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;

use super::{RawAutoupdater, RawFirmware, RawLocation, RawNode, RawSnapshot};
use crate::coerce;

#[derive(Deserialize, Default)]
#[serde(default)]
struct Record {
    firstseen: String,
    lastseen: String,
    flags: Flags,
    statistics: Statistics,
    nodeinfo: Nodeinfo,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Flags {
    online: bool,
    gateway: bool,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Statistics {
    node_id: String,
    clients: Value,
    rootfs_usage: Value,
    loadavg: Value,
    memory_usage: Value,
    uptime: Value,
    gateway: String,
    gateway6: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Nodeinfo {
    node_id: String,
    hostname: String,
    network: Network,
    owner: Option<Owner>,
    system: System,
    location: Option<Location>,
    software: Software,
    hardware: Hardware,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Network {
    mac: String,
    addresses: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Owner {
    contact: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct System {
    site_code: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Location {
    longitude: f64,
    latitude: f64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Software {
    autoupdater: Option<SoftwareAutoupdater>,
    firmware: Option<SoftwareFirmware>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SoftwareAutoupdater {
    branch: String,
    enabled: bool,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SoftwareFirmware {
    base: String,
    release: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Hardware {
    nproc: i64,
    model: String,
}

pub fn parse(data: &[u8]) -> anyhow::Result<RawSnapshot> {
    #[derive(Deserialize, Default)]
    #[serde(default)]
    struct Doc {
        timestamp: String,
        nodes: Vec<Value>,
    }

    let doc: Doc = serde_json::from_slice(data).context("parsing nodes JSON")?;
    let mut raw = RawSnapshot {
        timestamp: doc.timestamp,
        ..Default::default()
    };

    for value in doc.nodes {
        let Ok(record) = serde_json::from_value::<Record>(value) else {
            continue;
        };

        let mut node_id = record.nodeinfo.node_id.clone();
        if node_id.is_empty() {
            node_id = record.statistics.node_id.clone();
        }
        if node_id.is_empty() {
            continue;
        }

        let mut mac = record.nodeinfo.network.mac.clone();
        if mac.is_empty() {
            mac = node_id.clone();
        }

        let mut node = RawNode {
            node_id,
            hostname: record.nodeinfo.hostname,
            is_online: record.flags.online,
            is_gateway: record.flags.gateway,
            clients: coerce::as_i64(&record.statistics.clients),
            rootfs_usage: coerce::as_f64(&record.statistics.rootfs_usage),
            load_avg: coerce::as_f64(&record.statistics.loadavg),
            memory_usage: coerce::as_f64(&record.statistics.memory_usage),
            uptime: coerce::as_string(&record.statistics.uptime),
            gateway: record.statistics.gateway,
            gateway6: record.statistics.gateway6,
            firstseen: record.firstseen,
            lastseen: record.lastseen,
            mac,
            addresses: record.nodeinfo.network.addresses,
            domain: record.nodeinfo.system.site_code,
            model: record.nodeinfo.hardware.model,
            nproc: record.nodeinfo.hardware.nproc,
            ..Default::default()
        };

        if let Some(firmware) = record.nodeinfo.software.firmware {
            node.firmware = RawFirmware {
                base: firmware.base,
                release: firmware.release,
                image_name: String::new(),
            };
        }
        if let Some(autoupdater) = record.nodeinfo.software.autoupdater {
            node.autoupdater = RawAutoupdater {
                enabled: autoupdater.enabled,
                branch: autoupdater.branch,
            };
        }
        if let Some(owner) = record.nodeinfo.owner {
            node.owner = owner.contact;
        }
        if let Some(location) = record.nodeinfo.location {
            if location.latitude != 0.0 || location.longitude != 0.0 {
                node.location = Some(RawLocation {
                    latitude: location.latitude,
                    longitude: location.longitude,
                });
            }
        }

        raw.nodes.push(node);
    }

    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_records() {
        let data = br#"{
            "timestamp": "2024-05-01T12:00:00Z",
            "nodes": [
                {
                    "firstseen": "2020-01-01T00:00:00Z",
                    "lastseen": "2024-05-01T11:59:00Z",
                    "flags": {"online": true, "gateway": true},
                    "statistics": {
                        "node_id": "s1", "clients": 9, "loadavg": 0.25,
                        "memory_usage": 0.5, "rootfs_usage": 0.1,
                        "uptime": 86400, "gateway": "gw1"
                    },
                    "nodeinfo": {
                        "node_id": "n1", "hostname": "host-1",
                        "network": {"mac": "aa:bb", "addresses": ["fe80::1"]},
                        "owner": {"contact": "op@example.org"},
                        "system": {"site_code": "city"},
                        "location": {"latitude": 48.2, "longitude": 11.3},
                        "software": {
                            "firmware": {"base": "base-2023", "release": "2.1"},
                            "autoupdater": {"enabled": true, "branch": "stable"}
                        },
                        "hardware": {"nproc": 2, "model": "Router 4"}
                    }
                }
            ]
        }"#;

        let raw = parse(data).expect("parse");
        assert_eq!(raw.nodes.len(), 1);
        let node = &raw.nodes[0];
        assert_eq!(node.node_id, "n1");
        assert_eq!(node.hostname, "host-1");
        assert!(node.is_online);
        assert!(node.is_gateway);
        assert_eq!(node.clients, 9);
        assert_eq!(node.uptime, "86400");
        assert_eq!(node.domain, "city");
        assert_eq!(node.firmware.release, "2.1");
        assert!(node.autoupdater.enabled);
        assert_eq!(node.owner, "op@example.org");
        assert_eq!(node.mac, "aa:bb");
        assert_eq!(node.location.as_ref().expect("location").latitude, 48.2);
    }

    #[test]
    fn falls_back_to_statistics_node_id_and_placeholder_mac() {
        let data = br#"{
            "nodes": [
                {"statistics": {"node_id": "stat-only"}, "flags": {"online": false}},
                {"statistics": {}, "nodeinfo": {}}
            ]
        }"#;

        let raw = parse(data).expect("parse");
        assert_eq!(raw.nodes.len(), 1);
        assert_eq!(raw.nodes[0].node_id, "stat-only");
        assert_eq!(raw.nodes[0].mac, "stat-only");
    }

    #[test]
    fn zero_zero_locations_are_dropped() {
        let data = br#"{
            "nodes": [
                {"nodeinfo": {"node_id": "x", "location": {"latitude": 0, "longitude": 0}}}
            ]
        }"#;

        let raw = parse(data).expect("parse");
        assert!(raw.nodes[0].location.is_none());
    }
}
