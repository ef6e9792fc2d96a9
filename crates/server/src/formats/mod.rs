//! Wire-format adapters.
//!
//! Three upstream formats are understood; all are coerced into the same
//! [`RawSnapshot`] before the snapshot builder runs. Adapters are tolerant at
//! record granularity: a malformed node or link is skipped, never failing the
//! whole document, and records without a node id are dropped.

mod nodelist;
mod nodes;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coerce;

/// The format a resolved source serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// Flat node records plus an inline link list.
    #[default]
    Richformat,
    /// Minimal node records, no links.
    Nodelist,
    /// Nested `nodeinfo`/`statistics`/`flags` records.
    Nodes,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Richformat => "richformat",
            SourceFormat::Nodelist => "nodelist",
            SourceFormat::Nodes => "nodes",
        }
    }
}

/// Canonical raw input for the snapshot builder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSnapshot {
    pub timestamp: String,
    pub nodes: Vec<RawNode>,
    pub links: Vec<RawLink>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawNode {
    #[serde(deserialize_with = "coerce::flex_string")]
    pub node_id: String,
    pub hostname: String,
    #[serde(deserialize_with = "coerce::flex_bool")]
    pub is_online: bool,
    #[serde(deserialize_with = "coerce::flex_bool")]
    pub is_gateway: bool,
    #[serde(deserialize_with = "coerce::flex_int")]
    pub clients: i64,
    #[serde(deserialize_with = "coerce::flex_int")]
    pub clients_wifi24: i64,
    #[serde(deserialize_with = "coerce::flex_int")]
    pub clients_wifi5: i64,
    #[serde(deserialize_with = "coerce::flex_int")]
    pub clients_other: i64,
    #[serde(deserialize_with = "coerce::flex_float")]
    pub rootfs_usage: f64,
    #[serde(rename = "loadavg", deserialize_with = "coerce::flex_float")]
    pub load_avg: f64,
    #[serde(deserialize_with = "coerce::flex_float")]
    pub memory_usage: f64,
    #[serde(deserialize_with = "coerce::flex_string")]
    pub uptime: String,
    pub gateway_nexthop: String,
    pub gateway: String,
    pub gateway6: String,
    pub mac: String,
    pub addresses: Vec<String>,
    pub domain: String,
    pub owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<RawLocation>,
    pub firmware: RawFirmware,
    pub autoupdater: RawAutoupdater,
    #[serde(deserialize_with = "coerce::flex_int")]
    pub nproc: i64,
    pub model: String,
    #[serde(deserialize_with = "coerce::flex_string")]
    pub firstseen: String,
    #[serde(deserialize_with = "coerce::flex_string")]
    pub lastseen: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawLocation {
    #[serde(deserialize_with = "coerce::flex_float")]
    pub latitude: f64,
    #[serde(deserialize_with = "coerce::flex_float")]
    pub longitude: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawFirmware {
    pub base: String,
    pub release: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawAutoupdater {
    #[serde(deserialize_with = "coerce::flex_bool")]
    pub enabled: bool,
    pub branch: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawLink {
    #[serde(deserialize_with = "coerce::flex_string")]
    pub source: String,
    #[serde(deserialize_with = "coerce::flex_string")]
    pub target: String,
    #[serde(deserialize_with = "coerce::flex_float")]
    pub source_tq: f64,
    #[serde(deserialize_with = "coerce::flex_float")]
    pub target_tq: f64,
    #[serde(rename = "type")]
    pub link_type: String,
}

/// Parse `data` according to the source's format tag.
pub fn parse(format: SourceFormat, data: &[u8]) -> anyhow::Result<RawSnapshot> {
    match format {
        SourceFormat::Richformat => parse_richformat(data),
        SourceFormat::Nodelist => nodelist::parse(data),
        SourceFormat::Nodes => nodes::parse(data),
    }
}

/// Parse the richformat document: flat node records plus an inline link list.
pub fn parse_richformat(data: &[u8]) -> anyhow::Result<RawSnapshot> {
    #[derive(Deserialize, Default)]
    #[serde(default)]
    struct Doc {
        timestamp: String,
        nodes: Vec<Value>,
        links: Vec<Value>,
    }

    let doc: Doc = serde_json::from_slice(data).context("parsing richformat JSON")?;
    let mut raw = RawSnapshot {
        timestamp: doc.timestamp,
        ..Default::default()
    };

    for value in doc.nodes {
        match serde_json::from_value::<RawNode>(value) {
            Ok(node) if !node.node_id.is_empty() => raw.nodes.push(node),
            _ => continue,
        }
    }

    for value in doc.links {
        match serde_json::from_value::<RawLink>(value) {
            Ok(link) if !link.source.is_empty() && !link.target.is_empty() => {
                raw.links.push(link)
            }
            _ => continue,
        }
    }

    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn richformat_parses_nodes_and_links() {
        let data = br#"{
            "timestamp": "2024-05-01T12:00:00Z",
            "nodes": [
                {"node_id": "aa", "hostname": "alpha", "is_online": true,
                 "clients": 3, "location": {"latitude": 48.0, "longitude": 11.0},
                 "firmware": {"base": "base-2023", "release": "1.2"},
                 "autoupdater": {"enabled": "1", "branch": "stable"}},
                {"node_id": "bb", "hostname": "beta", "is_online": "0"}
            ],
            "links": [
                {"source": "aa", "target": "bb", "source_tq": 0.9, "target_tq": 0.8, "type": "wifi"}
            ]
        }"#;

        let raw = parse_richformat(data).expect("parse");
        assert_eq!(raw.timestamp, "2024-05-01T12:00:00Z");
        assert_eq!(raw.nodes.len(), 2);
        assert!(raw.nodes[0].is_online);
        assert!(raw.nodes[0].autoupdater.enabled);
        assert_eq!(raw.nodes[0].firmware.release, "1.2");
        assert!(!raw.nodes[1].is_online);
        assert_eq!(raw.links.len(), 1);
        assert_eq!(raw.links[0].link_type, "wifi");
    }

    #[test]
    fn richformat_skips_malformed_records_without_failing_the_file() {
        let data = br#"{
            "timestamp": "t",
            "nodes": [
                {"hostname": "no-id"},
                {"node_id": "ok"},
                {"node_id": "bad-addresses", "addresses": 42},
                "not even an object"
            ],
            "links": [
                {"source": "ok"},
                {"source": "a", "target": "b"}
            ]
        }"#;

        let raw = parse_richformat(data).expect("parse");
        assert_eq!(raw.nodes.len(), 1);
        assert_eq!(raw.nodes[0].node_id, "ok");
        assert_eq!(raw.links.len(), 1);
    }

    #[test]
    fn richformat_rejects_unparseable_documents() {
        assert!(parse_richformat(b"<html>not json</html>").is_err());
    }

    #[test]
    fn format_tags_round_trip_through_serde() {
        for format in [
            SourceFormat::Richformat,
            SourceFormat::Nodelist,
            SourceFormat::Nodes,
        ] {
            let tag = serde_json::to_string(&format).expect("serialize");
            assert_eq!(tag, format!("\"{}\"", format.as_str()));
            let back: SourceFormat = serde_json::from_str(&tag).expect("deserialize");
            assert_eq!(back, format);
        }
    }
}
