//! Adapter for the minimal nodelist format: node records only, no links.

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;

use super::{RawLocation, RawNode, RawSnapshot};
use crate::coerce;

pub fn parse(data: &[u8]) -> anyhow::Result<RawSnapshot> {
    #[derive(Deserialize, Default)]
    #[serde(default)]
    struct Doc {
        updated_at: String,
        nodes: Vec<Value>,
    }

    let doc: Doc = serde_json::from_slice(data).context("parsing nodelist JSON")?;
    let mut raw = RawSnapshot {
        timestamp: doc.updated_at,
        ..Default::default()
    };

    for entry in doc.nodes {
        let node_id = coerce::as_string(entry.get("id").unwrap_or(&Value::Null));
        if node_id.is_empty() {
            continue;
        }

        let status = entry.get("status");
        let field = |key: &str| -> Value {
            status
                .and_then(|s| s.get(key))
                .cloned()
                .unwrap_or(Value::Null)
        };

        let mut node = RawNode {
            hostname: coerce::as_string(entry.get("name").unwrap_or(&Value::Null)),
            is_online: coerce::as_bool(&field("online")),
            clients: coerce::as_i64(&field("clients")),
            lastseen: coerce::as_string(&field("lastcontact")),
            // The format carries no MAC; the id stands in as a placeholder.
            mac: node_id.clone(),
            node_id,
            ..Default::default()
        };

        if let Some(pos) = entry.get("position") {
            let lat = coerce::as_f64(pos.get("lat").unwrap_or(&Value::Null));
            let mut lng = coerce::as_f64(pos.get("long").unwrap_or(&Value::Null));
            if lng == 0.0 {
                lng = coerce::as_f64(pos.get("lon").unwrap_or(&Value::Null));
            }
            if lat != 0.0 || lng != 0.0 {
                node.location = Some(RawLocation {
                    latitude: lat,
                    longitude: lng,
                });
            }
        }

        raw.nodes.push(node);
    }

    Ok(raw)
}
