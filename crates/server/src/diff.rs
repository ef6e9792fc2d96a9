//! Delta between two consecutive snapshots.
//!
//! The diff is the only payload subscribers ever receive; its size is
//! proportional to what changed, never to the node count.

use serde::Serialize;

use crate::snapshot::{Snapshot, Stats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    /// First publication: carries only stats.
    Full,
    /// Per-node changes plus new/gone id lists.
    Diff,
    /// Nothing changed at node granularity, stats refreshed.
    Stats,
}

/// Compact per-node change record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeChange {
    pub node_id: String,
    pub hostname: String,
    pub is_online: bool,
    pub clients: i64,
    pub load_avg: f64,
    pub mem_usage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Update {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    pub stats: Stats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<NodeChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gone: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub new: Vec<String>,
}

/// Compute the update between two published snapshots.
///
/// Change detection uses exact inequality on `is_online`, `clients`,
/// `load_avg`, and `mem_usage`. Output lists are sorted by node id so the
/// stream is deterministic.
pub fn compute(old: &Snapshot, cur: &Snapshot) -> Update {
    if old.nodes.is_empty() {
        return Update {
            kind: UpdateKind::Full,
            stats: cur.stats.clone(),
            changed: Vec::new(),
            gone: Vec::new(),
            new: Vec::new(),
        };
    }

    let mut update = Update {
        kind: UpdateKind::Diff,
        stats: cur.stats.clone(),
        changed: Vec::new(),
        gone: Vec::new(),
        new: Vec::new(),
    };

    for (id, node) in &cur.nodes {
        let Some(previous) = old.nodes.get(id) else {
            update.new.push(id.clone());
            continue;
        };
        if previous.is_online != node.is_online
            || previous.clients != node.clients
            || previous.load_avg != node.load_avg
            || previous.mem_usage != node.mem_usage
        {
            update.changed.push(NodeChange {
                node_id: id.clone(),
                hostname: node.hostname.clone(),
                is_online: node.is_online,
                clients: node.clients,
                load_avg: node.load_avg,
                mem_usage: node.mem_usage,
            });
        }
    }

    for id in old.nodes.keys() {
        if !cur.nodes.contains_key(id) {
            update.gone.push(id.clone());
        }
    }

    update.new.sort();
    update.gone.sort();
    update.changed.sort_by(|a, b| a.node_id.cmp(&b.node_id));

    if update.changed.is_empty() && update.new.is_empty() && update.gone.is_empty() {
        update.kind = UpdateKind::Stats;
    }

    update
}
