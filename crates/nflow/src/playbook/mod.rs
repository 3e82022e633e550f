//! Workflow Graph Model
//!
//! Typed view of the persisted drawflow document: an app stores one JSON
//! object with outer key `drawflow`, then flow key → sub key → node id → node.
//! Nodes published by the store are immutable; execution works on per-step
//! deep copies.

mod store;

pub use store::{LoadedApp, PlaybookStore};

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Node type that marks a workflow entry point
pub const STARTER_TYPE: &str = "starter";

/// Conventional primary output port.
///
/// Port names are a drawing convention, not a registry: `output_1` is the
/// synchronous continuation and `output_2` the fan-out branch where a node
/// supports one. Nothing validates other names.
pub const PORT_MAIN: &str = "output_1";

/// Conventional fan-out port (see [`PORT_MAIN`])
pub const PORT_FORK: &str = "output_2";

/// A workflow: node id → node.
///
/// `BTreeMap` keeps iteration deterministic, which the router's
/// first-match-wins rule depends on.
pub type Playbook = BTreeMap<String, Node>;

/// All workflows of one app: flow key → sub key → playbook
pub type PlaybookSet = BTreeMap<String, BTreeMap<String, Playbook>>;

/// Path variables bound by URL matching
pub type Vars = BTreeMap<String, String>;

/// One node of a workflow graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    /// Type-specific fields; always includes `type` and usually `name`
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Output>,
}

/// A named output port
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Output {
    #[serde(default)]
    pub connections: Vec<Connection>,
}

/// One edge of the graph: target node and target port
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Connection {
    #[serde(default, deserialize_with = "string_or_number")]
    pub node: String,
    #[serde(default)]
    pub output: String,
}

/// Persisted app document (outer `drawflow` key)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlowDocument {
    #[serde(default)]
    pub drawflow: PlaybookSet,
}

/// A playbook bound to its designated starter
#[derive(Debug, Clone)]
pub struct Controller {
    pub app: String,
    pub flow: String,
    pub playbook: Playbook,
    pub starter: Node,
}

impl Node {
    /// The node's `type` field, empty when absent
    pub fn node_type(&self) -> &str {
        self.data_str("type").unwrap_or("")
    }

    /// The node's display name, falling back to its id
    pub fn name(&self) -> &str {
        self.data_str("name").unwrap_or(&self.id)
    }

    /// A string-valued data field
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Whether this node is a starter
    pub fn is_starter(&self) -> bool {
        self.node_type() == STARTER_TYPE
    }

    /// The first connection target of a port, if any
    pub fn first_target(&self, port: &str) -> Option<&str> {
        self.outputs
            .get(port)
            .and_then(|o| o.connections.first())
            .map(|c| c.node.as_str())
    }

    /// Per-step copy handed to step strategies.
    ///
    /// New data map and new connection sequences, so step mutations (the
    /// `compile` slot, storage ids) never reach the cached graph.
    pub fn deep_copy(&self) -> Node {
        Node {
            id: self.id.clone(),
            data: self.data.clone(),
            outputs: self
                .outputs
                .iter()
                .map(|(port, output)| {
                    (
                        port.clone(),
                        Output {
                            connections: output.connections.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Deep copy of a whole playbook set (new node, output and connection
/// instances; data values are treated as immutable and cloned by value).
pub fn deep_copy_set(set: &PlaybookSet) -> PlaybookSet {
    set.iter()
        .map(|(flow, subs)| {
            (
                flow.clone(),
                subs.iter()
                    .map(|(sub, playbook)| {
                        (
                            sub.clone(),
                            playbook
                                .iter()
                                .map(|(id, node)| (id.clone(), node.deep_copy()))
                                .collect(),
                        )
                    })
                    .collect(),
            )
        })
        .collect()
}

/// Remove starters that cannot start anything.
///
/// A starter must have a non-empty `output_1` connection list; corrupted ones
/// are elided before the graph is cached so the router never sees them.
/// Returns the number of removed nodes.
pub fn sanitize(set: &mut PlaybookSet, app: &str) -> usize {
    let mut removed = 0;
    for (flow, subs) in set.iter_mut() {
        for playbook in subs.values_mut() {
            let corrupted: Vec<String> = playbook
                .iter()
                .filter(|(_, node)| {
                    node.is_starter() && node.first_target(PORT_MAIN).is_none()
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in corrupted {
                tracing::warn!(
                    app = app,
                    flow = flow.as_str(),
                    node = id.as_str(),
                    "eliding starter without output_1 connections"
                );
                playbook.remove(&id);
                removed += 1;
            }
        }
    }
    removed
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    })
}
