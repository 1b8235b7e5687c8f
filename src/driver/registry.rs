//! Node registry for the driver.
//!
//! Maps node names to endpoints and secrets, and group names to member
//! nodes. The registry is owned by a [`super::Driver`]; there is no global
//! instance.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// One fleet member running the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// `host:port`, optionally with an `http://` scheme.
    pub endpoint: String,
    #[serde(default)]
    pub group: String,
    pub secret: String,
}

/// Registry of nodes and groups.
///
/// Every name listed in a group is a registered node; nodes are only ever
/// added, never removed.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    /// Nodes in registration order.
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    groups: HashMap<String, Vec<String>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node.
    ///
    /// Re-adding a known name refreshes its endpoint and secret and appends
    /// it to `group` if it is not already a member there; membership in
    /// other groups is kept.
    pub fn add_node(&mut self, name: &str, endpoint: &str, group: &str, secret: &str) {
        let node = Node {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            group: group.to_string(),
            secret: secret.to_string(),
        };

        match self.index.get(name) {
            Some(&i) => {
                tracing::debug!("Updating node {} ({})", name, endpoint);
                self.nodes[i] = node;
            }
            None => {
                tracing::debug!("Adding node {} ({}) to group '{}'", name, endpoint, group);
                self.index.insert(name.to_string(), self.nodes.len());
                self.nodes.push(node);
            }
        }

        let members = self.groups.entry(group.to_string()).or_default();
        if !members.iter().any(|m| m == name) {
            members.push(name.to_string());
        }
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Members of a group, in the order they joined.
    pub fn group(&self, group: &str) -> Option<&[String]> {
        self.groups.get(group).map(|v| v.as_slice())
    }

    pub fn group_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.groups.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Resolve a dispatch request to concrete nodes.
    ///
    /// Explicit nodes come first, then group members, deduplicated in
    /// first-seen order. Unknown names are skipped. With neither nodes nor
    /// groups given, every registered node is returned.
    pub fn resolve(&self, nodes: &[String], groups: &[String]) -> Vec<Node> {
        if nodes.is_empty() && groups.is_empty() {
            return self.nodes.clone();
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        let mut push = |name: &str| {
            match self.get(name) {
                Some(node) => {
                    if seen.insert(name.to_string()) {
                        resolved.push(node.clone());
                    }
                }
                None => tracing::warn!("Unknown node '{}' skipped", name),
            }
        };

        for name in nodes {
            push(name.as_str());
        }
        for group in groups {
            match self.groups.get(group) {
                Some(members) => members.iter().for_each(|m| push(m.as_str())),
                None => tracing::warn!("Unknown group '{}' skipped", group),
            }
        }

        resolved
    }
}
