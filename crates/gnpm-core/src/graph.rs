//! Shared dependency-graph state for one install run.

use semver::{Version, VersionReq};
use std::collections::HashMap;

/// Graph identity of a resolved package: `name@version` with a full version.
#[must_use]
pub fn package_key(name: &str, version: &Version) -> String {
    format!("{name}@{version}")
}

/// A visited package and its outgoing edges in first-encounter order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageNode {
    pub deps: Vec<String>,
}

/// Visited set plus adjacency lists.
///
/// Presence of a key means exactly one worker owns (or finished) the
/// enumeration of that node's edges, so cycles cannot loop the resolver.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, PackageNode>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert-if-absent. Returns `true` when `key` was not yet present,
    /// i.e. the caller won the race and owns enumeration of its edges.
    pub fn mark_visited(&mut self, key: &str) -> bool {
        if self.nodes.contains_key(key) {
            return false;
        }
        self.nodes.insert(key.to_string(), PackageNode::default());
        true
    }

    /// Record the edge `parent -> child`, preserving first-encounter order
    /// and skipping duplicates.
    pub fn add_edge(&mut self, parent: &str, child: &str) {
        let node = self.nodes.entry(parent.to_string()).or_default();
        if !node.deps.iter().any(|dep| dep == child) {
            node.deps.push(child.to_string());
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    #[must_use]
    pub fn node(&self, key: &str) -> Option<&PackageNode> {
        self.nodes.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Concrete versions already selected per package name, in selection order.
///
/// Consulted by the resolver to reuse an already-chosen version whenever its
/// range admits one, cutting network traffic and biasing the graph toward
/// fewer duplicate installs.
#[derive(Debug, Clone, Default)]
pub struct ResolvedVersions {
    by_name: HashMap<String, Vec<Version>>,
}

impl ResolvedVersions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a selected version. Duplicates are kept; reuse lookups
    /// deduplicate at query time.
    pub fn record(&mut self, name: &str, version: Version) {
        self.by_name.entry(name.to_string()).or_default().push(version);
    }

    /// First stored version satisfying `req`, in stored order.
    #[must_use]
    pub fn first_satisfying(&self, name: &str, req: &VersionReq) -> Option<&Version> {
        self.by_name.get(name)?.iter().find(|v| req.matches(v))
    }

    #[must_use]
    pub fn versions(&self, name: &str) -> Option<&[Version]> {
        self.by_name.get(name).map(Vec::as_slice)
    }
}
