//! Local and aggregated resource catalogs.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::{Path, PathBuf},
};

use parking_lot::RwLock;
use regex::Regex;
use tracing::warn;

use crate::core::node::{Node, Role};

/// Matches resource names containing a query as a whole word.
///
/// The query must start the name or follow a non-word character, and must end the name or be
/// followed by whitespace: "Spider" matches "Spider Man" but not "Spiderman".
#[derive(Debug, Clone)]
pub struct NameMatcher {
    regex: Option<Regex>,
}

impl NameMatcher {
    pub fn new(query: &str) -> Self {
        let pattern = format!(r"(\W|^){}(\s|$)", regex::escape(query));
        let regex = match Regex::new(&pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                // Only reachable for queries exceeding the regex size limit.
                warn!("can't match query {query:?}: {e}");
                None
            }
        };

        Self { regex }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.as_ref().is_some_and(|regex| regex.is_match(name))
    }
}

/// A resource owned by this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedResource {
    name: String,
    file: PathBuf,
}

impl OwnedResource {
    pub fn new(name: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &Path {
        &self.file
    }
}

/// A resource name and the nodes known to own it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedResource {
    name: String,
    nodes: HashSet<Node>,
}

impl AggregatedResource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &HashSet<Node> {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.nodes.iter().any(|node| node.addr() == addr)
    }

    pub(crate) fn insert(&mut self, node: Node) -> bool {
        self.nodes.insert(node)
    }

    fn remove(&mut self, addr: SocketAddr) -> bool {
        let len = self.nodes.len();
        self.nodes.retain(|node| node.addr() != addr);
        self.nodes.len() != len
    }
}

/// The resources owned by this node, keyed by name.
#[derive(Debug, Default)]
pub struct ResourceIndex {
    owned: RwLock<HashMap<String, OwnedResource>>,
}

impl ResourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a resource with that name is already present.
    pub fn add_resource(&self, name: impl Into<String>, file: impl Into<PathBuf>) -> bool {
        let resource = OwnedResource::new(name, file);
        let mut owned = self.owned.write();

        if owned.contains_key(resource.name()) {
            return false;
        }

        owned.insert(resource.name.clone(), resource);
        true
    }

    pub fn remove_resource(&self, name: &str) -> bool {
        self.owned.write().remove(name).is_some()
    }

    pub fn resource(&self, name: &str) -> Option<OwnedResource> {
        self.owned.read().get(name).cloned()
    }

    pub fn resources(&self) -> Vec<OwnedResource> {
        self.owned.read().values().cloned().collect()
    }

    pub fn resource_names(&self) -> Vec<String> {
        self.owned.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.owned.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.owned.read().is_empty()
    }

    /// Returns the owned resources whose name contains the query as a whole word.
    pub fn find_resources(&self, query: &str) -> Vec<OwnedResource> {
        let matcher = NameMatcher::new(query);
        self.owned
            .read()
            .values()
            .filter(|resource| matcher.matches(resource.name()))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.owned.write().clear();
    }

    fn copy(&self) -> ResourceIndex {
        ResourceIndex {
            owned: RwLock::new(self.owned.read().clone()),
        }
    }
}

/// A super-peer's index: its own resources plus the names reported by its assigned peers.
#[derive(Debug, Default)]
pub struct SuperPeerResourceIndex {
    owned: ResourceIndex,
    aggregated: RwLock<HashMap<String, AggregatedResource>>,
}

impl SuperPeerResourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owned(&self) -> &ResourceIndex {
        &self.owned
    }

    /// Records the node as an owner of the name, returns `false` if it already was.
    pub fn add_aggregated_resource(&self, name: &str, node: Node) -> bool {
        self.aggregated
            .write()
            .entry(name.to_owned())
            .or_insert_with(|| AggregatedResource::new(name))
            .insert(node)
    }

    /// Removes the node from the name's owners, the entry is dropped once it has none left.
    pub fn remove_aggregated_resource(&self, name: &str, addr: SocketAddr) -> bool {
        let mut aggregated = self.aggregated.write();

        let Some(resource) = aggregated.get_mut(name) else {
            return false;
        };

        let removed = resource.remove(addr);
        if resource.nodes.is_empty() {
            aggregated.remove(name);
        }

        removed
    }

    /// Removes the node from every entry, returns the number of entries it was removed from.
    pub fn remove_node(&self, addr: SocketAddr) -> usize {
        let mut aggregated = self.aggregated.write();
        let mut removed = 0;

        aggregated.retain(|_, resource| {
            if resource.remove(addr) {
                removed += 1;
            }
            !resource.nodes.is_empty()
        });

        removed
    }

    /// Replaces the names attributed to the node with a fresh listing.
    pub fn update_node_resources(&self, node: &Node, names: &[String]) {
        let names: HashSet<&str> = names.iter().map(String::as_str).collect();
        let mut aggregated = self.aggregated.write();

        // Drop stale entries first, then add the current listing.
        aggregated.retain(|name, resource| {
            if !names.contains(name.as_str()) {
                resource.remove(node.addr());
            }
            !resource.nodes.is_empty()
        });

        for name in names {
            aggregated
                .entry(name.to_owned())
                .or_insert_with(|| AggregatedResource::new(name))
                .insert(node.clone());
        }
    }

    pub fn aggregated_resource(&self, name: &str) -> Option<AggregatedResource> {
        self.aggregated.read().get(name).cloned()
    }

    pub fn aggregated_resources(&self) -> Vec<AggregatedResource> {
        self.aggregated.read().values().cloned().collect()
    }

    /// Returns the aggregated entries whose name contains the query as a whole word.
    pub fn find_aggregated_resources(&self, query: &str) -> Vec<AggregatedResource> {
        let matcher = NameMatcher::new(query);
        self.aggregated
            .read()
            .values()
            .filter(|resource| matcher.matches(resource.name()))
            .cloned()
            .collect()
    }

    pub fn clear_aggregated(&self) {
        self.aggregated.write().clear();
    }
}

/// A role-polymorphic resource index.
#[derive(Debug)]
pub enum Resources {
    Ordinary(ResourceIndex),
    SuperPeer(SuperPeerResourceIndex),
}

impl Default for Resources {
    fn default() -> Self {
        Resources::Ordinary(ResourceIndex::new())
    }
}

impl Resources {
    pub fn new(role: Role) -> Self {
        match role {
            Role::Ordinary => Resources::Ordinary(ResourceIndex::new()),
            Role::SuperPeer => Resources::SuperPeer(SuperPeerResourceIndex::new()),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Resources::Ordinary(_) => Role::Ordinary,
            Resources::SuperPeer(_) => Role::SuperPeer,
        }
    }

    /// The resources owned by this node.
    pub fn owned(&self) -> &ResourceIndex {
        match self {
            Resources::Ordinary(index) => index,
            Resources::SuperPeer(index) => &index.owned,
        }
    }

    pub fn aggregated(&self) -> Option<&SuperPeerResourceIndex> {
        match self {
            Resources::Ordinary(_) => None,
            Resources::SuperPeer(index) => Some(index),
        }
    }

    /// Builds the index for the role, owned resources migrate and aggregated ones are dropped.
    pub fn with_role(&self, role: Role) -> Resources {
        let owned = self.owned().copy();

        match role {
            Role::Ordinary => Resources::Ordinary(owned),
            Role::SuperPeer => Resources::SuperPeer(SuperPeerResourceIndex {
                owned,
                aggregated: RwLock::new(HashMap::new()),
            }),
        }
    }
}
