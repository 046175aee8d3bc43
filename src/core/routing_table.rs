//! Per-role neighbour sets.

use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    net::SocketAddr,
};

use parking_lot::RwLock;

use crate::core::node::{Node, Role};

/// An address-keyed set of nodes, optionally bounded.
///
/// Each set carries its own lock: writers exclude other readers and writers of the same set only.
#[derive(Debug, Default)]
pub struct NodeSet {
    nodes: RwLock<HashMap<SocketAddr, Node>>,
    capacity: Option<usize>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set that rejects inserts beyond `capacity` nodes.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Returns `true` if the node is present after the call, `false` if the set is full.
    ///
    /// Re-inserting an address keeps the node already stored.
    pub fn insert(&self, node: Node) -> bool {
        let mut nodes = self.nodes.write();

        if nodes.contains_key(&node.addr()) {
            return true;
        }

        if let Some(capacity) = self.capacity {
            match nodes.len().cmp(&capacity) {
                Ordering::Less => {}
                Ordering::Equal => return false,
                // Inserts are checked against the capacity, this should never happen.
                Ordering::Greater => unreachable!(),
            }
        }

        nodes.insert(node.addr(), node);
        true
    }

    pub fn remove(&self, addr: SocketAddr) -> bool {
        self.nodes.write().remove(&addr).is_some()
    }

    pub fn get(&self, addr: SocketAddr) -> Option<Node> {
        self.nodes.read().get(&addr).cloned()
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.nodes.read().contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn is_full(&self) -> bool {
        matches!(self.capacity, Some(capacity) if self.len() >= capacity)
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn clear(&self) {
        self.nodes.write().clear();
    }
}

/// The routing table of an ordinary peer.
#[derive(Debug, Default)]
pub struct OrdinaryPeerRoutingTable {
    unstructured: NodeSet,
    super_peer: RwLock<Option<Node>>,
}

impl OrdinaryPeerRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unstructured(&self) -> &NodeSet {
        &self.unstructured
    }

    /// Returns the assigned super-peer, if any.
    pub fn super_peer(&self) -> Option<Node> {
        self.super_peer.read().clone()
    }

    /// Assigns the super-peer, replacing any previous one.
    pub fn set_super_peer(&self, node: Node) -> Option<Node> {
        let node = self.unstructured.get(node.addr()).unwrap_or(node);
        self.super_peer.write().replace(node)
    }

    /// Clears the assigned super-peer if it has this address.
    pub fn remove_super_peer(&self, addr: SocketAddr) -> bool {
        let mut super_peer = self.super_peer.write();
        if matches!(&*super_peer, Some(node) if node.addr() == addr) {
            *super_peer = None;
            return true;
        }

        false
    }
}

/// The routing table of a super-peer.
#[derive(Debug)]
pub struct SuperPeerRoutingTable {
    unstructured: NodeSet,
    super_peers: NodeSet,
    ordinary_peers: NodeSet,
}

impl SuperPeerRoutingTable {
    /// Creates a table admitting up to `max_ordinary_peers` assigned ordinary peers.
    pub fn new(max_ordinary_peers: usize) -> Self {
        Self {
            unstructured: NodeSet::new(),
            super_peers: NodeSet::new(),
            ordinary_peers: NodeSet::bounded(max_ordinary_peers),
        }
    }

    pub fn unstructured(&self) -> &NodeSet {
        &self.unstructured
    }

    /// The super-peer backbone.
    pub fn super_peers(&self) -> &NodeSet {
        &self.super_peers
    }

    /// The ordinary peers assigned to this super-peer.
    pub fn ordinary_peers(&self) -> &NodeSet {
        &self.ordinary_peers
    }

    pub fn add_super_peer(&self, node: Node) -> bool {
        let node = self.canonical(node);
        self.super_peers.insert(node)
    }

    /// Returns `false` without mutating the set if the capacity is reached.
    pub fn add_ordinary_peer(&self, node: Node) -> bool {
        let node = self.canonical(node);
        self.ordinary_peers.insert(node)
    }

    fn canonical(&self, node: Node) -> Node {
        self.unstructured
            .get(node.addr())
            .or_else(|| self.super_peers.get(node.addr()))
            .or_else(|| self.ordinary_peers.get(node.addr()))
            .unwrap_or(node)
    }
}

/// A role-polymorphic routing table.
#[derive(Debug)]
pub enum RoutingTable {
    Ordinary(OrdinaryPeerRoutingTable),
    SuperPeer(SuperPeerRoutingTable),
}

impl RoutingTable {
    /// Creates an empty table for the role.
    pub fn new(role: Role, max_ordinary_peers: usize) -> Self {
        match role {
            Role::Ordinary => RoutingTable::Ordinary(OrdinaryPeerRoutingTable::new()),
            Role::SuperPeer => RoutingTable::SuperPeer(SuperPeerRoutingTable::new(max_ordinary_peers)),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            RoutingTable::Ordinary(_) => Role::Ordinary,
            RoutingTable::SuperPeer(_) => Role::SuperPeer,
        }
    }

    pub fn as_ordinary(&self) -> Option<&OrdinaryPeerRoutingTable> {
        match self {
            RoutingTable::Ordinary(table) => Some(table),
            RoutingTable::SuperPeer(_) => None,
        }
    }

    pub fn as_super_peer(&self) -> Option<&SuperPeerRoutingTable> {
        match self {
            RoutingTable::Ordinary(_) => None,
            RoutingTable::SuperPeer(table) => Some(table),
        }
    }

    /// The flat neighbour set every node keeps regardless of role.
    pub fn unstructured(&self) -> &NodeSet {
        match self {
            RoutingTable::Ordinary(table) => &table.unstructured,
            RoutingTable::SuperPeer(table) => &table.unstructured,
        }
    }

    pub fn add_unstructured_neighbor(&self, node: Node) -> bool {
        let node = self.get(node.addr()).unwrap_or(node);
        self.unstructured().insert(node)
    }

    pub fn remove_unstructured_neighbor(&self, addr: SocketAddr) -> bool {
        self.unstructured().remove(addr)
    }

    pub fn unstructured_neighbors(&self) -> Vec<Node> {
        self.unstructured().nodes()
    }

    /// Looks the address up in every section and returns the stored node.
    pub fn get(&self, addr: SocketAddr) -> Option<Node> {
        match self {
            RoutingTable::Ordinary(table) => table
                .unstructured
                .get(addr)
                .or_else(|| table.super_peer().filter(|node| node.addr() == addr)),
            RoutingTable::SuperPeer(table) => table
                .unstructured
                .get(addr)
                .or_else(|| table.super_peers.get(addr))
                .or_else(|| table.ordinary_peers.get(addr)),
        }
    }

    /// Removes the address from every section, returns `true` if it was present in any.
    pub fn remove(&self, addr: SocketAddr) -> bool {
        let unstructured = self.unstructured().remove(addr);

        let role_specific = match self {
            RoutingTable::Ordinary(table) => table.remove_super_peer(addr),
            RoutingTable::SuperPeer(table) => {
                // Both removals must run.
                let super_peer = table.super_peers.remove(addr);
                let ordinary_peer = table.ordinary_peers.remove(addr);
                super_peer || ordinary_peer
            }
        };

        unstructured || role_specific
    }

    /// Returns the union of every section.
    pub fn all(&self) -> Vec<Node> {
        let mut seen = HashSet::new();
        let mut nodes = self.unstructured().nodes();

        match self {
            RoutingTable::Ordinary(table) => nodes.extend(table.super_peer()),
            RoutingTable::SuperPeer(table) => {
                nodes.extend(table.super_peers.nodes());
                nodes.extend(table.ordinary_peers.nodes());
            }
        }

        nodes.retain(|node| seen.insert(node.addr()));
        nodes
    }

    /// Empties every section.
    pub fn clear(&self) {
        self.unstructured().clear();

        match self {
            RoutingTable::Ordinary(table) => {
                table.super_peer.write().take();
            }
            RoutingTable::SuperPeer(table) => {
                table.super_peers.clear();
                table.ordinary_peers.clear();
            }
        }
    }

    /// Builds a fresh table for the role, seeded with this table's unstructured neighbours.
    ///
    /// Role-specific sections are not carried over.
    pub fn with_role(&self, role: Role, max_ordinary_peers: usize) -> RoutingTable {
        let table = RoutingTable::new(role, max_ordinary_peers);
        for node in self.unstructured_neighbors() {
            table.unstructured().insert(node);
        }

        table
    }
}
