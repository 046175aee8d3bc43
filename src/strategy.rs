//! Forwarding target selection.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use parking_lot::Mutex;
use rand::{seq::SliceRandom, thread_rng};
use time::OffsetDateTime;

use crate::core::{
    message::{Message, MessageKind},
    node::Node,
    resource::Resources,
    routing_table::RoutingTable,
};

/// The forwarding strategies a router can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingStrategy {
    /// Forwards to every live unstructured neighbour.
    UnstructuredFlooding,
    /// Forwards to one live unstructured neighbour.
    UnstructuredRandomWalk,
    /// Forwards through the super-peer layer to every live candidate.
    #[default]
    SuperPeerFlooding,
    /// Forwards through the super-peer layer to one live candidate.
    SuperPeerRandomWalk,
}

/// The outcome of a strategy selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub targets: Vec<Node>,
    /// Set when an ordinary peer had to bypass a missing or dead super-peer.
    pub search_for_super_peer: bool,
}

impl RoutingStrategy {
    pub fn is_random_walk(&self) -> bool {
        matches!(
            self,
            RoutingStrategy::UnstructuredRandomWalk | RoutingStrategy::SuperPeerRandomWalk
        )
    }

    fn uses_super_peers(&self) -> bool {
        matches!(
            self,
            RoutingStrategy::SuperPeerFlooding | RoutingStrategy::SuperPeerRandomWalk
        )
    }

    /// Selects the nodes a message should be forwarded to.
    ///
    /// `origin` is the node the message was received from, `None` when this node originates it.
    /// The origin is never a flooding target, a random walk only bounces back to it when it is the
    /// sole live neighbour left.
    pub fn select(
        &self,
        table: &RoutingTable,
        resources: &Resources,
        origin: Option<&Node>,
        message: &Message,
    ) -> Selection {
        let (candidates, search_for_super_peer) = if self.uses_super_peers() {
            super_peer_candidates(table, resources, message)
        } else {
            (table.unstructured_neighbors(), false)
        };

        let live: Vec<Node> = candidates
            .iter()
            .filter(|node| node.is_alive() && Some(*node) != origin)
            .cloned()
            .collect();

        let targets = if live.len() <= 1 || !self.is_random_walk() {
            match (live.is_empty(), origin) {
                // Bounce the walk back rather than let it die.
                (true, Some(origin)) if self.is_random_walk() => candidates
                    .into_iter()
                    .filter(|node| node == origin && node.is_alive())
                    .take(1)
                    .collect(),
                _ => live,
            }
        } else {
            live.choose(&mut thread_rng()).cloned().into_iter().collect()
        };

        Selection {
            targets,
            search_for_super_peer,
        }
    }
}

fn super_peer_candidates(
    table: &RoutingTable,
    resources: &Resources,
    message: &Message,
) -> (Vec<Node>, bool) {
    match table {
        RoutingTable::SuperPeer(sp_table) => {
            let owners: HashSet<Node> = match (message.search_query(), resources.aggregated()) {
                (Some(query), Some(index)) => index
                    .find_aggregated_resources(query)
                    .into_iter()
                    .flat_map(|resource| resource.nodes().clone())
                    // Prefer the table's handle so liveness reflects the router's view.
                    .map(|node| table.get(node.addr()).unwrap_or(node))
                    .collect(),
                _ => HashSet::new(),
            };

            if owners.is_empty() {
                (sp_table.super_peers().nodes(), false)
            } else {
                (owners.into_iter().collect(), false)
            }
        }
        RoutingTable::Ordinary(ord_table) => match ord_table.super_peer() {
            Some(super_peer) if super_peer.is_alive() => (vec![super_peer], false),
            _ => (table.unstructured_neighbors(), true),
        },
    }
}

#[derive(Debug)]
struct CacheEntry {
    timestamp: OffsetDateTime,
    forwarded: HashSet<Node>,
}

/// Remembers which nodes a request was already forwarded to.
///
/// Requests are identified by kind and every field but the hop count, so the same search reaching
/// a node over several paths is only forwarded to each target once per expiry window.
#[derive(Debug)]
pub struct ForwardCache {
    expiry: Duration,
    entries: Mutex<HashMap<(MessageKind, Vec<String>), CacheEntry>>,
}

impl ForwardCache {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(message: &Message) -> (MessageKind, Vec<String>) {
        let hops = message.kind().hop_count_index();
        let fields = message
            .fields()
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != hops)
            .map(|(_, field)| field.clone())
            .collect();

        (message.kind(), fields)
    }

    /// Drops the targets the request was already forwarded to and records the rest.
    pub fn filter(&self, message: &Message, targets: Vec<Node>) -> Vec<Node> {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.entries.lock();

        entries.retain(|_, entry| now - entry.timestamp <= self.expiry);

        let entry = entries
            .entry(Self::key(message))
            .or_insert_with(|| CacheEntry {
                timestamp: now,
                forwarded: HashSet::new(),
            });

        targets
            .into_iter()
            .filter(|node| entry.forwarded.insert(node.clone()))
            .collect()
    }

    /// Forgets earlier forwards of the request, then records the targets.
    ///
    /// Used for requests this node issues itself, so a repeated query is sent out again.
    pub fn renew(&self, message: &Message, targets: Vec<Node>) -> Vec<Node> {
        self.entries.lock().remove(&Self::key(message));
        self.filter(message, targets)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
