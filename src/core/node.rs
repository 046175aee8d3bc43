//! Peer identity and liveness.

use std::{
    fmt,
    hash::{Hash, Hasher},
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use parking_lot::RwLock;
use time::OffsetDateTime;

/// The role a node plays in the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Ordinary,
    SuperPeer,
}

impl Role {
    pub fn keyword(&self) -> &'static str {
        match self {
            Role::Ordinary => "ORDINARY",
            Role::SuperPeer => "SUPER_PEER",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "ORDINARY" => Some(Role::Ordinary),
            "SUPER_PEER" => Some(Role::SuperPeer),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// A node's liveness as last observed by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Liveness {
    Active,
    /// A heartbeat is outstanding.
    PendingInactive,
    Inactive,
}

#[derive(Debug)]
struct NodeMeta {
    liveness: Liveness,
    last_seen: Option<OffsetDateTime>,
}

/// A remote peer, identified by its listening address.
///
/// Clones share the same liveness metadata, so a state change made through one handle is visible
/// through every collection holding a clone of it. Equality and hashing only consider the address.
#[derive(Clone)]
pub struct Node {
    addr: SocketAddr,
    meta: Arc<RwLock<NodeMeta>>,
}

impl Node {
    /// Creates a new, active node.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            meta: Arc::new(RwLock::new(NodeMeta {
                liveness: Liveness::Active,
                last_seen: None,
            })),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn liveness(&self) -> Liveness {
        self.meta.read().liveness
    }

    /// Returns `true` unless the node has been marked inactive.
    pub fn is_alive(&self) -> bool {
        !matches!(self.liveness(), Liveness::Inactive)
    }

    pub fn last_seen(&self) -> Option<OffsetDateTime> {
        self.meta.read().last_seen
    }

    /// Overrides the node's liveness.
    pub fn set_liveness(&self, liveness: Liveness) {
        self.meta.write().liveness = liveness;
    }

    /// Marks the node active and updates its last seen timestamp.
    pub(crate) fn mark_seen(&self) {
        let mut meta = self.meta.write();
        meta.liveness = Liveness::Active;
        meta.last_seen = Some(OffsetDateTime::now_utc());
    }

    /// Steps the liveness down ahead of a heartbeat and returns the new state.
    pub(crate) fn age(&self) -> Liveness {
        let mut meta = self.meta.write();
        meta.liveness = match meta.liveness {
            Liveness::Active => Liveness::PendingInactive,
            Liveness::PendingInactive | Liveness::Inactive => Liveness::Inactive,
        };

        meta.liveness
    }

    /// Returns `true` if both handles share the same metadata.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.meta, &other.meta)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("addr", &self.addr)
            .field("liveness", &self.liveness())
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}
