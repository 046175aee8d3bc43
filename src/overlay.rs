//! Overlay maintenance: bootstrap, join and leave, super-peer election and gossip.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use rand::{seq::SliceRandom, thread_rng, Rng};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    core::{
        error::PayloadError,
        message::{
            Join, JoinOk, JoinSuperPeer, JoinSuperPeerOk, JoinSuperPeerStatus, Leave, LeaveOk,
            ListResources, ListResourcesOk, Message, MessageKind, Register, RegisterOk, Status,
            SuperPeerSearch, SuperPeerSearchOk, Unregister, UnregisterOk,
        },
        node::{Node, Role},
        periodic::PeriodicTask,
        routing_table::RoutingTable,
    },
    router::{Router, RouterListener},
};

/// An ordinary peer's progress towards a super-peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    Unattached,
    /// A super-peer search is under way.
    Searching,
    Attached,
    /// No super-peer could be found or joined, this node became one.
    SelfPromoted,
}

#[derive(Debug)]
struct Attachment {
    state: AttachmentState,
    /// Super-peers that turned this node down for capacity during the current attempt.
    known_full: HashSet<SocketAddr>,
    /// The super-peer a JOIN_SUPER_PEER is outstanding with.
    pending: Option<SocketAddr>,
    /// Bumped on every new attempt, stale timers compare against it.
    attempt: u64,
    /// When the current search started.
    searching_since: OffsetDateTime,
}

/// Drives a node's membership in the overlay on top of its [`Router`].
pub struct OverlayNetworkManager {
    this: Weak<OverlayNetworkManager>,
    router: Arc<Router>,
    attachment: Mutex<Attachment>,
    gossip: PeriodicTask,
}

impl std::fmt::Debug for OverlayNetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayNetworkManager")
            .field("addr", &self.router.local_addr())
            .field("attachment", &*self.attachment.lock())
            .finish()
    }
}

impl OverlayNetworkManager {
    /// Creates the manager and subscribes it to the router.
    pub fn new(router: Arc<Router>) -> Arc<Self> {
        let manager = Arc::new_cyclic(|this| OverlayNetworkManager {
            this: this.clone(),
            router,
            attachment: Mutex::new(Attachment {
                state: AttachmentState::Unattached,
                known_full: HashSet::new(),
                pending: None,
                attempt: 0,
                searching_since: OffsetDateTime::UNIX_EPOCH,
            }),
            gossip: PeriodicTask::new("gossip"),
        });

        manager
            .router
            .add_listener(manager.this.clone() as Weak<dyn RouterListener>);

        manager
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn attachment_state(&self) -> AttachmentState {
        self.attachment.lock().state
    }

    // BOOTSTRAP

    /// Registers with the bootstrap server, returns `false` if none is configured.
    pub fn register(&self) -> bool {
        let Some(server) = self.router.config().bootstrap_server else {
            warn!("{}: no bootstrap server configured", self.router.local_addr());
            return false;
        };

        self.router.send(
            server,
            Register {
                addr: self.router.local_addr(),
                username: self.router.config().username.clone(),
            },
        );

        true
    }

    /// Unregisters from the bootstrap server, returns `false` if none is configured.
    pub fn unregister(&self) -> bool {
        let Some(server) = self.router.config().bootstrap_server else {
            return false;
        };

        self.router.send(
            server,
            Unregister {
                addr: self.router.local_addr(),
                username: self.router.config().username.clone(),
            },
        );

        true
    }

    /// Asks the node to accept this one as an unstructured neighbour.
    pub fn join(&self, addr: SocketAddr) {
        self.router.send(
            addr,
            Join {
                addr: self.router.local_addr(),
            },
        );
    }

    /// Tells every known node this one is leaving.
    pub fn leave(&self) {
        let local_addr = self.router.local_addr();
        let nodes = self.router.routing_table().all();

        info!("{local_addr}: leaving {} node(s)", nodes.len());
        for node in nodes {
            self.router.send(node.addr(), Leave { addr: local_addr });
        }
    }

    // ATTACHMENT

    /// Asks a super-peer to take this node, as an assigned peer or as a backbone member.
    ///
    /// During a search, a candidate that doesn't answer within the timeout counts as exhausted.
    pub fn join_super_peer(&self, addr: SocketAddr) {
        let searching = {
            let mut attachment = self.attachment.lock();
            attachment.pending = Some(addr);
            (attachment.state == AttachmentState::Searching).then_some(attachment.attempt)
        };

        self.router.send(
            addr,
            JoinSuperPeer {
                addr: self.router.local_addr(),
                role: self.router.role(),
            },
        );

        if let Some(attempt) = searching {
            let timeout = self.router.config().ser_super_peer_timeout;
            let this = self.this.clone();
            self.router.handle().spawn(async move {
                sleep(timeout).await;
                if let Some(manager) = this.upgrade() {
                    manager.on_candidate_timeout(attempt, addr);
                }
            });
        }
    }

    /// Starts a super-peer search, returns `false` if one isn't needed or is already running.
    ///
    /// The search is broadcast after a random delay between one and two timeouts, if this node is
    /// still unattached then. Without a reply within the timeout, this node promotes itself.
    pub fn search_for_super_peer(&self) -> bool {
        if self.router.role() == Role::SuperPeer || self.has_live_super_peer() {
            return false;
        }

        let timeout = self.router.config().ser_super_peer_timeout;
        let attempt = {
            let mut attachment = self.attachment.lock();
            let now = OffsetDateTime::now_utc();
            if attachment.state == AttachmentState::Searching {
                // Jitter, broadcast and one candidate's answer all fit in four timeouts.
                if now - attachment.searching_since <= timeout * 4 {
                    return false;
                }
                warn!("{}: restarting a stalled super-peer search", self.router.local_addr());
            }

            attachment.state = AttachmentState::Searching;
            attachment.known_full.clear();
            attachment.pending = None;
            attachment.attempt += 1;
            attachment.searching_since = now;
            attachment.attempt
        };

        let jitter = thread_rng().gen_range(timeout..=timeout * 2);
        let this = self.this.clone();

        debug!(
            "{}: searching for a super-peer in {jitter:?}",
            self.router.local_addr()
        );

        self.router.handle().spawn(async move {
            sleep(jitter).await;
            match this.upgrade() {
                Some(manager) if manager.broadcast_super_peer_search(attempt) => {}
                _ => return,
            }

            sleep(timeout).await;
            if let Some(manager) = this.upgrade() {
                manager.on_search_timeout(attempt);
            }
        });

        true
    }

    fn has_live_super_peer(&self) -> bool {
        self.router
            .routing_table()
            .as_ordinary()
            .and_then(|table| table.super_peer())
            .is_some_and(|node| node.is_alive())
    }

    // Returns `false` if the attempt was superseded, the search is skipped while a candidate is tried.
    fn broadcast_super_peer_search(&self, attempt: u64) -> bool {
        {
            let attachment = self.attachment.lock();
            if attachment.attempt != attempt || attachment.state != AttachmentState::Searching {
                return false;
            }
            if attachment.pending.is_some() {
                return true;
            }
        }

        let search = SuperPeerSearch {
            origin: self.router.local_addr(),
            hops: 0,
        };
        self.router.route(None, search.into());

        true
    }

    // A pending candidate has its own deadline, see `on_candidate_timeout`.
    fn on_search_timeout(&self, attempt: u64) {
        {
            let attachment = self.attachment.lock();
            if attachment.attempt != attempt
                || attachment.state != AttachmentState::Searching
                || attachment.pending.is_some()
            {
                return;
            }
        }

        info!("{}: no super-peer answered", self.router.local_addr());
        self.self_promote();
    }

    fn on_candidate_timeout(&self, attempt: u64, candidate: SocketAddr) {
        {
            let attachment = self.attachment.lock();
            if attachment.attempt != attempt
                || attachment.state != AttachmentState::Searching
                || attachment.pending != Some(candidate)
            {
                return;
            }
        }

        info!(
            "{}: {candidate} didn't answer the join",
            self.router.local_addr()
        );
        self.mark_full(candidate);
        self.try_next_candidate(None);
    }

    /// Promotes this node and asks the super-peers that turned it down to add it to the backbone.
    pub fn self_promote(&self) {
        let candidates: Vec<SocketAddr> = {
            let mut attachment = self.attachment.lock();
            attachment.state = AttachmentState::SelfPromoted;
            attachment.pending = None;
            attachment.attempt += 1;
            attachment.known_full.drain().collect()
        };

        if self.router.promote_to_super_peer() {
            info!("{}: promoted itself to super-peer", self.router.local_addr());
        }

        let local_addr = self.router.local_addr();
        for candidate in candidates {
            self.router.send(
                candidate,
                JoinSuperPeer {
                    addr: local_addr,
                    role: Role::SuperPeer,
                },
            );
        }
    }

    // Tries the alternate if it is new, otherwise every candidate is exhausted.
    fn try_next_candidate(&self, alternate: Option<SocketAddr>) {
        let next = {
            let attachment = self.attachment.lock();
            alternate.filter(|addr| {
                !attachment.known_full.contains(addr) && *addr != self.router.local_addr()
            })
        };

        match next {
            Some(addr) => self.join_super_peer(addr),
            None => self.self_promote(),
        }
    }

    // GOSSIP

    /// Starts the gossip loop, returns `false` if it is already running.
    pub fn enable_gossiping(&self) -> bool {
        let this = self.this.clone();
        self.gossip.start(
            self.router.handle(),
            self.router.config().gossiping_interval,
            move || match this.upgrade() {
                Some(manager) => {
                    manager.gossip();
                    true
                }
                None => false,
            },
        )
    }

    /// Stops the gossip loop, returns `false` if it wasn't running.
    pub fn disable_gossiping(&self) -> bool {
        self.gossip.stop()
    }

    pub fn is_gossiping_enabled(&self) -> bool {
        self.gossip.is_running()
    }

    /// Runs one gossip round.
    ///
    /// A super-peer drops its inactive assigned peers and asks the others for their listing, an
    /// ordinary peer without a live super-peer starts a search.
    pub fn gossip(&self) {
        let local_addr = self.router.local_addr();

        let assigned = {
            let table = self.router.routing_table();
            let Some(sp_table) = table.as_super_peer() else {
                drop(table);
                self.search_for_super_peer();
                return;
            };

            let (alive, dead): (Vec<Node>, Vec<Node>) = sp_table
                .ordinary_peers()
                .nodes()
                .into_iter()
                .partition(Node::is_alive);

            if !dead.is_empty() {
                let resources = self.router.resources();
                for node in &dead {
                    sp_table.ordinary_peers().remove(node.addr());
                    if let Some(index) = resources.aggregated() {
                        index.remove_node(node.addr());
                    }
                }
                info!("{local_addr}: dropped {} inactive assigned peer(s)", dead.len());
            }

            alive
        };

        for node in assigned {
            self.router
                .send(node.addr(), ListResources { addr: local_addr });
        }
    }

    // HANDLERS

    fn on_join(&self, join: Join) {
        let max = self.router.config().max_unstructured_peer_count;

        // Scope the lock.
        let (status, super_peer) = {
            let table = self.router.routing_table();
            let unstructured = table.unstructured();

            let status = if unstructured.contains(join.addr) || unstructured.len() < max {
                Status::from(table.add_unstructured_neighbor(Node::new(join.addr)))
            } else {
                Status::Failure
            };

            let super_peer = match &*table {
                RoutingTable::SuperPeer(_) => Some(self.router.local_addr()),
                RoutingTable::Ordinary(table) => table
                    .super_peer()
                    .filter(Node::is_alive)
                    .map(|node| node.addr()),
            };

            (status, super_peer)
        };

        debug!(
            "{}: join from {} {:?}",
            self.router.local_addr(),
            join.addr,
            status
        );
        self.router
            .send(join.addr, JoinOk { status, super_peer });
    }

    fn on_join_ok(&self, from: &Node, join_ok: JoinOk) {
        if !join_ok.status.is_success() {
            debug!("{}: {from} refused the join", self.router.local_addr());
            return;
        }

        self.router
            .routing_table()
            .add_unstructured_neighbor(from.clone());

        // Skip the search if the new neighbour knows a super-peer.
        let Some(super_peer) = join_ok.super_peer else {
            return;
        };
        if self.router.role() == Role::SuperPeer || self.has_live_super_peer() {
            return;
        }

        let should_join = {
            let attachment = self.attachment.lock();
            attachment.pending.is_none()
                && !attachment.known_full.contains(&super_peer)
                && matches!(
                    attachment.state,
                    AttachmentState::Unattached | AttachmentState::Searching
                )
        };

        if should_join && super_peer != self.router.local_addr() {
            self.join_super_peer(super_peer);
        }
    }

    fn on_leave(&self, leave: Leave) {
        let was_super_peer = self
            .router
            .routing_table()
            .as_ordinary()
            .and_then(|table| table.super_peer())
            .is_some_and(|node| node.addr() == leave.addr);

        // Scope the locks.
        let removed = {
            let table = self.router.routing_table();
            let removed = table.remove(leave.addr);
            if let Some(index) = self.router.resources().aggregated() {
                index.remove_node(leave.addr);
            }
            removed
        };

        info!("{}: {} left", self.router.local_addr(), leave.addr);
        self.router.send(
            leave.addr,
            LeaveOk {
                status: Status::from(removed),
            },
        );

        if was_super_peer {
            self.attachment.lock().state = AttachmentState::Unattached;
            self.search_for_super_peer();
        }
    }

    fn on_register_ok(&self, register_ok: RegisterOk) {
        match register_ok {
            RegisterOk::Peers(peers) => {
                let local_addr = self.router.local_addr();
                info!("{local_addr}: registered, {} peer(s) known", peers.len());

                for peer in peers.into_iter().filter(|peer| *peer != local_addr) {
                    self.join(peer);
                }
                self.search_for_super_peer();
            }
            RegisterOk::Error(e) => {
                warn!("{}: registration failed: {e:?}", self.router.local_addr())
            }
        }
    }

    fn on_super_peer_search_ok(&self, search_ok: SuperPeerSearchOk) {
        let Some(super_peer) = search_ok.super_peer else {
            debug!("{}: a super-peer search came back empty", self.router.local_addr());
            return;
        };

        if self.router.role() == Role::SuperPeer || super_peer == self.router.local_addr() {
            return;
        }

        let should_join = {
            let attachment = self.attachment.lock();
            attachment.state == AttachmentState::Searching
                && attachment.pending.is_none()
                && !attachment.known_full.contains(&super_peer)
        };

        if should_join {
            self.join_super_peer(super_peer);
        }
    }

    fn on_join_super_peer(&self, request: JoinSuperPeer) {
        let local_addr = self.router.local_addr();

        // Scope the lock.
        let status = {
            let table = self.router.routing_table();
            let Some(sp_table) = table.as_super_peer() else {
                drop(table);
                self.router.send(
                    request.addr,
                    JoinSuperPeerOk {
                        status: JoinSuperPeerStatus::Rejected,
                    },
                );
                return;
            };

            let node = table.get(request.addr).unwrap_or_else(|| Node::new(request.addr));
            match request.role {
                Role::SuperPeer => {
                    sp_table.add_super_peer(node);
                    JoinSuperPeerStatus::Admitted
                }
                Role::Ordinary => {
                    if sp_table.add_ordinary_peer(node) {
                        JoinSuperPeerStatus::Admitted
                    } else {
                        let alternates: Vec<SocketAddr> = sp_table
                            .super_peers()
                            .nodes()
                            .into_iter()
                            .filter(|node| node.is_alive() && node.addr() != request.addr)
                            .map(|node| node.addr())
                            .collect();

                        match alternates.choose(&mut thread_rng()) {
                            Some(alternate) => JoinSuperPeerStatus::Full(*alternate),
                            None => JoinSuperPeerStatus::FullNoAlternative,
                        }
                    }
                }
            }
        };

        info!(
            "{local_addr}: {} {} asked to join: {status:?}",
            request.role, request.addr
        );
        self.router.send(request.addr, JoinSuperPeerOk { status });

        if status == JoinSuperPeerStatus::Admitted && request.role == Role::Ordinary {
            self.router
                .send(request.addr, ListResources { addr: local_addr });
        }
    }

    fn on_join_super_peer_ok(&self, from: &Node, response: JoinSuperPeerOk) {
        let local_addr = self.router.local_addr();

        match response.status {
            JoinSuperPeerStatus::Admitted => {
                // Scope the lock.
                let attached = {
                    let table = self.router.routing_table();
                    match &*table {
                        RoutingTable::Ordinary(table) => {
                            table.set_super_peer(from.clone());
                            true
                        }
                        RoutingTable::SuperPeer(table) => {
                            table.add_super_peer(from.clone());
                            false
                        }
                    }
                };

                if attached {
                    let mut attachment = self.attachment.lock();
                    attachment.state = AttachmentState::Attached;
                    attachment.pending = None;
                    attachment.known_full.clear();
                    attachment.attempt += 1;
                    info!("{local_addr}: attached to super-peer {from}");
                } else {
                    info!("{local_addr}: joined the backbone through {from}");
                }
            }
            JoinSuperPeerStatus::Full(alternate) => {
                self.mark_full(from.addr());
                debug!("{local_addr}: {from} is full, trying {alternate}");
                self.try_next_candidate(Some(alternate));
            }
            JoinSuperPeerStatus::FullNoAlternative => {
                self.mark_full(from.addr());
                self.try_next_candidate(None);
            }
            JoinSuperPeerStatus::Rejected => {
                debug!("{local_addr}: {from} isn't a super-peer");
                {
                    let mut attachment = self.attachment.lock();
                    attachment.pending = None;
                    attachment.state = AttachmentState::Unattached;
                }
                self.search_for_super_peer();
            }
        }
    }

    fn mark_full(&self, addr: SocketAddr) {
        let mut attachment = self.attachment.lock();
        attachment.known_full.insert(addr);
        if attachment.pending == Some(addr) {
            attachment.pending = None;
        }
    }

    fn on_list_resources(&self, request: ListResources) {
        let names = self.router.resources().owned().resource_names();
        self.router.send(
            request.addr,
            ListResourcesOk {
                addr: self.router.local_addr(),
                names,
            },
        );
    }

    fn on_list_resources_ok(&self, listing: ListResourcesOk) {
        // Scope the locks, taken in table then resources order.
        let table = self.router.routing_table();
        let Some(node) = table
            .as_super_peer()
            .and_then(|table| table.ordinary_peers().get(listing.addr))
        else {
            debug!(
                "{}: ignoring a listing from unassigned {}",
                self.router.local_addr(),
                listing.addr
            );
            return;
        };

        if let Some(index) = self.router.resources().aggregated() {
            index.update_node_resources(&node, &listing.names);
        }
    }

    fn process_message(&self, from: &Node, message: &Message) -> Result<(), PayloadError> {
        match message.kind() {
            MessageKind::RegisterOk => self.on_register_ok(RegisterOk::try_from(message)?),
            MessageKind::UnregisterOk => {
                let unregister_ok = UnregisterOk::try_from(message)?;
                info!(
                    "{}: unregistered: {:?}",
                    self.router.local_addr(),
                    unregister_ok.status
                );
            }
            MessageKind::Join => self.on_join(Join::try_from(message)?),
            MessageKind::JoinOk => self.on_join_ok(from, JoinOk::try_from(message)?),
            MessageKind::Leave => self.on_leave(Leave::try_from(message)?),
            MessageKind::LeaveOk => {
                LeaveOk::try_from(message)?;
                self.router.routing_table().remove(from.addr());
            }
            MessageKind::SuperPeerSearchOk => {
                self.on_super_peer_search_ok(SuperPeerSearchOk::try_from(message)?)
            }
            MessageKind::JoinSuperPeer => self.on_join_super_peer(JoinSuperPeer::try_from(message)?),
            MessageKind::JoinSuperPeerOk => {
                self.on_join_super_peer_ok(from, JoinSuperPeerOk::try_from(message)?)
            }
            MessageKind::ListResources => self.on_list_resources(ListResources::try_from(message)?),
            MessageKind::ListResourcesOk => {
                self.on_list_resources_ok(ListResourcesOk::try_from(message)?)
            }
            _ => {}
        }

        Ok(())
    }
}

impl RouterListener for OverlayNetworkManager {
    fn on_message_received(&self, from: &Node, message: &Message) {
        if let Err(e) = self.process_message(from, message) {
            warn!(
                "{}: dropping a malformed message from {from}: {e}",
                self.router.local_addr()
            );
        }
    }

    fn on_message_send_failed(&self, to: &Node, message: &Message) {
        if message.kind() != MessageKind::JoinSuperPeer {
            return;
        }

        let was_pending = {
            let mut attachment = self.attachment.lock();
            let was_pending = attachment.pending == Some(to.addr());
            if was_pending {
                attachment.pending = None;
            }
            was_pending
        };

        // An unreachable candidate counts as exhausted.
        if was_pending && self.router.role() == Role::Ordinary {
            self.self_promote();
        }
    }

    fn on_super_peer_unreachable(&self) {
        self.search_for_super_peer();
    }
}
