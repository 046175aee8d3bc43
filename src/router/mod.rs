//! The protocol state machine.
//!
//! The [`Router`] is the only component sending and receiving wire messages and the only one
//! mutating node liveness. It answers searches, super-peer searches and heartbeats itself and
//! hands every other message to its [`RouterListener`]s.

use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use parking_lot::{RwLock, RwLockReadGuard};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use crate::{
    core::{
        config::Config,
        error::Error,
        message::{
            Heartbeat, HeartbeatOk, Message, MessageKind, Search, SearchOk, SuperPeerSearch,
            SuperPeerSearchOk,
        },
        node::{Liveness, Node, Role},
        periodic::PeriodicTask,
        resource::Resources,
        routing_table::RoutingTable,
    },
    strategy::{ForwardCache, RoutingStrategy},
    transport::{NetworkHandler, NetworkListener},
};

mod dispatch;

use dispatch::{Dispatcher, Event};
pub use dispatch::RouterListener;

/// The number of listener events that can be queued before new ones are dropped.
const DISPATCH_QUEUE_LEN: usize = 1024;

/// Routes protocol messages for a single node.
pub struct Router {
    this: Weak<Router>,
    config: Config,
    handle: Handle,
    network: RwLock<Arc<dyn NetworkHandler>>,
    routing_table: RwLock<RoutingTable>,
    resources: RwLock<Resources>,
    strategy: RwLock<RoutingStrategy>,
    dispatcher: Dispatcher,
    forward_cache: Option<ForwardCache>,
    heartbeat: PeriodicTask,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("addr", &self.local_addr())
            .field("role", &self.role())
            .field("strategy", &self.strategy())
            .finish()
    }
}

impl Router {
    /// Creates an ordinary-peer router on top of the network handler.
    ///
    /// Must be called from within a tokio runtime, background work is spawned on it.
    pub fn new(config: Config, network: Arc<dyn NetworkHandler>) -> Result<Arc<Self>, Error> {
        let handle = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let dispatcher = Dispatcher::new(
            &handle,
            config.network_handler_thread_count,
            DISPATCH_QUEUE_LEN,
        );

        let router = Arc::new_cyclic(|this| Router {
            this: this.clone(),
            routing_table: RwLock::new(RoutingTable::new(
                Role::Ordinary,
                config.max_assigned_ordinary_peer_count,
            )),
            resources: RwLock::new(Resources::new(Role::Ordinary)),
            strategy: RwLock::new(config.routing_strategy),
            forward_cache: config.forward_cache_expiry.map(ForwardCache::new),
            heartbeat: PeriodicTask::new("heartbeat"),
            network: RwLock::new(network.clone()),
            dispatcher,
            handle,
            config,
        });

        network.add_listener(router.this.clone() as Weak<dyn NetworkListener>);

        Ok(router)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    /// The address this node is reached on.
    pub fn local_addr(&self) -> SocketAddr {
        self.network.read().local_addr()
    }

    pub fn role(&self) -> Role {
        self.routing_table.read().role()
    }

    /// Read access to the routing table, hold the guard briefly.
    pub fn routing_table(&self) -> RwLockReadGuard<'_, RoutingTable> {
        self.routing_table.read()
    }

    /// Read access to the resource index, hold the guard briefly.
    pub fn resources(&self) -> RwLockReadGuard<'_, Resources> {
        self.resources.read()
    }

    pub fn strategy(&self) -> RoutingStrategy {
        *self.strategy.read()
    }

    pub fn set_routing_strategy(&self, strategy: RoutingStrategy) {
        info!("{}: routing with {strategy:?}", self.local_addr());
        *self.strategy.write() = strategy;
    }

    /// Registers a listener for the messages the router doesn't handle itself.
    pub fn add_listener(&self, listener: Weak<dyn RouterListener>) {
        self.dispatcher.add_listener(listener);
    }

    /// Returns the node stored for the address, or a fresh one if it is unknown.
    pub fn resolve(&self, addr: SocketAddr) -> Node {
        self.routing_table
            .read()
            .get(addr)
            .unwrap_or_else(|| Node::new(addr))
    }

    /// Sends the message, failures are reported through `on_message_send_failed`.
    pub fn send(&self, to: SocketAddr, message: impl Into<Message>) {
        let message = message.into();
        trace!("{} -> {to}: {message}", self.local_addr());
        self.network.read().send_message(to, message);
    }

    // LIFECYCLE

    /// Starts listening.
    pub fn start(&self) -> Result<(), Error> {
        self.network.read().start_listening()
    }

    pub fn is_listening(&self) -> bool {
        self.network.read().is_listening()
    }

    /// Forgets every neighbour and restarts the network handler.
    pub fn restart(&self) -> Result<(), Error> {
        info!("{}: restarting", self.local_addr());
        self.routing_table.read().clear();
        self.network.read().restart()
    }

    /// Stops heartbeating and listening.
    pub fn shutdown(&self) {
        self.disable_heartbeat();
        self.network.read().shutdown();
    }

    /// Swaps the network handler, the previous one is shut down.
    ///
    /// The new handler starts listening if the previous one was.
    pub fn set_network_handler(&self, network: Arc<dyn NetworkHandler>) -> Result<(), Error> {
        network.add_listener(self.this.clone() as Weak<dyn NetworkListener>);
        let previous = std::mem::replace(&mut *self.network.write(), network.clone());
        let was_listening = previous.is_listening();
        previous.shutdown();

        info!(
            "{}: swapped the network handler, was {}",
            network.local_addr(),
            previous.local_addr()
        );

        if was_listening {
            network.start_listening()?;
        }

        Ok(())
    }

    // ROLES

    pub fn promote_to_super_peer(&self) -> bool {
        self.switch_role(Role::SuperPeer)
    }

    pub fn demote_to_ordinary_peer(&self) -> bool {
        self.switch_role(Role::Ordinary)
    }

    /// Swaps in a table and an index for the role, returns `false` if the role is unchanged.
    fn switch_role(&self, role: Role) -> bool {
        // The table lock is always taken before the resources lock.
        let mut table = self.routing_table.write();
        if table.role() == role {
            return false;
        }
        let mut resources = self.resources.write();

        *table = table.with_role(role, self.config.max_assigned_ordinary_peer_count);
        *resources = resources.with_role(role);

        info!("{}: switched to {role}", self.local_addr());
        true
    }

    // HEARTBEAT

    /// Starts the heartbeat loop, returns `false` if it is already running.
    pub fn enable_heartbeat(&self) -> bool {
        let this = self.this.clone();
        self.heartbeat
            .start(&self.handle, self.config.heartbeat_interval, move || {
                match this.upgrade() {
                    Some(router) => {
                        router.heartbeat_tick();
                        true
                    }
                    None => false,
                }
            })
    }

    /// Stops the heartbeat loop, returns `false` if it wasn't running.
    pub fn disable_heartbeat(&self) -> bool {
        self.heartbeat.stop()
    }

    pub fn is_heartbeat_enabled(&self) -> bool {
        self.heartbeat.is_running()
    }

    /// Ages every known node and sends it a heartbeat.
    pub(crate) fn heartbeat_tick(&self) {
        let nodes = self.routing_table.read().all();
        let local_addr = self.local_addr();

        for node in nodes {
            let liveness = node.age();
            if liveness == Liveness::Inactive {
                debug!("{local_addr}: {node} missed a heartbeat");
            }

            self.send(node.addr(), Heartbeat { addr: local_addr });
        }
    }

    // ROUTING

    /// Routes a search, super-peer search or heartbeat.
    ///
    /// `from` is the node the message was received from, `None` when this node originates it.
    pub fn route(&self, from: Option<&Node>, message: Message) {
        match message.kind() {
            MessageKind::Search => self.route_search(from, message),
            MessageKind::SuperPeerSearch => self.route_super_peer_search(from, message),
            MessageKind::Heartbeat => self.route_heartbeat(from, message),
            kind => warn!("{}: can't route a {kind} message", self.local_addr()),
        }
    }

    fn route_search(&self, from: Option<&Node>, message: Message) {
        let search = match Search::try_from(&message) {
            Ok(search) => search,
            Err(e) => {
                warn!("{}: dropping a malformed search: {e}", self.local_addr());
                return;
            }
        };

        let names: Vec<String> = self
            .resources
            .read()
            .owned()
            .find_resources(&search.query)
            .into_iter()
            .map(|resource| resource.name().to_owned())
            .collect();

        if !names.is_empty() {
            debug!(
                "{}: {} match {:?}, replying to {}",
                self.local_addr(),
                names.len(),
                search.query,
                search.origin
            );

            self.send(
                search.origin,
                SearchOk {
                    addr: self.local_addr(),
                    hops: search.hops,
                    names,
                },
            );
            return;
        }

        if !self.forward(from, message) {
            debug!(
                "{}: abandoning the search for {:?} from {}",
                self.local_addr(),
                search.query,
                search.origin
            );
        }
    }

    fn route_super_peer_search(&self, from: Option<&Node>, message: Message) {
        let search = match SuperPeerSearch::try_from(&message) {
            Ok(search) => search,
            Err(e) => {
                warn!("{}: dropping a malformed super-peer search: {e}", self.local_addr());
                return;
            }
        };

        // Scope the lock.
        let known = {
            let table = self.routing_table.read();
            match &*table {
                RoutingTable::SuperPeer(_) => Some(self.local_addr()),
                RoutingTable::Ordinary(table) => table
                    .super_peer()
                    .filter(Node::is_alive)
                    .map(|node| node.addr()),
            }
        };

        if let Some(super_peer) = known {
            self.send(
                search.origin,
                SuperPeerSearchOk {
                    super_peer: Some(super_peer),
                },
            );
            return;
        }

        if !self.forward(from, message) {
            debug!(
                "{}: no super-peer found for {}",
                self.local_addr(),
                search.origin
            );
            self.send(search.origin, SuperPeerSearchOk { super_peer: None });
        }
    }

    fn route_heartbeat(&self, from: Option<&Node>, message: Message) {
        let heartbeat = match Heartbeat::try_from(&message) {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                warn!("{}: dropping a malformed heartbeat: {e}", self.local_addr());
                return;
            }
        };

        if let Some(node) = from {
            node.mark_seen();
        }

        self.send(
            heartbeat.addr,
            HeartbeatOk {
                addr: self.local_addr(),
            },
        );
    }

    /// Increments the hop count and sends a copy to each selected target.
    ///
    /// Returns `false` if the hop count exceeds the time to live and the message was dropped.
    fn forward(&self, from: Option<&Node>, mut message: Message) -> bool {
        let hops = match message.increment_hop_count() {
            Some(hops) => hops,
            None => {
                warn!("{}: {} carries no hop count", self.local_addr(), message.kind());
                return false;
            }
        };

        if hops > self.config.time_to_live {
            return false;
        }

        let strategy = self.strategy();
        // Scope the locks, taken in table then resources order.
        let selection = {
            let table = self.routing_table.read();
            let resources = self.resources.read();
            strategy.select(&table, &resources, from, &message)
        };

        if selection.search_for_super_peer {
            self.dispatcher.dispatch(Event::SuperPeerUnreachable);
        }

        let targets = match (&self.forward_cache, from) {
            (Some(cache), Some(_)) => cache.filter(&message, selection.targets),
            (Some(cache), None) => cache.renew(&message, selection.targets),
            (None, _) => selection.targets,
        };

        debug!(
            "{}: forwarding a {} at hop {hops} to {} node(s)",
            self.local_addr(),
            message.kind(),
            targets.len()
        );

        for target in targets {
            self.send(target.addr(), message.clone());
        }

        true
    }
}

impl NetworkListener for Router {
    fn on_message_received(&self, from: SocketAddr, message: Message) {
        let node = self.resolve(from);
        trace!("{} <- {from}: {message}", self.local_addr());

        match message.kind() {
            MessageKind::Echo => self.send(from, Message::new(MessageKind::EchoOk, vec![])),
            MessageKind::EchoOk => {}
            MessageKind::HeartbeatOk => node.mark_seen(),
            kind if kind.is_routed() => self.route(Some(&node), message),
            _ => self.dispatcher.dispatch(Event::Received(node, message)),
        }
    }

    fn on_message_send_failed(&self, to: SocketAddr, message: Message) {
        let node = self.resolve(to);
        node.set_liveness(Liveness::Inactive);

        if message.kind().is_reply() {
            debug!(
                "{}: couldn't deliver a {} to {to}",
                self.local_addr(),
                message.kind()
            );
            return;
        }

        warn!(
            "{}: couldn't deliver a {} to {to}, marked inactive",
            self.local_addr(),
            message.kind()
        );
        self.dispatcher.dispatch(Event::SendFailed(node, message));
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use parking_lot::Mutex;

    use super::*;
    use crate::core::message::{Join, SuperPeerSearchOk};

    /// Records sends instead of delivering them.
    #[derive(Default)]
    struct RecordingHandler {
        sent: Mutex<Vec<(SocketAddr, Message)>>,
        listening: AtomicBool,
    }

    impl RecordingHandler {
        fn take(&self) -> Vec<(SocketAddr, Message)> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl NetworkHandler for RecordingHandler {
        fn local_addr(&self) -> SocketAddr {
            localhost_with_port(1000)
        }

        fn send_message(&self, to: SocketAddr, message: Message) {
            self.sent.lock().push((to, message));
        }

        fn start_listening(&self) -> Result<(), Error> {
            self.listening.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn shutdown(&self) {
            self.listening.store(false, Ordering::SeqCst);
        }

        fn restart(&self) -> Result<(), Error> {
            self.start_listening()
        }

        fn is_listening(&self) -> bool {
            self.listening.load(Ordering::SeqCst)
        }

        fn add_listener(&self, _listener: Weak<dyn NetworkListener>) {}
    }

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<Message>>,
        failed: Mutex<Vec<Message>>,
        unreachable: AtomicBool,
    }

    impl RouterListener for Recorder {
        fn on_message_received(&self, _from: &Node, message: &Message) {
            self.received.lock().push(message.clone());
        }

        fn on_message_send_failed(&self, _to: &Node, message: &Message) {
            self.failed.lock().push(message.clone());
        }

        fn on_super_peer_unreachable(&self) {
            self.unreachable.store(true, Ordering::SeqCst);
        }
    }

    fn localhost_with_port(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn router(strategy: RoutingStrategy) -> (Arc<Router>, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        let config = Config {
            time_to_live: 3,
            routing_strategy: strategy,
            forward_cache_expiry: None,
            ..Default::default()
        };
        let router = Router::new(config, handler.clone()).unwrap();

        (router, handler)
    }

    fn search(query: &str, hops: u32) -> Message {
        Search {
            origin: localhost_with_port(2000),
            query: query.to_owned(),
            hops,
        }
        .into()
    }

    #[tokio::test]
    async fn search_local_match() {
        let (router, handler) = router(RoutingStrategy::UnstructuredFlooding);
        router.resources().owned().add_resource("Cars", "/films/cars.mp4");
        router.routing_table().add_unstructured_neighbor(Node::new(localhost_with_port(1)));

        router.on_message_received(localhost_with_port(2000), search("Cars", 0));

        let sent = handler.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, localhost_with_port(2000));
        assert_eq!(
            SearchOk::try_from(&sent[0].1).unwrap(),
            SearchOk {
                addr: localhost_with_port(1000),
                hops: 0,
                names: vec!["Cars".to_owned()],
            }
        );
    }

    #[tokio::test]
    async fn search_forward() {
        let (router, handler) = router(RoutingStrategy::UnstructuredFlooding);
        for port in 1..=3 {
            router
                .routing_table()
                .add_unstructured_neighbor(Node::new(localhost_with_port(port)));
        }

        router.on_message_received(localhost_with_port(1), search("Cars", 1));

        let sent = handler.take();
        let targets: HashSet<SocketAddr> = sent.iter().map(|(to, _)| *to).collect();
        assert_eq!(
            targets,
            HashSet::from([localhost_with_port(2), localhost_with_port(3)])
        );
        for (_, message) in sent {
            assert_eq!(message.hop_count(), Some(2));
            assert_eq!(message.search_query(), Some("Cars"));
        }
    }

    #[tokio::test]
    async fn search_ttl() {
        let (router, handler) = router(RoutingStrategy::UnstructuredFlooding);
        router
            .routing_table()
            .add_unstructured_neighbor(Node::new(localhost_with_port(1)));

        // The hop count reaches the time to live, still forwarded.
        router.on_message_received(localhost_with_port(2), search("Cars", 2));
        assert_eq!(handler.take().len(), 1);

        // Past the time to live, silently abandoned.
        router.on_message_received(localhost_with_port(2), search("Cars", 3));
        assert!(handler.take().is_empty());
    }

    #[tokio::test]
    async fn super_peer_search_not_found() {
        let (router, handler) = router(RoutingStrategy::SuperPeerFlooding);
        router
            .routing_table()
            .add_unstructured_neighbor(Node::new(localhost_with_port(1)));

        let message = SuperPeerSearch {
            origin: localhost_with_port(2000),
            hops: 3,
        };
        router.on_message_received(localhost_with_port(1), message.into());

        let sent = handler.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, localhost_with_port(2000));
        assert_eq!(
            SuperPeerSearchOk::try_from(&sent[0].1).unwrap(),
            SuperPeerSearchOk { super_peer: None }
        );
        assert_eq!(sent[0].1.field(0), Some("0.0.0.0"));
        assert_eq!(sent[0].1.field(1), Some("0"));
    }

    #[tokio::test]
    async fn super_peer_search_answers() {
        let (router, handler) = router(RoutingStrategy::SuperPeerFlooding);
        let message: Message = SuperPeerSearch {
            origin: localhost_with_port(2000),
            hops: 0,
        }
        .into();

        // An ordinary peer answers with its live super-peer.
        let super_peer = Node::new(localhost_with_port(7));
        router
            .routing_table()
            .as_ordinary()
            .unwrap()
            .set_super_peer(super_peer.clone());
        router.on_message_received(localhost_with_port(1), message.clone());
        assert_eq!(
            SuperPeerSearchOk::try_from(&handler.take()[0].1).unwrap(),
            SuperPeerSearchOk {
                super_peer: Some(localhost_with_port(7))
            }
        );

        // A dead one isn't reported.
        super_peer.set_liveness(Liveness::Inactive);
        router.on_message_received(localhost_with_port(1), message.clone());
        assert!(handler
            .take()
            .iter()
            .all(|(_, m)| m.kind() == MessageKind::SuperPeerSearch));

        // A super-peer answers with itself.
        assert!(router.promote_to_super_peer());
        router.on_message_received(localhost_with_port(1), message);
        assert_eq!(
            SuperPeerSearchOk::try_from(&handler.take()[0].1).unwrap(),
            SuperPeerSearchOk {
                super_peer: Some(localhost_with_port(1000))
            }
        );
    }

    #[tokio::test]
    async fn heartbeat_and_echo() {
        let (router, handler) = router(RoutingStrategy::default());

        let heartbeat = Heartbeat {
            addr: localhost_with_port(5),
        };
        router.on_message_received(localhost_with_port(5), heartbeat.into());
        router.on_message_received(
            localhost_with_port(6),
            Message::new(MessageKind::Echo, vec![]),
        );

        let sent = handler.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, localhost_with_port(5));
        assert_eq!(
            HeartbeatOk::try_from(&sent[0].1).unwrap(),
            HeartbeatOk {
                addr: localhost_with_port(1000)
            }
        );
        assert_eq!(sent[1].0, localhost_with_port(6));
        assert_eq!(sent[1].1.kind(), MessageKind::EchoOk);
    }

    #[tokio::test]
    async fn heartbeat_tick_ages_nodes() {
        let (router, handler) = router(RoutingStrategy::default());
        let node = Node::new(localhost_with_port(1));
        router.routing_table().add_unstructured_neighbor(node.clone());

        router.heartbeat_tick();
        assert_eq!(node.liveness(), Liveness::PendingInactive);
        let sent = handler.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.kind(), MessageKind::Heartbeat);

        // A reply restores the node.
        let reply = HeartbeatOk {
            addr: localhost_with_port(1),
        };
        router.on_message_received(localhost_with_port(1), reply.into());
        assert_eq!(node.liveness(), Liveness::Active);

        router.heartbeat_tick();
        router.heartbeat_tick();
        assert_eq!(node.liveness(), Liveness::Inactive);
    }

    #[tokio::test]
    async fn heartbeat_toggle() {
        let (router, _handler) = router(RoutingStrategy::default());

        assert!(router.enable_heartbeat());
        assert!(!router.enable_heartbeat());
        assert!(router.is_heartbeat_enabled());
        assert!(router.disable_heartbeat());
        assert!(!router.disable_heartbeat());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_failures() {
        let (router, _handler) = router(RoutingStrategy::default());
        let recorder = Arc::new(Recorder::default());
        router.add_listener(Arc::downgrade(&recorder) as Weak<dyn RouterListener>);

        let node = Node::new(localhost_with_port(1));
        router.routing_table().add_unstructured_neighbor(node.clone());

        // Replies are only logged.
        let reply = HeartbeatOk {
            addr: localhost_with_port(1000),
        };
        router.on_message_send_failed(localhost_with_port(1), reply.into());
        assert!(!node.is_alive());

        node.set_liveness(Liveness::Active);
        let join = Join {
            addr: localhost_with_port(1000),
        };
        router.on_message_send_failed(localhost_with_port(1), join.into());
        assert!(!node.is_alive());

        let p = recorder.clone();
        deadline::deadline!(Duration::from_secs(1), move || !p.failed.lock().is_empty());
        assert_eq!(recorder.failed.lock().len(), 1);
        assert_eq!(recorder.failed.lock()[0].kind(), MessageKind::Join);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listeners_and_unreachable_signal() {
        let (router, handler) = router(RoutingStrategy::SuperPeerFlooding);
        let recorder = Arc::new(Recorder::default());
        router.add_listener(Arc::downgrade(&recorder) as Weak<dyn RouterListener>);
        router
            .routing_table()
            .add_unstructured_neighbor(Node::new(localhost_with_port(1)));

        let join = Join {
            addr: localhost_with_port(1),
        };
        router.on_message_received(localhost_with_port(1), join.into());

        // No super-peer assigned, the search floods and signals.
        router.route(None, search("Cars", 0));
        assert_eq!(handler.take().len(), 1);

        let p = recorder.clone();
        deadline::deadline!(Duration::from_secs(1), move || {
            p.unreachable.load(Ordering::SeqCst) && !p.received.lock().is_empty()
        });
        assert_eq!(recorder.received.lock()[0].kind(), MessageKind::Join);
    }

    #[tokio::test]
    async fn role_switch() {
        let (router, _handler) = router(RoutingStrategy::default());
        router.resources().owned().add_resource("Cars", "/films/cars.mp4");
        for port in 1..=3 {
            router
                .routing_table()
                .add_unstructured_neighbor(Node::new(localhost_with_port(port)));
        }

        assert!(!router.demote_to_ordinary_peer());
        assert!(router.promote_to_super_peer());
        assert!(!router.promote_to_super_peer());
        assert_eq!(router.role(), Role::SuperPeer);
        assert_eq!(router.routing_table().unstructured_neighbors().len(), 3);
        assert_eq!(router.resources().owned().len(), 1);

        router
            .routing_table()
            .as_super_peer()
            .unwrap()
            .add_ordinary_peer(Node::new(localhost_with_port(4)));
        router
            .resources()
            .aggregated()
            .unwrap()
            .add_aggregated_resource("Up", Node::new(localhost_with_port(4)));

        assert!(router.demote_to_ordinary_peer());
        assert_eq!(router.role(), Role::Ordinary);
        assert_eq!(router.routing_table().all().len(), 3);
        assert!(router.resources().aggregated().is_none());
        assert!(router.resources().owned().resource("Cars").is_some());
    }

    #[tokio::test]
    async fn forward_cache_suppresses_duplicates() {
        let handler = Arc::new(RecordingHandler::default());
        let config = Config {
            routing_strategy: RoutingStrategy::UnstructuredFlooding,
            forward_cache_expiry: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let router = Router::new(config, handler.clone()).unwrap();
        for port in 1..=3 {
            router
                .routing_table()
                .add_unstructured_neighbor(Node::new(localhost_with_port(port)));
        }

        // The same search arriving over two paths.
        router.on_message_received(localhost_with_port(1), search("Cars", 0));
        router.on_message_received(localhost_with_port(2), search("Cars", 1));

        let targets: Vec<SocketAddr> = handler.take().into_iter().map(|(to, _)| to).collect();
        let unique: HashSet<SocketAddr> = targets.iter().copied().collect();
        assert_eq!(targets.len(), unique.len());
        assert_eq!(
            unique,
            HashSet::from([
                localhost_with_port(1),
                localhost_with_port(2),
                localhost_with_port(3)
            ])
        );
    }

    #[tokio::test]
    async fn repeated_local_search_is_sent_again() {
        let handler = Arc::new(RecordingHandler::default());
        let config = Config {
            routing_strategy: RoutingStrategy::UnstructuredFlooding,
            forward_cache_expiry: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let router = Router::new(config, handler.clone()).unwrap();
        router
            .routing_table()
            .add_unstructured_neighbor(Node::new(localhost_with_port(1)));

        router.route(None, search("Cars", 0));
        router.route(None, search("Cars", 0));
        assert_eq!(handler.take().len(), 2);

        // The search coming back through a neighbour is still a duplicate.
        router.on_message_received(localhost_with_port(2), search("Cars", 1));
        assert!(handler.take().is_empty());
    }

    #[tokio::test]
    async fn restart_clears_table() {
        let (router, handler) = router(RoutingStrategy::default());
        router.start().unwrap();
        router
            .routing_table()
            .add_unstructured_neighbor(Node::new(localhost_with_port(1)));

        router.restart().unwrap();
        assert!(router.routing_table().all().is_empty());
        assert!(handler.is_listening());

        router.shutdown();
        assert!(!router.is_listening());
    }

    #[tokio::test]
    async fn unroutable_kind() {
        let (router, handler) = router(RoutingStrategy::default());
        let join = Join {
            addr: localhost_with_port(1),
        };
        router.route(None, join.into());
        assert!(handler.take().is_empty());
    }

    #[tokio::test]
    async fn network_handler_swap() {
        let (router, previous) = router(RoutingStrategy::default());
        router.start().unwrap();

        let next = Arc::new(RecordingHandler::default());
        router.set_network_handler(next.clone()).unwrap();
        assert!(!previous.is_listening());
        assert!(next.is_listening());

        router.send(localhost_with_port(1), Join {
            addr: localhost_with_port(1000),
        });
        assert!(previous.take().is_empty());
        assert_eq!(next.take().len(), 1);

        // A stopped router hands over a stopped handler.
        router.shutdown();
        let last = Arc::new(RecordingHandler::default());
        router.set_network_handler(last.clone()).unwrap();
        assert!(!last.is_listening());
    }
}
