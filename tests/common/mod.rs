#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use rand::{seq::SliceRandom, thread_rng};
use supernode::{
    message::{Message, MessageKind, Register, RegisterOk, Status, Unregister, UnregisterOk},
    transport::{MemoryHandler, MemoryNetwork, NetworkHandler, NetworkListener, Transport},
    Config, Context, Node, Role, RouterListener, RoutingStrategy,
};
use tracing::*;
use tracing_subscriber::{fmt, EnvFilter};

pub fn enable_tracing() {
    fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

pub fn localhost_with_port(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// A configuration with the background loops off and short timeouts.
pub fn config(port: u16, strategy: RoutingStrategy) -> Config {
    Config {
        listening_port: port,
        username: format!("node-{port}"),
        routing_strategy: strategy,
        heartbeat_enabled: false,
        gossiping_enabled: false,
        heartbeat_interval: Duration::from_millis(50),
        gossiping_interval: Duration::from_millis(50),
        ser_super_peer_timeout: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Builds and starts a node on the network.
pub fn start_node(network: &MemoryNetwork, config: Config) -> Context {
    let context = Context::new(config, &Transport::Memory(network.clone())).unwrap();
    context.start().unwrap();
    context
}

/// Builds and starts a node that owns the named resources.
pub fn start_node_with(
    network: &MemoryNetwork,
    config: Config,
    resources: &[&str],
) -> Context {
    let context = start_node(network, config);
    for name in resources {
        context
            .router()
            .resources()
            .owned()
            .add_resource(*name, format!("/shared/{name}"));
    }
    context
}

pub fn addr(context: &Context) -> SocketAddr {
    context.router().local_addr()
}

pub fn is_super_peer(context: &Context) -> bool {
    context.router().role() == Role::SuperPeer
}

/// Returns `true` if the node is the other's assigned super-peer.
pub fn is_attached_to(context: &Context, super_peer: &Context) -> bool {
    context
        .router()
        .routing_table()
        .as_ordinary()
        .and_then(|table| table.super_peer())
        .is_some_and(|node| node.addr() == addr(super_peer))
}

pub fn is_neighbor(context: &Context, other: &Context) -> bool {
    context
        .router()
        .routing_table()
        .unstructured()
        .contains(addr(other))
}

/// Records everything a router hands to its listeners.
#[derive(Default)]
pub struct Recorder {
    pub received: Mutex<Vec<(SocketAddr, Message)>>,
    pub failed: Mutex<Vec<(SocketAddr, Message)>>,
}

impl Recorder {
    pub fn attach(context: &Context) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        context
            .router()
            .add_listener(Arc::downgrade(&recorder) as Weak<dyn RouterListener>);
        recorder
    }

    pub fn received_of(&self, kind: MessageKind) -> Vec<Message> {
        self.received
            .lock()
            .iter()
            .filter(|(_, message)| message.kind() == kind)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl RouterListener for Recorder {
    fn on_message_received(&self, from: &Node, message: &Message) {
        self.received.lock().push((from.addr(), message.clone()));
    }

    fn on_message_send_failed(&self, to: &Node, message: &Message) {
        self.failed.lock().push((to.addr(), message.clone()));
    }
}

/// A bootstrap server on the memory network, answering with up to two registered peers.
pub struct BootstrapServer {
    handler: Arc<MemoryHandler>,
    registered: Mutex<Vec<SocketAddr>>,
}

impl BootstrapServer {
    pub fn start(network: &MemoryNetwork, port: u16) -> Arc<Self> {
        let server = Arc::new(Self {
            handler: network.handler(localhost_with_port(port)).unwrap(),
            registered: Mutex::new(Vec::new()),
        });
        server
            .handler
            .add_listener(Arc::downgrade(&server) as Weak<dyn NetworkListener>);
        server.handler.start_listening().unwrap();
        server
    }

    pub fn addr(&self) -> SocketAddr {
        self.handler.local_addr()
    }

    pub fn registered(&self) -> Vec<SocketAddr> {
        self.registered.lock().clone()
    }
}

impl NetworkListener for BootstrapServer {
    fn on_message_received(&self, from: SocketAddr, message: Message) {
        match message.kind() {
            MessageKind::Register => {
                let register = Register::try_from(&message).unwrap();
                let peers: Vec<SocketAddr> = {
                    let mut registered = self.registered.lock();
                    let peers = registered
                        .choose_multiple(&mut thread_rng(), 2)
                        .copied()
                        .collect();
                    registered.push(register.addr);
                    peers
                };

                debug!("bootstrap: {} registered, sent {peers:?}", register.addr);
                self.handler
                    .send_message(register.addr, RegisterOk::Peers(peers).into());
            }
            MessageKind::Unregister => {
                let unregister = Unregister::try_from(&message).unwrap();
                let removed = {
                    let mut registered = self.registered.lock();
                    let len = registered.len();
                    registered.retain(|addr| *addr != unregister.addr);
                    registered.len() != len
                };

                self.handler.send_message(
                    unregister.addr,
                    UnregisterOk {
                        status: Status::from(removed),
                    }
                    .into(),
                );
            }
            kind => warn!("bootstrap: unexpected {kind} from {from}"),
        }
    }

    fn on_message_send_failed(&self, to: SocketAddr, _message: Message) {
        warn!("bootstrap: {to} is unreachable");
    }
}
