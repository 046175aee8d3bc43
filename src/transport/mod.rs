//! The network handler contract and its implementations.
//!
//! A [`NetworkHandler`] moves whole [`Message`]s between listening addresses. Sends are fire and
//! forget: the outcome is only reported back through the registered [`NetworkListener`]s.

use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use parking_lot::RwLock;

use crate::{
    core::{config::Config, error::Error},
    message::Message,
};

mod memory;
#[cfg(feature = "codec")]
mod udp;

pub use memory::{MemoryHandler, MemoryNetwork};
#[cfg(feature = "codec")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "codec")))]
pub use udp::UdpNetworkHandler;

/// Receives the inbound messages and failed sends of a [`NetworkHandler`].
pub trait NetworkListener: Send + Sync {
    /// Called with the sender's listening address.
    fn on_message_received(&self, from: SocketAddr, message: Message);

    /// Called when a message couldn't be delivered to `to`.
    fn on_message_send_failed(&self, to: SocketAddr, message: Message);
}

/// Sends and receives messages on behalf of a node.
pub trait NetworkHandler: Send + Sync {
    /// The address peers reach this node on.
    fn local_addr(&self) -> SocketAddr;

    /// Queues the message for delivery and returns immediately.
    fn send_message(&self, to: SocketAddr, message: Message);

    /// Starts delivering inbound messages to the listeners, a no-op if already listening.
    fn start_listening(&self) -> Result<(), Error>;

    /// Stops delivering inbound messages.
    fn shutdown(&self);

    /// Stops and starts listening again without giving up the local address.
    fn restart(&self) -> Result<(), Error>;

    fn is_listening(&self) -> bool;

    fn add_listener(&self, listener: Weak<dyn NetworkListener>);
}

/// The closed set of transports a node can be built on.
#[derive(Debug, Clone)]
pub enum Transport {
    /// An in-process network shared by every node built on it.
    Memory(MemoryNetwork),
    /// A UDP socket bound to the configured address.
    #[cfg(feature = "codec")]
    #[cfg_attr(doc_cfg, doc(cfg(feature = "codec")))]
    Udp,
}

impl Transport {
    /// Creates a handler bound to the configured local address.
    pub fn handler(&self, config: &Config) -> Result<Arc<dyn NetworkHandler>, Error> {
        match self {
            Transport::Memory(network) => Ok(network.handler(config.local_addr())?),
            #[cfg(feature = "codec")]
            Transport::Udp => Ok(UdpNetworkHandler::bind(config.local_addr())?),
        }
    }
}

/// The listener registry shared by the handler implementations.
#[derive(Default)]
pub(crate) struct Listeners {
    listeners: RwLock<Vec<Weak<dyn NetworkListener>>>,
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("len", &self.listeners.read().len())
            .finish()
    }
}

impl Listeners {
    pub(crate) fn add(&self, listener: Weak<dyn NetworkListener>) {
        self.listeners.write().push(listener);
    }

    // Upgrades the live listeners and forgets the dropped ones.
    fn live(&self) -> Vec<Arc<dyn NetworkListener>> {
        let mut live = Vec::new();
        self.listeners.write().retain(|listener| match listener.upgrade() {
            Some(listener) => {
                live.push(listener);
                true
            }
            None => false,
        });

        live
    }

    pub(crate) fn received(&self, from: SocketAddr, message: Message) {
        for listener in self.live() {
            listener.on_message_received(from, message.clone());
        }
    }

    pub(crate) fn send_failed(&self, to: SocketAddr, message: Message) {
        for listener in self.live() {
            listener.on_message_send_failed(to, message.clone());
        }
    }
}
