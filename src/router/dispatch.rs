use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::{runtime::Handle, sync::mpsc};
use tracing::{trace, warn};

use crate::{core::node::Node, message::Message};

/// Receives the messages the router doesn't handle itself.
///
/// Callbacks run on the router's worker pool, never on the transport's receive path.
pub trait RouterListener: Send + Sync {
    fn on_message_received(&self, from: &Node, message: &Message);

    /// Called when a request couldn't be delivered, the node has already been marked inactive.
    fn on_message_send_failed(&self, _to: &Node, _message: &Message) {}

    /// Called when a forward had to bypass a missing or dead super-peer.
    fn on_super_peer_unreachable(&self) {}
}

#[derive(Debug)]
pub(crate) enum Event {
    Received(Node, Message),
    SendFailed(Node, Message),
    SuperPeerUnreachable,
}

type Registry = Arc<RwLock<Vec<Weak<dyn RouterListener>>>>;

/// A bounded queue feeding a fixed pool of listener workers.
pub(crate) struct Dispatcher {
    tx: mpsc::Sender<Event>,
    listeners: Registry,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl Dispatcher {
    /// Spawns the workers, they stop once the dispatcher is dropped.
    pub(crate) fn new(handle: &Handle, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let listeners: Registry = Default::default();

        for id in 0..workers.max(1) {
            let rx = rx.clone();
            let listeners = listeners.clone();

            handle.spawn(async move {
                loop {
                    // Scope the lock, other workers may receive while this one delivers.
                    let event = { rx.lock().await.recv().await };

                    match event {
                        Some(event) => deliver(&listeners, event),
                        None => break,
                    }
                }

                trace!("dispatch worker {id} stopped");
            });
        }

        Self { tx, listeners }
    }

    pub(crate) fn add_listener(&self, listener: Weak<dyn RouterListener>) {
        self.listeners.write().push(listener);
    }

    /// Queues the event, it is dropped if the queue is full.
    pub(crate) fn dispatch(&self, event: Event) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("listener queue rejected an event: {e}");
        }
    }
}

fn deliver(listeners: &Registry, event: Event) {
    let mut live = Vec::new();
    listeners.write().retain(|listener| match listener.upgrade() {
        Some(listener) => {
            live.push(listener);
            true
        }
        None => false,
    });

    for listener in live {
        match &event {
            Event::Received(from, message) => listener.on_message_received(from, message),
            Event::SendFailed(to, message) => listener.on_message_send_failed(to, message),
            Event::SuperPeerUnreachable => listener.on_super_peer_unreachable(),
        }
    }
}
