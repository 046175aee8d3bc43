use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Weak,
    },
};

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::{trace, warn};

use crate::{
    core::error::Error,
    message::Message,
    transport::{Listeners, NetworkHandler, NetworkListener},
};

/// The first port handed out to handlers requested on port 0.
const FIRST_EPHEMERAL_PORT: u16 = 49152;

#[derive(Debug)]
struct Registry {
    handlers: RwLock<HashMap<SocketAddr, Weak<MemoryHandler>>>,
    next_port: AtomicU16,
}

/// An in-process network.
///
/// Handlers created from the same network (or its clones) can reach each other. Every message is
/// serialized on send and parsed on delivery, as it would be on a real wire.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    registry: Arc<Registry>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                handlers: RwLock::new(HashMap::new()),
                next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
            }),
        }
    }

    /// Creates a handler bound to the address, port 0 picks a free port.
    ///
    /// Must be called from within a tokio runtime, deliveries are spawned on it.
    pub fn handler(&self, addr: SocketAddr) -> Result<Arc<MemoryHandler>, Error> {
        let handle = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let mut handlers = self.registry.handlers.write();

        // Forget the handlers that have been dropped.
        handlers.retain(|_, handler| handler.strong_count() > 0);

        let mut addr = addr;
        if addr.port() == 0 {
            loop {
                let port = self.registry.next_port.fetch_add(1, Ordering::Relaxed);
                addr.set_port(port);
                if port != 0 && !handlers.contains_key(&addr) {
                    break;
                }
            }
        } else if handlers.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} is already bound"),
            )
            .into());
        }

        let handler = Arc::new(MemoryHandler {
            addr,
            network: self.clone(),
            handle,
            listening: AtomicBool::new(false),
            listeners: Listeners::default(),
        });
        handlers.insert(addr, Arc::downgrade(&handler));

        Ok(handler)
    }

    fn lookup(&self, addr: SocketAddr) -> Option<Arc<MemoryHandler>> {
        self.registry.handlers.read().get(&addr).and_then(Weak::upgrade)
    }

    /// Returns `true` if a listening handler is bound to the address.
    pub fn is_reachable(&self, addr: SocketAddr) -> bool {
        self.lookup(addr).is_some_and(|handler| handler.is_listening())
    }
}

/// A [`NetworkHandler`] on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryHandler {
    addr: SocketAddr,
    network: MemoryNetwork,
    handle: Handle,
    listening: AtomicBool,
    listeners: Listeners,
}

impl NetworkHandler for MemoryHandler {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn send_message(&self, to: SocketAddr, message: Message) {
        let from = self.addr;
        let network = self.network.clone();
        let line = message.serialize();

        self.handle.spawn(async move {
            match network.lookup(to).filter(|target| target.is_listening()) {
                Some(target) => match Message::parse(&line) {
                    Ok(message) => {
                        trace!("delivering {line:?} from {from} to {to}");
                        target.listeners.received(from, message);
                    }
                    Err(e) => warn!("dropping an undecodable message from {from}: {e}"),
                },
                None => {
                    trace!("{to} is unreachable");
                    if let Some(sender) = network.lookup(from) {
                        sender.listeners.send_failed(to, message);
                    }
                }
            }
        });
    }

    fn start_listening(&self) -> Result<(), Error> {
        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    fn restart(&self) -> Result<(), Error> {
        // The registration is kept throughout, the address can't be taken in between.
        self.shutdown();
        self.start_listening()
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    fn add_listener(&self, listener: Weak<dyn NetworkListener>) {
        self.listeners.add(listener);
    }
}

impl Drop for MemoryHandler {
    fn drop(&mut self) {
        self.network
            .registry
            .handlers
            .write()
            .retain(|_, handler| handler.strong_count() > 0);
    }
}
