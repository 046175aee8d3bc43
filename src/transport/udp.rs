use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::{net::UdpSocket, runtime::Handle};
use tokio_util::{
    codec::{Decoder, Encoder},
    sync::CancellationToken,
};
use tracing::{debug, trace, warn};

use crate::{
    codec::MessageCodec,
    core::error::Error,
    message::Message,
    transport::{Listeners, NetworkHandler, NetworkListener},
};

/// The largest datagram read off the socket.
const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// A [`NetworkHandler`] sending one datagram per message.
///
/// Messages are sent from the listening socket, so receivers see the sender's listening address.
#[derive(Debug)]
pub struct UdpNetworkHandler {
    addr: SocketAddr,
    socket: Arc<UdpSocket>,
    handle: Handle,
    receiver: Mutex<Option<CancellationToken>>,
    listeners: Arc<Listeners>,
}

impl UdpNetworkHandler {
    /// Binds the socket, port 0 picks a free port.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr) -> Result<Arc<Self>, Error> {
        let handle = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let socket = {
            let _guard = handle.enter();
            UdpSocket::from_std(socket)?
        };
        let addr = socket.local_addr()?;

        Ok(Arc::new(Self {
            addr,
            socket: Arc::new(socket),
            handle,
            receiver: Mutex::new(None),
            listeners: Arc::new(Listeners::default()),
        }))
    }
}

impl NetworkHandler for UdpNetworkHandler {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn send_message(&self, to: SocketAddr, message: Message) {
        let socket = self.socket.clone();
        let listeners = self.listeners.clone();

        self.handle.spawn(async move {
            let mut dst = BytesMut::new();
            let result = match MessageCodec::new().encode(message.clone(), &mut dst) {
                Ok(()) => socket.send_to(&dst, to).await.map(|_| ()),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                warn!("couldn't send a {} to {to}: {e}", message.kind());
                listeners.send_failed(to, message);
            }
        });
    }

    fn start_listening(&self) -> Result<(), Error> {
        let mut receiver = self.receiver.lock();
        if receiver.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return Ok(());
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let socket = self.socket.clone();
        let listeners = self.listeners.clone();
        let addr = self.addr;
        *receiver = Some(token);

        self.handle.spawn(async move {
            debug!("listening on {addr}");
            let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
            let mut codec = MessageCodec::new();

            loop {
                let (len, from) = tokio::select! {
                    _ = child.cancelled() => break,
                    result = socket.recv_from(&mut buf) => match result {
                        Ok(received) => received,
                        Err(e) => {
                            // Errors from earlier sends (e.g. ICMP port unreachable) surface here.
                            trace!("receive error on {addr}: {e}");
                            continue;
                        }
                    },
                };

                let mut src = BytesMut::from(&buf[..len]);
                loop {
                    match codec.decode(&mut src) {
                        Ok(Some(message)) => listeners.received(from, message),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("dropping a malformed datagram from {from}: {e}");
                            break;
                        }
                    }
                }
            }

            debug!("stopped listening on {addr}");
        });

        Ok(())
    }

    fn shutdown(&self) {
        if let Some(token) = self.receiver.lock().take() {
            token.cancel();
        }
    }

    fn restart(&self) -> Result<(), Error> {
        // The socket stays bound, only the receive loop is replaced.
        self.shutdown();
        self.start_listening()
    }

    fn is_listening(&self) -> bool {
        self.receiver
            .lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    fn add_listener(&self, listener: Weak<dyn NetworkListener>) {
        self.listeners.add(listener);
    }
}

impl Drop for UdpNetworkHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
