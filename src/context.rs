use std::sync::Arc;

use tracing::info;

use crate::{
    core::{config::Config, error::Error},
    overlay::OverlayNetworkManager,
    query::QueryManager,
    router::Router,
    transport::Transport,
};

/// A node: its router and the managers built on it.
#[derive(Debug, Clone)]
pub struct Context {
    router: Arc<Router>,
    overlay: Arc<OverlayNetworkManager>,
    query: Arc<QueryManager>,
}

impl Context {
    /// Builds a node on the transport, nothing is sent until [`Context::start`] is called.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config, transport: &Transport) -> Result<Self, Error> {
        let network = transport.handler(&config)?;
        let router = Router::new(config, network)?;
        let overlay = OverlayNetworkManager::new(router.clone());
        let query = QueryManager::new(router.clone());

        Ok(Self {
            router,
            overlay,
            query,
        })
    }

    pub fn config(&self) -> &Config {
        self.router.config()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn overlay(&self) -> &Arc<OverlayNetworkManager> {
        &self.overlay
    }

    pub fn query(&self) -> &Arc<QueryManager> {
        &self.query
    }

    /// Starts listening and the background loops enabled in the configuration.
    pub fn start(&self) -> Result<(), Error> {
        self.router.start()?;

        if self.config().heartbeat_enabled {
            self.router.enable_heartbeat();
        }
        if self.config().gossiping_enabled {
            self.overlay.enable_gossiping();
        }

        info!("{}: started", self.router.local_addr());
        Ok(())
    }

    /// Stops the background loops and the network handler.
    pub fn shutdown(&self) {
        self.overlay.disable_gossiping();
        self.router.shutdown();

        info!("{}: shut down", self.router.local_addr());
    }
}
