//! Node configuration.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use crate::strategy::RoutingStrategy;

/// The configuration consumed by a node's router and managers.
///
/// Construct with struct update syntax over the defaults:
///
/// ```
/// use supernode::Config;
///
/// let config = Config {
///     listening_port: 5001,
///     time_to_live: 3,
///     ..Default::default()
/// };
/// assert_eq!(config.local_addr().port(), 5001);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// The address advertised to peers and used as the origin of searches.
    pub ip: IpAddr,
    pub listening_port: u16,
    /// The name registered with the bootstrap server.
    pub username: String,
    pub bootstrap_server: Option<SocketAddr>,
    /// The hop count past which searches are abandoned.
    pub time_to_live: u32,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval: Duration,
    pub gossiping_enabled: bool,
    pub gossiping_interval: Duration,
    /// The number of ordinary peers a super-peer accepts.
    pub max_assigned_ordinary_peer_count: usize,
    /// The number of unstructured neighbours accepted through JOIN.
    pub max_unstructured_peer_count: usize,
    /// How long a super-peer search waits for a reply before self-promoting.
    pub ser_super_peer_timeout: Duration,
    /// The size of the router's listener worker pool.
    pub network_handler_thread_count: usize,
    pub routing_strategy: RoutingStrategy,
    /// Suppresses repeated forwards of the same request to the same node within the window.
    /// Requests this node issues itself are always sent.
    pub forward_cache_expiry: Option<Duration>,
}

impl Config {
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.listening_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listening_port: 0,
            username: String::from("supernode"),
            bootstrap_server: None,
            time_to_live: 5,
            heartbeat_enabled: true,
            heartbeat_interval: Duration::from_secs(5),
            gossiping_enabled: true,
            gossiping_interval: Duration::from_secs(10),
            max_assigned_ordinary_peer_count: 10,
            max_unstructured_peer_count: 16,
            ser_super_peer_timeout: Duration::from_secs(2),
            network_handler_thread_count: 4,
            routing_strategy: RoutingStrategy::default(),
            forward_cache_expiry: Some(Duration::from_millis(500)),
        }
    }
}
