//! A hybrid unstructured/super-peer overlay for locating named resources.
//!
//! Every node keeps a flat set of unstructured neighbours. On top of it, ordinary peers attach to
//! a super-peer which aggregates their resource listings and forwards searches over a backbone of
//! super-peers. The overlay repairs itself: heartbeats track liveness, gossip refreshes the
//! aggregated listings and a peer that can't find a super-peer promotes itself.
//!
//! ## Components
//!
//! 1. [`Router`] answers and forwards searches with a [`RoutingStrategy`], bounded by the
//!    configured time to live.
//! 2. [`OverlayNetworkManager`] handles joins, leaves, super-peer election and gossip.
//! 3. [`QueryManager`] issues searches and collects their results.
//!
//! Nodes talk over a [`NetworkHandler`](transport::NetworkHandler). An in-process
//! [`MemoryNetwork`](transport::MemoryNetwork) is always available, a UDP handler requires the
//! `codec` feature.

#![cfg_attr(doc_cfg, feature(doc_cfg))]

#[cfg(feature = "codec")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "codec")))]
pub mod codec;
pub mod overlay;
pub mod query;
pub mod router;
pub mod strategy;
pub mod transport;

mod context;
mod core;

pub use crate::{
    context::Context,
    core::{
        config::Config,
        error::{Error, ParseError, PayloadError},
        message,
        node::{Liveness, Node, Role},
        resource::{
            AggregatedResource, NameMatcher, OwnedResource, ResourceIndex, Resources,
            SuperPeerResourceIndex,
        },
        routing_table::{NodeSet, OrdinaryPeerRoutingTable, RoutingTable, SuperPeerRoutingTable},
    },
    overlay::{AttachmentState, OverlayNetworkManager},
    query::QueryManager,
    router::{Router, RouterListener},
    strategy::{ForwardCache, RoutingStrategy, Selection},
};
