//! Foundational and often-reused types.

pub(crate) mod config;
pub(crate) mod error;
pub mod message;
pub(crate) mod node;
pub(crate) mod periodic;
pub(crate) mod resource;
pub(crate) mod routing_table;
