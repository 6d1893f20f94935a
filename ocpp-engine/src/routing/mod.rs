//! Addressing through networking nodes
//!
//! - `network_path`: the relay chain a message has traversed
//! - `source`: resolving a destination into a next-hop connection

pub mod network_path;
pub mod source;

use thiserror::Error;

pub use network_path::{NetworkPath, DEFAULT_MAX_HOPS};
pub use source::{ConnectionId, ConnectionTable, ResolvedRoute, SourceRouter, SourceRouting};

/// Identifier of a charging station, networking node or CSMS
pub type NodeId = String;

/// Routing failures. Never retryable: the same message would fail the same way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("hop limit of {limit} exceeded by path {path}")]
    HopLimitExceeded { limit: usize, path: NetworkPath },

    #[error("no connection to next hop {0}")]
    NoConnection(NodeId),

    #[error("destination {destination} unreachable: source route {route:?} already consumed")]
    RouteExhausted { destination: NodeId, route: Vec<NodeId> },

    #[error("routing loop: {node} already appears in path {path}")]
    Loop { node: NodeId, path: NetworkPath },

    #[error("source route is empty")]
    EmptyRoute,
}
