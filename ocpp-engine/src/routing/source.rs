//! Source routing
//!
//! Resolves a logical destination into the connection a message is handed
//! to next, and the network path stamped on it:
//!
//! | Destination | Next hop | Stamped path |
//! |-------------|----------|--------------|
//! | directly connected node | that node | current path unchanged |
//! | unknown node, default route set | default route | current path + self |
//! | explicit hop list | first unvisited hop | current path + self |

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{NetworkPath, NodeId, RoutingError};
use crate::ocpp::RoutingHeader;
use crate::transport::Connection;

/// Where an outbound message should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRouting {
    /// A single destination node
    Destination(NodeId),
    /// Explicit hops to traverse, the last one being the destination
    Path(Vec<NodeId>),
}

impl SourceRouting {
    pub fn to(node: impl Into<NodeId>) -> Self {
        SourceRouting::Destination(node.into())
    }

    pub fn via<I, S>(hops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        SourceRouting::Path(hops.into_iter().map(Into::into).collect())
    }

    /// Final destination, if one can be named
    pub fn destination(&self) -> Option<&NodeId> {
        match self {
            SourceRouting::Destination(node) => Some(node),
            SourceRouting::Path(hops) => hops.last(),
        }
    }
}

/// Outcome of resolving a [`SourceRouting`]
#[derive(Clone)]
pub struct ResolvedRoute {
    pub next_hop: Arc<dyn Connection>,
    /// Identity of `next_hop` in the connection table
    pub connection: ConnectionId,
    pub network_path: NetworkPath,
    /// Header to stamp on the envelope, `None` for plain point-to-point delivery
    pub header: Option<RoutingHeader>,
}

impl std::fmt::Debug for ResolvedRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedRoute")
            .field("next_hop", &self.next_hop.peer_id())
            .field("connection", &self.connection)
            .field("network_path", &self.network_path)
            .field("header", &self.header)
            .finish()
    }
}

/// Identity of one attached connection.
///
/// A peer that reconnects gets a new id, so the close of its old socket can
/// be told apart from the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

struct Attached {
    id: ConnectionId,
    connection: Arc<dyn Connection>,
}

/// Live connections keyed by the node at the other end
#[derive(Default)]
pub struct ConnectionTable {
    connections: RwLock<HashMap<NodeId, Attached>>,
    default_route: RwLock<Option<NodeId>>,
    next_id: AtomicU64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any previous one to the same peer.
    /// Returns the new connection's id and the connection it replaced.
    pub fn insert(&self, connection: Arc<dyn Connection>) -> (ConnectionId, Option<Arc<dyn Connection>>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let peer = connection.peer_id().to_string();
        let replaced = self
            .connections
            .write()
            .insert(peer, Attached { id, connection })
            .map(|old| old.connection);
        (id, replaced)
    }

    pub fn remove(&self, peer: &str) -> Option<Arc<dyn Connection>> {
        self.connections.write().remove(peer).map(|entry| entry.connection)
    }

    /// Remove the connection to `peer` only if it is still `id`
    pub fn remove_if(&self, peer: &str, id: ConnectionId) -> bool {
        let mut connections = self.connections.write();
        match connections.get(peer) {
            Some(entry) if entry.id == id => {
                connections.remove(peer);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, peer: &str) -> Option<Arc<dyn Connection>> {
        self.connections.read().get(peer).map(|entry| entry.connection.clone())
    }

    /// Current connection to `peer` together with its id
    pub fn lookup(&self, peer: &str) -> Option<(ConnectionId, Arc<dyn Connection>)> {
        self.connections
            .read()
            .get(peer)
            .map(|entry| (entry.id, entry.connection.clone()))
    }

    pub fn id_of(&self, peer: &str) -> Option<ConnectionId> {
        self.connections.read().get(peer).map(|entry| entry.id)
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.connections.read().contains_key(peer)
    }

    pub fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<_> = self.connections.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Uplink used for destinations that are not directly connected
    pub fn set_default_route(&self, peer: Option<NodeId>) {
        *self.default_route.write() = peer;
    }

    pub fn default_route(&self) -> Option<NodeId> {
        self.default_route.read().clone()
    }
}

/// Resolves destinations against the connection table
pub struct SourceRouter {
    local_id: NodeId,
    max_hops: usize,
    connections: Arc<ConnectionTable>,
}

impl SourceRouter {
    pub fn new(local_id: impl Into<NodeId>, max_hops: usize, connections: Arc<ConnectionTable>) -> Self {
        Self {
            local_id: local_id.into(),
            max_hops,
            connections,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn max_hops(&self) -> usize {
        self.max_hops
    }

    pub fn connections(&self) -> &Arc<ConnectionTable> {
        &self.connections
    }

    /// Resolve a destination into the next-hop connection and the path to stamp
    pub fn resolve(
        &self,
        destination: &SourceRouting,
        current: &NetworkPath,
    ) -> Result<ResolvedRoute, RoutingError> {
        match destination {
            SourceRouting::Destination(node) => {
                if let Some((connection, next_hop)) = self.connections.lookup(node) {
                    let header = (!current.is_empty()).then(|| RoutingHeader {
                        destination: node.clone(),
                        network_path: current.clone(),
                        source_route: Vec::new(),
                    });
                    return Ok(ResolvedRoute {
                        next_hop,
                        connection,
                        network_path: current.clone(),
                        header,
                    });
                }

                let uplink = self
                    .connections
                    .default_route()
                    .ok_or_else(|| RoutingError::NoConnection(node.clone()))?;
                let (connection, next_hop) = self
                    .connections
                    .lookup(&uplink)
                    .ok_or_else(|| RoutingError::NoConnection(uplink.clone()))?;
                let network_path = self.stamp(current)?;
                debug!("Routing {} via default route {}", node, uplink);

                Ok(ResolvedRoute {
                    next_hop,
                    connection,
                    header: Some(RoutingHeader {
                        destination: node.clone(),
                        network_path: network_path.clone(),
                        source_route: Vec::new(),
                    }),
                    network_path,
                })
            }
            SourceRouting::Path(hops) => {
                let destination = hops.last().ok_or(RoutingError::EmptyRoute)?;
                let next = hops
                    .iter()
                    .find(|hop| **hop != self.local_id && !current.contains(hop))
                    .ok_or_else(|| RoutingError::RouteExhausted {
                        destination: destination.clone(),
                        route: hops.clone(),
                    })?;
                let (connection, next_hop) = self
                    .connections
                    .lookup(next)
                    .ok_or_else(|| RoutingError::NoConnection(next.clone()))?;
                let network_path = self.stamp(current)?;

                Ok(ResolvedRoute {
                    next_hop,
                    connection,
                    header: Some(RoutingHeader {
                        destination: destination.clone(),
                        network_path: network_path.clone(),
                        source_route: hops.clone(),
                    }),
                    network_path,
                })
            }
        }
    }

    /// Resolve the next hop for a message this node relays on behalf of others.
    ///
    /// The relay stamps itself before resolving; a path that already names this
    /// node means the message is looping.
    pub fn forward(&self, header: &RoutingHeader) -> Result<ResolvedRoute, RoutingError> {
        let arrival = &header.network_path;
        if arrival.contains(&self.local_id) {
            return Err(RoutingError::Loop {
                node: self.local_id.clone(),
                path: arrival.clone(),
            });
        }

        let stamped = self.stamp(arrival)?;
        let routing = if header.source_route.is_empty() {
            SourceRouting::Destination(header.destination.clone())
        } else {
            SourceRouting::Path(header.source_route.clone())
        };

        // The stamped path is never empty, so the resolved route always carries a header
        self.resolve(&routing, &stamped)
    }

    /// Routing for the response to a request that arrived from `peer` along `arrival`
    pub fn reply_route(&self, arrival: &NetworkPath, peer: &str) -> SourceRouting {
        if arrival.is_empty() {
            SourceRouting::Destination(peer.to_string())
        } else {
            SourceRouting::Path(arrival.reversed().into_hops())
        }
    }

    /// Append the local node, unless it already stamped the path
    fn stamp(&self, current: &NetworkPath) -> Result<NetworkPath, RoutingError> {
        if current.last().map(String::as_str) == Some(self.local_id.as_str()) {
            Ok(current.clone())
        } else {
            current.append_bounded(self.local_id.clone(), self.max_hops)
        }
    }
}
