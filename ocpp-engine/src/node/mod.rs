//! Networking node
//!
//! Ties the engine together. A node owns one set of shared services
//! (connection table, source router, correlator, signature policy, reporter
//! and dispatch registry) and exposes them through two halves:
//! - `inbound`: frames from peers (decode, verify, dispatch or relay, answer)
//! - `outbound`: requests this node originates
//!
//! ```text
//!  bytes ──► decode ──► destination is us? ──no──► relay to next hop
//!                              │yes
//!              ┌───────────────┴───────────────┐
//!            CALL                     CALLRESULT / CALLERROR
//!              │                               │
//!   verify ─► dispatch ─► sign ─► reply     verify ─► correlator
//! ```

mod inbound;
mod outbound;

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::correlation::Correlator;
use crate::dispatch::DispatchRouter;
use crate::reporter::Reporter;
use crate::routing::{ConnectionId, ConnectionTable, NodeId, SourceRouter};
use crate::signature::SignaturePolicy;
use crate::transport::Connection;

pub use outbound::Outbound;

use inbound::{InFlight, Inbound};

/// State shared by the inbound and outbound halves
pub(crate) struct Services {
    pub(crate) config: EngineConfig,
    pub(crate) connections: Arc<ConnectionTable>,
    pub(crate) routes: SourceRouter,
    pub(crate) correlator: Arc<Correlator>,
    pub(crate) signatures: SignaturePolicy,
    pub(crate) reporter: Reporter,
    pub(crate) dispatch: DispatchRouter,
    pub(crate) in_flight: InFlight,
}

/// A node of the OCPP overlay: charging station, networking node or CSMS
#[derive(Clone)]
pub struct NetworkingNode {
    services: Arc<Services>,
    inbound: Inbound,
    outbound: Outbound,
}

impl NetworkingNode {
    pub fn new(config: EngineConfig) -> Self {
        let connections = Arc::new(ConnectionTable::new());
        let services = Arc::new(Services {
            connections: connections.clone(),
            routes: SourceRouter::new(config.node_id.clone(), config.max_hops, connections),
            correlator: Correlator::new(),
            signatures: config.signature_policy.clone(),
            reporter: Reporter::new(config.transmit_timeout),
            dispatch: DispatchRouter::new(),
            in_flight: InFlight::default(),
            config,
        });

        Self {
            inbound: Inbound::new(services.clone()),
            outbound: Outbound::new(services.clone()),
            services,
        }
    }

    pub fn id(&self) -> &str {
        &self.services.config.node_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    /// Registry for inbound CALL handlers
    pub fn router(&self) -> &DispatchRouter {
        &self.services.dispatch
    }

    /// Originate requests
    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn reporter(&self) -> &Reporter {
        &self.services.reporter
    }

    pub fn connections(&self) -> &Arc<ConnectionTable> {
        &self.services.connections
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.services.correlator
    }

    /// Register a live connection, replacing any previous one to the same peer.
    ///
    /// The returned id is handed back to [`on_closed`](Self::on_closed) when
    /// this particular connection goes away.
    pub fn attach(&self, connection: Arc<dyn Connection>) -> ConnectionId {
        let peer = connection.peer_id().to_string();
        let (id, replaced) = self.services.connections.insert(connection);
        if replaced.is_some() {
            info!("{}: replaced connection to {}", self.id(), peer);
        } else {
            info!("{}: connected to {}", self.id(), peer);
        }
        id
    }

    /// Send traffic for unknown destinations to `peer`
    pub fn set_default_route(&self, peer: Option<NodeId>) {
        self.services.connections.set_default_route(peer);
    }

    /// Handle one frame received from `peer`
    pub async fn on_frame(&self, peer: &str, bytes: &[u8]) {
        self.inbound.receive(peer, bytes).await;
    }

    /// The transport lost `connection` to `peer`. A connection that was
    /// already replaced only fails the requests it carried.
    pub fn on_closed(&self, peer: &str, connection: ConnectionId) {
        self.inbound.connection_closed(peer, connection);
    }

    /// Drop the current connection to `peer` and fail everything waiting on it
    pub fn disconnect(&self, peer: &str) {
        match self.services.connections.id_of(peer) {
            Some(connection) => self.on_closed(peer, connection),
            None => debug!("{}: not connected to {}", self.id(), peer),
        }
    }
}
