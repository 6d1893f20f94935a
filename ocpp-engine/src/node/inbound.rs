//! Frames arriving from peers
//!
//! Every CALL that decodes gets exactly one reply. Responses are verified and
//! handed to the correlator. Messages addressed to another node are relayed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Outbound, Services};
use crate::correlation::Outcome;
use crate::dispatch::{CallContext, Dispatched, Stage};
use crate::ocpp::{
    decode, Call, CallError, DecodeError, ErrorCode, Framing, OcppMessage, RequestId,
    RoutingHeader,
};
use crate::routing::{ConnectionId, NodeId, SourceRouting};
use crate::signature::Direction;

struct InFlightCall {
    /// Peer the call arrived from, which is a relay when the origin is further away
    via: NodeId,
    cancelled: Arc<AtomicBool>,
}

/// Inbound calls still being handled, keyed by originating node and request id.
/// The flag is raised when the connection the call arrived on closes.
#[derive(Default)]
pub(crate) struct InFlight {
    calls: Mutex<HashMap<(NodeId, RequestId), InFlightCall>>,
}

impl InFlight {
    /// Track a call; `None` if the same origin already has it in flight
    fn begin(&self, origin: &str, via: &str, request_id: &RequestId) -> Option<Arc<AtomicBool>> {
        let mut calls = self.calls.lock();
        let key = (origin.to_string(), request_id.clone());
        if calls.contains_key(&key) {
            return None;
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        calls.insert(
            key,
            InFlightCall {
                via: via.to_string(),
                cancelled: cancelled.clone(),
            },
        );
        Some(cancelled)
    }

    fn finish(&self, origin: &str, request_id: &RequestId) {
        self.calls.lock().remove(&(origin.to_string(), request_id.clone()));
    }

    fn cancel_via(&self, peer: &str) -> usize {
        let calls = self.calls.lock();
        let mut cancelled = 0;
        for call in calls.values().filter(|call| call.via == peer) {
            call.cancelled.store(true, Ordering::Relaxed);
            cancelled += 1;
        }
        cancelled
    }
}

#[derive(Clone)]
pub(crate) struct Inbound {
    services: Arc<Services>,
    outbound: Outbound,
}

impl Inbound {
    pub(crate) fn new(services: Arc<Services>) -> Self {
        Self {
            outbound: Outbound::new(services.clone()),
            services,
        }
    }

    fn local_id(&self) -> &str {
        &self.services.config.node_id
    }

    pub(crate) async fn receive(&self, peer: &str, bytes: &[u8]) {
        let message = match decode(bytes) {
            Ok(message) => message,
            Err(e) => return self.reject_undecodable(peer, e).await,
        };

        match message.routing() {
            Some(header) if header.destination != self.local_id() => {
                let header = header.clone();
                self.relay(peer, header, message).await
            }
            _ => match message {
                OcppMessage::Call(call) => self.handle_call(peer, call).await,
                response => self.handle_response(peer, response),
            },
        }
    }

    /// Answer an undecodable frame if a request id could be recovered from it
    async fn reject_undecodable(&self, peer: &str, error: DecodeError) {
        if error.is_response() {
            warn!("Dropping malformed response from {}: {}", peer, error);
            return;
        }
        let Some(request_id) = error.request_id.clone() else {
            warn!("Dropping undecodable frame from {} ({} bytes): {}", peer, error.raw.len(), error);
            return;
        };

        warn!("Rejecting frame {} from {}: {}", request_id, peer, error);
        let framing = match error.raw.first() {
            Some(b) if crate::ocpp::binary::is_binary_tag(*b) => Framing::Binary,
            _ => Framing::Text,
        };
        let reply = OcppMessage::CallError(
            CallError::new(request_id, error.code, error.reason).in_framing(framing),
        );
        self.reply(&SourceRouting::to(peer), reply).await;
    }

    async fn handle_call(&self, peer: &str, call: Call) {
        let context = CallContext {
            request_id: call.request_id.clone(),
            action: call.action.clone(),
            network_path: call
                .routing
                .as_ref()
                .map(|h| h.network_path.clone())
                .unwrap_or_default(),
            source: peer.to_string(),
        };
        let framing = call.payload.framing();
        let reply_to = self.services.routes.reply_route(&context.network_path, peer);
        stage(&context, Stage::Received);

        let origin = context.origin().to_string();
        let Some(cancelled) = self.services.in_flight.begin(&origin, peer, &call.request_id) else {
            warn!("{} {}: duplicate request id from {}", context.action, context.request_id, origin);
            let reply = OcppMessage::CallError(
                CallError::new(
                    call.request_id,
                    ErrorCode::ProtocolError,
                    "request id is already in flight",
                )
                .in_framing(framing),
            );
            self.reply(&reply_to, reply).await;
            return;
        };

        let dispatched = match self.services.signatures.verify_incoming(
            &call.action,
            Direction::Request,
            &call.payload,
        ) {
            Err(e) => {
                stage(&context, Stage::SignatureRejected);
                warn!("{} {} from {}: {}", context.action, context.request_id, peer, e);
                Dispatched::failure(ErrorCode::SecurityError, e.to_string())
            }
            Ok(()) => {
                stage(&context, Stage::SignatureVerified);
                let dispatched = self
                    .services
                    .dispatch
                    .dispatch(context.clone(), &call.payload)
                    .await;
                match &dispatched {
                    Dispatched::Failure {
                        code: ErrorCode::FormationViolation,
                        ..
                    } => stage(&context, Stage::CouldNotParse),
                    _ => stage(&context, Stage::Dispatched),
                }
                dispatched
            }
        };

        self.services.in_flight.finish(&origin, &call.request_id);
        if cancelled.load(Ordering::Relaxed) {
            debug!(
                "{} {}: {} went away, discarding response",
                context.action, context.request_id, peer
            );
            return;
        }

        let reply = self.outbound.build_reply(&context, framing, dispatched);
        stage(&context, Stage::ResponseReady);
        if self.reply(&reply_to, reply).await {
            stage(&context, Stage::Sent);
        }
    }

    fn handle_response(&self, peer: &str, message: OcppMessage) {
        let request_id = message.request_id().clone();
        let Some(action) = self.services.correlator.pending_action(&request_id) else {
            warn!("Dropping orphaned {} {} from {}", message.kind(), request_id, peer);
            return;
        };

        if let OcppMessage::CallResult(result) = &message {
            if let Err(e) = self.services.signatures.verify_incoming(
                &action,
                Direction::Response,
                &result.payload,
            ) {
                warn!("{} response {} from {} rejected: {}", action, request_id, peer, e);
                let error = CallError::new(request_id.clone(), ErrorCode::SecurityError, e.to_string());
                self.services
                    .correlator
                    .resolve(&request_id, Outcome::Error(error));
                return;
            }
        }

        self.services.correlator.receive(message);
    }

    /// Pass a message on towards its destination
    async fn relay(&self, peer: &str, header: RoutingHeader, mut message: OcppMessage) {
        let failure = match self.services.routes.forward(&header) {
            Ok(route) => {
                debug!(
                    "Relaying {} {} from {} to {} via {}",
                    message.kind(),
                    message.request_id(),
                    peer,
                    header.destination,
                    route.next_hop.peer_id()
                );
                message.set_routing(route.header);
                let report = self.services.reporter.transmit(&route.next_hop, &message).await;
                if report.result.is_delivered() {
                    return;
                }
                format!("next hop {} unreachable: {}", report.next_hop, report.result)
            }
            Err(e) => e.to_string(),
        };

        let call = match message {
            OcppMessage::Call(call) => call,
            response => {
                warn!("Dropping unroutable {} {}: {}", response.kind(), response.request_id(), failure);
                return;
            }
        };

        warn!("Cannot relay {} {} to {}: {}", call.action, call.request_id, header.destination, failure);
        let reply_to = self.services.routes.reply_route(&header.network_path, peer);
        let reply = OcppMessage::CallError(
            CallError::new(call.request_id, ErrorCode::RoutingError, failure)
                .in_framing(call.payload.framing()),
        );
        self.reply(&reply_to, reply).await;
    }

    pub(crate) fn connection_closed(&self, peer: &str, connection: ConnectionId) {
        let current = self.services.connections.remove_if(peer, connection);
        let requests = self.services.correlator.close_connection(peer, connection);

        if !current {
            debug!(
                "{}: replaced connection to {} closed ({} requests failed)",
                self.local_id(),
                peer,
                requests
            );
            return;
        }

        let calls = self.services.in_flight.cancel_via(peer);
        debug!(
            "{}: {} closed ({} requests failed, {} inbound calls cancelled)",
            self.local_id(),
            peer,
            requests,
            calls
        );
    }

    /// Send a reply, logging failures. Returns whether it left this node.
    async fn reply(&self, reply_to: &SourceRouting, message: OcppMessage) -> bool {
        let request_id = message.request_id().clone();
        match self.outbound.send_reply(reply_to, message).await {
            Ok(report) => report.result.is_delivered(),
            Err(e) => {
                warn!("Reply to {} could not be sent: {}", request_id, e);
                false
            }
        }
    }
}

fn stage(context: &CallContext, stage: Stage) {
    debug!(
        "{} {} from {}: {}",
        context.action, context.request_id, context.source, stage
    );
}
