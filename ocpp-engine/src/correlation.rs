//! Request/response correlation
//!
//! Every outgoing CALL registers a pending request keyed by its request id.
//! The entry is resolved exactly once, by whichever comes first:
//! - a matching CALLRESULT or CALLERROR
//! - the request timeout
//! - the connection it was sent over closing
//! - a failed transmission
//! - cancellation through the request's [`CancelToken`]
//!
//! Resolution removes the entry under the table lock and consumes its
//! oneshot sender, so a second resolution finds nothing to resolve.
//! Responses whose request id is not pending are logged and dropped: late
//! and duplicate responses are expected with retrying transports.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::ocpp::{CallError, CallResult, ErrorCode, OcppMessage, RequestId};
use crate::reporter::SentMessageResult;
use crate::routing::{ConnectionId, NodeId};

/// How a request ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The peer answered with a CALLRESULT
    Response(T),
    /// The peer (or a relay) answered with a CALLERROR
    Error(CallError),
    /// No answer within the request timeout
    Timeout,
    /// The next-hop connection closed before an answer arrived
    ConnectionClosed,
    /// Cancelled by the caller
    Cancelled,
    /// The request never left this node
    SendFailed(SentMessageResult),
}

/// Outcome of an untyped request
pub type RequestOutcome = Outcome<CallResult>;

impl<T> Outcome<T> {
    pub fn response(self) -> Option<T> {
        match self {
            Outcome::Response(response) => Some(response),
            _ => None,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Outcome::Response(_))
    }

    /// Error code for failed outcomes, `None` for responses
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Outcome::Response(_) => None,
            Outcome::Error(error) => Some(error.error_code),
            Outcome::Timeout => Some(ErrorCode::Timeout),
            Outcome::ConnectionClosed | Outcome::Cancelled | Outcome::SendFailed(_) => {
                Some(ErrorCode::GenericError)
            }
        }
    }

    /// Transform the response, keeping every other outcome
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Outcome<U>) -> Outcome<U> {
        match self {
            Outcome::Response(response) => f(response),
            Outcome::Error(error) => Outcome::Error(error),
            Outcome::Timeout => Outcome::Timeout,
            Outcome::ConnectionClosed => Outcome::ConnectionClosed,
            Outcome::Cancelled => Outcome::Cancelled,
            Outcome::SendFailed(result) => Outcome::SendFailed(result),
        }
    }
}

/// A caller tried to reuse a request id that is still pending
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("request id {0} is already pending")]
pub struct DuplicateRequestId(pub RequestId);

/// Connection a request leaves through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHop {
    pub peer: NodeId,
    /// `None` binds the request to any connection to `peer`
    pub connection: Option<ConnectionId>,
}

impl NextHop {
    pub fn new(peer: impl Into<NodeId>, connection: ConnectionId) -> Self {
        Self {
            peer: peer.into(),
            connection: Some(connection),
        }
    }

    fn is_carried_by(&self, peer: &str, connection: ConnectionId) -> bool {
        self.peer == peer && self.connection.map_or(true, |c| c == connection)
    }
}

impl From<&str> for NextHop {
    fn from(peer: &str) -> Self {
        NextHop {
            peer: peer.to_string(),
            connection: None,
        }
    }
}

impl From<NodeId> for NextHop {
    fn from(peer: NodeId) -> Self {
        NextHop {
            peer,
            connection: None,
        }
    }
}

/// Pending request awaiting response
struct PendingRequest {
    generation: u64,
    action: String,
    next_hop: NextHop,
    sent_at: Instant,
    response_tx: oneshot::Sender<RequestOutcome>,
    timer: Option<AbortHandle>,
}

impl PendingRequest {
    fn complete(self, outcome: RequestOutcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have dropped its handle; the entry is gone either way
        let _ = self.response_tx.send(outcome);
    }
}

/// Table of outstanding requests
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    generation: AtomicU64,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a request before it is transmitted.
    ///
    /// Spawns the timeout timer, so this must run inside a tokio runtime.
    pub fn register(
        self: &Arc<Self>,
        request_id: RequestId,
        action: impl Into<String>,
        next_hop: impl Into<NextHop>,
        timeout: Duration,
    ) -> Result<PendingResponse, DuplicateRequestId> {
        let (response_tx, response_rx) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let action = action.into();

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&request_id) {
                return Err(DuplicateRequestId(request_id));
            }
            pending.insert(
                request_id.clone(),
                PendingRequest {
                    generation,
                    action: action.clone(),
                    next_hop: next_hop.into(),
                    sent_at: Instant::now(),
                    response_tx,
                    timer: None,
                },
            );
        }

        let correlator = Arc::downgrade(self);
        let timer_id = request_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(correlator) = correlator.upgrade() {
                if correlator.resolve_generation(&timer_id, Some(generation), RequestOutcome::Timeout) {
                    warn!("Request {} timed out after {:?}", timer_id, timeout);
                }
            }
        })
        .abort_handle();

        // Keep the timer only while its request is still pending
        match self.pending.lock().get_mut(&request_id) {
            Some(p) if p.generation == generation => p.timer = Some(timer),
            _ => timer.abort(),
        }

        Ok(PendingResponse {
            request_id: request_id.clone(),
            action,
            sent: None,
            response_rx,
            cancel: CancelToken {
                request_id,
                correlator: Arc::downgrade(self),
            },
        })
    }

    /// Route an incoming CALLRESULT or CALLERROR to its waiting caller.
    ///
    /// Returns `false` for orphaned responses and for CALL messages.
    pub fn receive(&self, message: OcppMessage) -> bool {
        match message {
            OcppMessage::CallResult(result) => {
                let request_id = result.request_id.clone();
                self.resolve_or_orphan(&request_id, RequestOutcome::Response(result))
            }
            OcppMessage::CallError(error) => {
                let request_id = error.request_id.clone();
                self.resolve_or_orphan(&request_id, RequestOutcome::Error(error))
            }
            OcppMessage::Call(call) => {
                warn!("CALL {} handed to the correlator, ignoring", call.request_id);
                false
            }
        }
    }

    /// Resolve a pending request. Returns `false` if it was not pending.
    pub fn resolve(&self, request_id: &RequestId, outcome: RequestOutcome) -> bool {
        self.resolve_generation(request_id, None, outcome)
    }

    /// Action of a pending request
    pub fn pending_action(&self, request_id: &RequestId) -> Option<String> {
        self.pending.lock().get(request_id).map(|p| p.action.clone())
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.pending.lock().contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Cancel a pending request
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        self.resolve(request_id, RequestOutcome::Cancelled)
    }

    /// Resolve every request sent over `connection` to `peer` as connection-closed.
    /// Requests sent over a newer connection to the same peer stay pending.
    pub fn close_connection(&self, peer: &str, connection: ConnectionId) -> usize {
        let closed: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, p)| p.next_hop.is_carried_by(peer, connection))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = closed.len();
        for request in closed {
            request.complete(RequestOutcome::ConnectionClosed);
        }
        if count > 0 {
            warn!("Connection to {} closed with {} requests pending", peer, count);
        }
        count
    }

    fn resolve_or_orphan(&self, request_id: &RequestId, outcome: RequestOutcome) -> bool {
        let resolved = self.resolve(request_id, outcome);
        if !resolved {
            warn!("Dropping orphaned response {}", request_id);
        }
        resolved
    }

    fn resolve_generation(
        &self,
        request_id: &RequestId,
        generation: Option<u64>,
        outcome: RequestOutcome,
    ) -> bool {
        let request = {
            let mut pending = self.pending.lock();
            match pending.get(request_id) {
                Some(p) if generation.map_or(true, |g| g == p.generation) => pending.remove(request_id),
                _ => None,
            }
        };

        let Some(request) = request else {
            return false;
        };

        debug!(
            "Request {} ({} via {}) resolved after {:?}",
            request_id,
            request.action,
            request.next_hop.peer,
            request.sent_at.elapsed()
        );
        request.complete(outcome);
        true
    }
}

/// Cancellation handle for one pending request
#[derive(Debug, Clone)]
pub struct CancelToken {
    request_id: RequestId,
    correlator: Weak<Correlator>,
}

impl CancelToken {
    /// Resolve the request as cancelled. Returns `false` if it already resolved.
    pub fn cancel(&self) -> bool {
        self.correlator
            .upgrade()
            .map_or(false, |correlator| correlator.cancel(&self.request_id))
    }
}

/// Handle to a request in flight. Resolves to its [`RequestOutcome`].
pub struct PendingResponse {
    request_id: RequestId,
    action: String,
    sent: Option<SentMessageResult>,
    response_rx: oneshot::Receiver<RequestOutcome>,
    cancel: CancelToken,
}

impl PendingResponse {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    /// How the transmission itself went. Informational only: the request
    /// still resolves through the response, timeout or connection close.
    pub fn sent(&self) -> Option<&SentMessageResult> {
        self.sent.as_ref()
    }

    pub(crate) fn set_sent(&mut self, result: SentMessageResult) {
        self.sent = Some(result);
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

impl Future for PendingResponse {
    type Output = RequestOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the correlator itself went away
        Pin::new(&mut self.response_rx)
            .poll(cx)
            .map(|result| result.unwrap_or(RequestOutcome::ConnectionClosed))
    }
}
