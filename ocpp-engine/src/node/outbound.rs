//! Requests and replies leaving this node

use std::sync::Arc;

use tracing::{debug, warn};

use super::Services;
use crate::correlation::{NextHop, Outcome, PendingResponse, RequestOutcome};
use crate::dispatch::{CallContext, Dispatched, OcppRequest, OcppResponse};
use crate::error::Result;
use crate::ocpp::{
    Call, CallError, CallResult, ErrorCode, Framing, OcppMessage, Payload, RequestId,
};
use crate::reporter::SentMessageReport;
use crate::routing::{NetworkPath, SourceRouting};
use crate::signature::Direction;

/// Originates requests and sends replies
#[derive(Clone)]
pub struct Outbound {
    services: Arc<Services>,
}

impl Outbound {
    pub(crate) fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Send a CALL with a fresh request id. The returned handle resolves once
    /// with the response, a remote error, a timeout or a connection close.
    pub async fn send_request(
        &self,
        destination: &SourceRouting,
        action: &str,
        payload: Payload,
    ) -> Result<PendingResponse> {
        self.send_request_with_id(destination, RequestId::generate(), action, payload)
            .await
    }

    /// Send a CALL under a caller-chosen request id
    pub async fn send_request_with_id(
        &self,
        destination: &SourceRouting,
        request_id: RequestId,
        action: &str,
        payload: Payload,
    ) -> Result<PendingResponse> {
        let services = &self.services;
        let payload = services
            .signatures
            .sign_outgoing(action, Direction::Request, payload)?;
        let route = services.routes.resolve(destination, &NetworkPath::empty())?;

        let mut pending = services.correlator.register(
            request_id.clone(),
            action,
            NextHop::new(route.next_hop.peer_id(), route.connection),
            services.config.request_timeout,
        )?;

        let mut call = Call::with_request_id(request_id.clone(), action, payload);
        call.routing = route.header;
        let message = OcppMessage::Call(call);

        let report = services.reporter.transmit(&route.next_hop, &message).await;
        if !report.result.is_delivered() {
            services
                .correlator
                .resolve(&request_id, Outcome::SendFailed(report.result.clone()));
        }
        pending.set_sent(report.result);
        Ok(pending)
    }

    /// Send a CALL and wait for its outcome
    pub async fn call(
        &self,
        destination: &SourceRouting,
        action: &str,
        payload: Payload,
    ) -> Result<RequestOutcome> {
        Ok(self.send_request(destination, action, payload).await?.await)
    }

    /// Send a typed request and parse the typed response
    pub async fn request<R: OcppRequest>(
        &self,
        destination: &SourceRouting,
        request: &R,
    ) -> Result<Outcome<R::Response>> {
        let outcome = self.call(destination, R::ACTION, request.to_payload()?).await?;

        Ok(outcome.and_then(|result| match R::Response::from_payload(&result.payload) {
            Ok(response) => Outcome::Response(response),
            Err(e) => {
                warn!("{} response {} does not parse: {}", R::ACTION, result.request_id, e);
                Outcome::Error(CallError::new(
                    result.request_id,
                    ErrorCode::FormationViolation,
                    e.to_string(),
                ))
            }
        }))
    }

    /// Turn a dispatch result into the reply message for `context`
    pub(crate) fn build_reply(
        &self,
        context: &CallContext,
        framing: Framing,
        dispatched: Dispatched,
    ) -> OcppMessage {
        match dispatched {
            Dispatched::Response(payload) => {
                let payload = match (framing, payload) {
                    (Framing::Binary, Payload::Json(value)) => match serde_json::to_vec(&value) {
                        Ok(bytes) => Payload::Binary(bytes),
                        Err(e) => return self.error_reply(context, framing, ErrorCode::InternalError, e.to_string()),
                    },
                    (_, payload) => payload,
                };

                match self
                    .services
                    .signatures
                    .sign_outgoing(&context.action, Direction::Response, payload)
                {
                    Ok(payload) => {
                        OcppMessage::CallResult(CallResult::new(context.request_id.clone(), payload))
                    }
                    Err(e) => {
                        warn!("{} {}: could not sign response: {}", context.action, context.request_id, e);
                        self.error_reply(context, framing, ErrorCode::SecurityError, e.to_string())
                    }
                }
            }
            Dispatched::Failure { code, description } => {
                self.error_reply(context, framing, code, description)
            }
        }
    }

    fn error_reply(
        &self,
        context: &CallContext,
        framing: Framing,
        code: ErrorCode,
        description: String,
    ) -> OcppMessage {
        OcppMessage::CallError(
            CallError::new(context.request_id.clone(), code, description).in_framing(framing),
        )
    }

    /// Address a reply along `reply_to` and transmit it
    pub(crate) async fn send_reply(
        &self,
        reply_to: &SourceRouting,
        mut message: OcppMessage,
    ) -> Result<SentMessageReport> {
        let route = self
            .services
            .routes
            .resolve(reply_to, &NetworkPath::empty())?;
        message.set_routing(route.header);

        debug!(
            "Replying to {} via {}",
            message.request_id(),
            route.next_hop.peer_id()
        );
        Ok(self.services.reporter.transmit(&route.next_hop, &message).await)
    }
}
