//! Inbound CALL dispatch
//!
//! - `router`: action registry and subscriber fan-out
//!
//! Message schemas plug in through [`OcppRequest`] / [`OcppResponse`].
//! Subscribers receive the parsed request together with its [`CallContext`]
//! and either answer with a [`Reply::Respond`] or step aside with
//! [`Reply::Abstain`].

pub mod router;

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::ocpp::{ErrorCode, Payload, RequestId};
use crate::routing::{NetworkPath, NodeId};

pub use router::{DispatchRouter, SubscriptionId};

/// A response schema
pub trait OcppResponse: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn to_payload(&self) -> Result<Payload, serde_json::Error> {
        Payload::json(self)
    }

    fn from_payload(payload: &Payload) -> Result<Self, serde_json::Error> {
        payload.parse_json()
    }
}

/// A request schema, bound to its action name and response type
pub trait OcppRequest: Serialize + DeserializeOwned + Send + Sync + 'static {
    const ACTION: &'static str;

    type Response: OcppResponse;

    /// Parse the payload of an inbound CALL. The network path it arrived on is
    /// available to schemas that care where a request came from.
    fn from_payload(payload: &Payload, _network_path: &NetworkPath) -> Result<Self, serde_json::Error> {
        payload.parse_json()
    }

    fn to_payload(&self) -> Result<Payload, serde_json::Error> {
        Payload::json(self)
    }
}

/// Where an inbound CALL came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub request_id: RequestId,
    pub action: String,
    /// Relay chain the request traversed, empty for direct connections
    pub network_path: NetworkPath,
    /// Peer the request arrived from
    pub source: NodeId,
}

impl CallContext {
    /// Node that originated the request
    pub fn origin(&self) -> &str {
        self.network_path
            .origin()
            .map(String::as_str)
            .unwrap_or(&self.source)
    }
}

/// A parsed inbound request, shared by every subscriber
#[derive(Debug)]
pub struct IncomingRequest<R> {
    pub context: CallContext,
    pub request: R,
}

/// A subscriber's answer
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T> {
    Respond(T),
    /// Leave the call to another subscriber
    Abstain,
}

/// A subscriber failed. Reported to the caller as an `InternalError`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// Result of handing a CALL to the registry
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Response(Payload),
    Failure { code: ErrorCode, description: String },
}

impl Dispatched {
    pub fn failure(code: ErrorCode, description: impl Into<String>) -> Self {
        Dispatched::Failure {
            code,
            description: description.into(),
        }
    }
}

/// Registry failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("action {0} is already declared with a different request type")]
    ActionTypeMismatch(String),
}

/// Processing stages of an inbound CALL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    SignatureVerified,
    SignatureRejected,
    Dispatched,
    CouldNotParse,
    ResponseReady,
    Sent,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How subscribers receive a request
pub type SharedRequest<R> = Arc<IncomingRequest<R>>;
