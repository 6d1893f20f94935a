//! Engine-level errors

use thiserror::Error;

use crate::correlation::DuplicateRequestId;
use crate::dispatch::RegistryError;
use crate::ocpp::{EncodeError, ErrorCode};
use crate::routing::RoutingError;
use crate::signature::SigningError;

/// Errors returned before a message leaves this node
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("routing failed: {0}")]
    Routing(#[from] RoutingError),

    #[error("signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error(transparent)]
    DuplicateRequestId(#[from] DuplicateRequestId),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),
}

impl EngineError {
    /// The CALLERROR code a peer would see for this failure
    pub fn error_code(&self) -> ErrorCode {
        match self {
            EngineError::Routing(_) => ErrorCode::RoutingError,
            EngineError::Signing(_) => ErrorCode::SecurityError,
            EngineError::DuplicateRequestId(_) => ErrorCode::ProtocolError,
            EngineError::Registry(_) => ErrorCode::InternalError,
            EngineError::Payload(_) => ErrorCode::FormationViolation,
            EngineError::Encode(_) => ErrorCode::InternalError,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
