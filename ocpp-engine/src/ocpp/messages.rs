//! OCPP-J message framing
//!
//! OCPP exchanges three kinds of messages over a bidirectional connection:
//! - CALL: [2, requestId, action, payload]
//! - CALLRESULT: [3, requestId, payload]
//! - CALLERROR: [4, requestId, errorCode, errorDescription, errorDetails]
//!
//! Messages relayed through networking nodes carry one extra trailing element,
//! the [`RoutingHeader`]. The same logical messages can also travel in the
//! length-prefixed binary framing implemented in [`super::binary`]; [`decode`]
//! sniffs the first byte to pick the right decoder.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use super::binary;
use crate::routing::{NetworkPath, NodeId};
use crate::transport::Frame;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    /// Map a numeric wire identifier to a message type
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }
}

/// Framing a message travels in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    Text,
    Binary,
}

/// Wire-level message kind: the three message types in both framings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Call,
    CallResult,
    CallError,
    BinaryCall,
    BinaryCallResult,
    BinaryCallError,
}

impl MessageKind {
    fn new(message_type: MessageType, framing: Framing) -> Self {
        match (message_type, framing) {
            (MessageType::Call, Framing::Text) => MessageKind::Call,
            (MessageType::CallResult, Framing::Text) => MessageKind::CallResult,
            (MessageType::CallError, Framing::Text) => MessageKind::CallError,
            (MessageType::Call, Framing::Binary) => MessageKind::BinaryCall,
            (MessageType::CallResult, Framing::Binary) => MessageKind::BinaryCallResult,
            (MessageType::CallError, Framing::Binary) => MessageKind::BinaryCallError,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Error taxonomy
// ============================================================================

/// Error codes carried by CALLERROR messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(alias = "FormatViolation")]
    FormationViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
    Timeout,
    RoutingError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::RoutingError => "RoutingError",
        }
    }

    /// Parse a wire error code, falling back to `GenericError` for unknown codes
    pub fn from_wire(code: &str) -> Self {
        serde_json::from_value(Value::String(code.to_string())).unwrap_or(ErrorCode::GenericError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while decoding a frame.
///
/// Carries the offending raw bytes plus whatever could still be recovered
/// from them, so the receiver can answer with a CALLERROR keyed by the
/// original request id.
#[derive(Debug, Clone, Error)]
#[error("{code}: {reason}")]
pub struct DecodeError {
    pub code: ErrorCode,
    pub reason: String,
    pub request_id: Option<RequestId>,
    pub message_type: Option<i64>,
    pub raw: Vec<u8>,
}

impl DecodeError {
    pub fn new(code: ErrorCode, raw: &[u8], reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            request_id: None,
            message_type: None,
            raw: raw.to_vec(),
        }
    }

    pub fn formation(raw: &[u8], reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::FormationViolation, raw, reason)
    }

    pub fn with_request_id(mut self, request_id: Option<RequestId>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_message_type(mut self, message_type: Option<i64>) -> Self {
        self.message_type = message_type;
        self
    }

    /// Whether the undecodable frame looked like a response.
    /// Responses are never answered, even when they are malformed.
    pub fn is_response(&self) -> bool {
        matches!(self.message_type, Some(3) | Some(4))
    }
}

/// Errors raised while encoding a message
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("field of {0} bytes cannot be length-prefixed")]
    FieldTooLarge(usize),

    #[error("{0} routing entries do not fit a binary frame")]
    TooManyEntries(usize),

    #[error("binary payload of {0} bytes cannot be carried in a text frame")]
    BinaryInTextFrame(usize),
}

// ============================================================================
// Message building blocks
// ============================================================================

/// Correlation token assigned by the initiator and echoed by every response
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random request id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Message payload: a JSON object for text framing, an opaque blob for binary framing
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary(Vec<u8>),
}

impl Payload {
    /// Empty JSON object payload, `{}`
    pub fn empty() -> Self {
        Payload::Json(Value::Object(Map::new()))
    }

    /// Serialize any value into a JSON payload
    pub fn json(value: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    pub fn framing(&self) -> Framing {
        match self {
            Payload::Json(_) => Framing::Text,
            Payload::Binary(_) => Framing::Binary,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Binary(_) => None,
        }
    }

    /// Parse a JSON payload as a specific message type
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Payload::Json(value) => serde_json::from_value(value.clone()),
            Payload::Binary(bytes) => serde_json::from_slice(bytes),
        }
    }
}

/// Routing header attached to messages that travel through networking nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingHeader {
    /// Final destination of the message
    pub destination: NodeId,
    /// Relay chain traversed so far, oldest first
    #[serde(default)]
    pub network_path: NetworkPath,
    /// Explicit hops to traverse, ending at the destination
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_route: Vec<NodeId>,
}

impl RoutingHeader {
    pub fn new(destination: impl Into<NodeId>) -> Self {
        Self {
            destination: destination.into(),
            network_path: NetworkPath::empty(),
            source_route: Vec::new(),
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub request_id: RequestId,
    pub action: String,
    pub payload: Payload,
    pub routing: Option<RoutingHeader>,
}

impl Call {
    /// Create a new CALL message with an auto-generated request id
    pub fn new(action: impl Into<String>, payload: Payload) -> Self {
        Self::with_request_id(RequestId::generate(), action, payload)
    }

    pub fn with_request_id(
        request_id: RequestId,
        action: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            request_id,
            action: action.into(),
            payload,
            routing: None,
        }
    }

    pub fn routed(mut self, routing: RoutingHeader) -> Self {
        self.routing = Some(routing);
        self
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub request_id: RequestId,
    pub payload: Payload,
    pub routing: Option<RoutingHeader>,
}

impl CallResult {
    pub fn new(request_id: RequestId, payload: Payload) -> Self {
        Self {
            request_id,
            payload,
            routing: None,
        }
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        self.payload.parse_json()
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub request_id: RequestId,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
    pub framing: Framing,
    pub routing: Option<RoutingHeader>,
}

impl CallError {
    /// Create a new CALLERROR message with empty details
    pub fn new(
        request_id: RequestId,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Map::new()),
            framing: Framing::Text,
            routing: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }

    pub fn in_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Decode a frame in either framing
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode(bytes)
    }

    /// Get the request id
    pub fn request_id(&self) -> &RequestId {
        match self {
            OcppMessage::Call(c) => &c.request_id,
            OcppMessage::CallResult(r) => &r.request_id,
            OcppMessage::CallError(e) => &e.request_id,
        }
    }

    pub fn action(&self) -> Option<&str> {
        match self {
            OcppMessage::Call(c) => Some(&c.action),
            _ => None,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            OcppMessage::Call(_) => MessageType::Call,
            OcppMessage::CallResult(_) => MessageType::CallResult,
            OcppMessage::CallError(_) => MessageType::CallError,
        }
    }

    pub fn framing(&self) -> Framing {
        match self {
            OcppMessage::Call(c) => c.payload.framing(),
            OcppMessage::CallResult(r) => r.payload.framing(),
            OcppMessage::CallError(e) => e.framing,
        }
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::new(self.message_type(), self.framing())
    }

    pub fn routing(&self) -> Option<&RoutingHeader> {
        match self {
            OcppMessage::Call(c) => c.routing.as_ref(),
            OcppMessage::CallResult(r) => r.routing.as_ref(),
            OcppMessage::CallError(e) => e.routing.as_ref(),
        }
    }

    pub fn set_routing(&mut self, routing: Option<RoutingHeader>) {
        match self {
            OcppMessage::Call(c) => c.routing = routing,
            OcppMessage::CallResult(r) => r.routing = routing,
            OcppMessage::CallError(e) => e.routing = routing,
        }
    }

    /// Serialize to wire bytes in the message's own framing
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        match self.framing() {
            Framing::Text => Ok(self.encode_text()?.into_bytes()),
            Framing::Binary => binary::encode(self),
        }
    }

    /// Serialize into a transport frame
    pub fn to_frame(&self) -> Result<Frame, EncodeError> {
        match self.framing() {
            Framing::Text => Ok(Frame::Text(self.encode_text()?)),
            Framing::Binary => Ok(Frame::Binary(binary::encode(self)?)),
        }
    }

    fn encode_text(&self) -> Result<String, EncodeError> {
        let mut array = match self {
            OcppMessage::Call(call) => vec![
                Value::from(MessageType::Call.id()),
                Value::String(call.request_id.to_string()),
                Value::String(call.action.clone()),
                text_payload(&call.payload)?,
            ],
            OcppMessage::CallResult(result) => vec![
                Value::from(MessageType::CallResult.id()),
                Value::String(result.request_id.to_string()),
                text_payload(&result.payload)?,
            ],
            OcppMessage::CallError(error) => vec![
                Value::from(MessageType::CallError.id()),
                Value::String(error.request_id.to_string()),
                Value::String(error.error_code.to_string()),
                Value::String(error.error_description.clone()),
                error.error_details.clone(),
            ],
        };

        if let Some(routing) = self.routing() {
            array.push(serde_json::to_value(routing)?);
        }

        Ok(serde_json::to_string(&Value::Array(array))?)
    }
}

fn text_payload(payload: &Payload) -> Result<Value, EncodeError> {
    match payload {
        Payload::Json(value) => Ok(value.clone()),
        Payload::Binary(bytes) => Err(EncodeError::BinaryInTextFrame(bytes.len())),
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a frame, sniffing the framing from its first structural byte
pub fn decode(bytes: &[u8]) -> Result<OcppMessage, DecodeError> {
    if let Some(first) = bytes.first() {
        if binary::is_binary_tag(*first) {
            return binary::decode(bytes);
        }
    }

    match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'[') => decode_text(bytes),
        Some(_) => Err(DecodeError::formation(bytes, "unrecognised framing")),
        None => Err(DecodeError::formation(bytes, "empty frame")),
    }
}

fn decode_text(raw: &[u8]) -> Result<OcppMessage, DecodeError> {
    let array: Vec<Value> = serde_json::from_slice(raw)
        .map_err(|e| DecodeError::formation(raw, format!("invalid JSON array: {}", e)))?;

    // Best effort, so that even a malformed CALL can be answered
    let recovered_id = array
        .get(1)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(RequestId::from);
    let type_id = array.first().and_then(Value::as_i64);
    let fail = |code: ErrorCode, reason: String| {
        DecodeError::new(code, raw, reason)
            .with_request_id(recovered_id.clone())
            .with_message_type(type_id)
    };

    let type_id = type_id.ok_or_else(|| {
        fail(ErrorCode::FormationViolation, "missing message type id".into())
    })?;
    let message_type = MessageType::from_id(type_id).ok_or_else(|| {
        fail(ErrorCode::ProtocolError, format!("unknown message type {}", type_id))
    })?;

    let base_arity = match message_type {
        MessageType::Call => 4,
        MessageType::CallResult => 3,
        MessageType::CallError => 5,
    };
    let routing = match array.len() {
        n if n == base_arity => None,
        n if n == base_arity + 1 => Some(
            serde_json::from_value::<RoutingHeader>(array[base_arity].clone()).map_err(|e| {
                fail(ErrorCode::FormationViolation, format!("invalid routing header: {}", e))
            })?,
        ),
        n => {
            return Err(fail(
                ErrorCode::FormationViolation,
                format!("{:?} expects {} elements, got {}", message_type, base_arity, n),
            ))
        }
    };

    let request_id = recovered_id.clone().ok_or_else(|| {
        fail(ErrorCode::FormationViolation, "request id must be a non-empty string".into())
    })?;

    let object_payload = |value: &Value| -> Result<Payload, DecodeError> {
        if value.is_object() {
            Ok(Payload::Json(value.clone()))
        } else {
            Err(fail(ErrorCode::FormationViolation, "payload must be a JSON object".into()))
        }
    };

    match message_type {
        MessageType::Call => {
            let action = array[2]
                .as_str()
                .filter(|action| !action.is_empty())
                .ok_or_else(|| {
                    fail(ErrorCode::FormationViolation, "action must be a non-empty string".into())
                })?
                .to_string();

            Ok(OcppMessage::Call(Call {
                request_id,
                action,
                payload: object_payload(&array[3])?,
                routing,
            }))
        }
        MessageType::CallResult => Ok(OcppMessage::CallResult(CallResult {
            request_id,
            payload: object_payload(&array[2])?,
            routing,
        })),
        MessageType::CallError => {
            let error_code = array[2].as_str().map(ErrorCode::from_wire).ok_or_else(|| {
                fail(ErrorCode::FormationViolation, "error code must be a string".into())
            })?;
            let error_description = array[3]
                .as_str()
                .ok_or_else(|| {
                    fail(ErrorCode::FormationViolation, "error description must be a string".into())
                })?
                .to_string();

            Ok(OcppMessage::CallError(CallError {
                request_id,
                error_code,
                error_description,
                error_details: array[4].clone(),
                framing: Framing::Text,
                routing,
            }))
        }
    }
}
