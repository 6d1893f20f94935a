//! Binary framing for OCPP messages
//!
//! Carries the same logical fields as the JSON array framing, for payloads
//! that must be transferred byte-exact (opaque signed blobs, firmware chunks).
//!
//! # Layout
//!
//! ```text
//! [tag: 1 byte]                      0x80 | message type id (0x82, 0x83, 0x84)
//! [request_id: str]
//! CALL:       [action: str] [payload: bytes]
//! CALLRESULT: [payload: bytes]
//! CALLERROR:  [error_code: str] [description: str] [details: bytes (JSON)]
//! [routing_flag: 1 byte]             0 = none, 1 = routing header follows
//!   [destination: str]
//!   [source_route_count: u16] [hop: str]*
//!   [network_path_count: u16] [hop: str]*
//! ```
//!
//! `str` and `bytes` fields are prefixed with their length as a little-endian
//! `u32`. Trailing bytes after the last field are rejected.

use std::io::{Cursor, Read};

use serde_json::Value;

use super::messages::*;
use crate::routing::{NetworkPath, NodeId};

/// Maximum binary frame size: 1 MiB
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const BINARY_FLAG: u8 = 0x80;

/// Whether `byte` opens a binary frame
pub fn is_binary_tag(byte: u8) -> bool {
    byte & BINARY_FLAG != 0 && MessageType::from_id((byte & !BINARY_FLAG) as i64).is_some()
}

/// Serialize a message into binary framing
pub fn encode(message: &OcppMessage) -> Result<Vec<u8>, EncodeError> {
    let mut buffer = Vec::with_capacity(256);
    buffer.push(BINARY_FLAG | message.message_type().id());
    write_str(&mut buffer, message.request_id().as_str())?;

    match message {
        OcppMessage::Call(call) => {
            write_str(&mut buffer, &call.action)?;
            write_bytes(&mut buffer, &payload_bytes(&call.payload)?)?;
        }
        OcppMessage::CallResult(result) => {
            write_bytes(&mut buffer, &payload_bytes(&result.payload)?)?;
        }
        OcppMessage::CallError(error) => {
            write_str(&mut buffer, error.error_code.as_str())?;
            write_str(&mut buffer, &error.error_description)?;
            write_bytes(&mut buffer, &serde_json::to_vec(&error.error_details)?)?;
        }
    }

    match message.routing() {
        None => buffer.push(0),
        Some(routing) => {
            buffer.push(1);
            write_str(&mut buffer, &routing.destination)?;
            write_list(&mut buffer, &routing.source_route)?;
            write_list(&mut buffer, routing.network_path.hops())?;
        }
    }

    if buffer.len() > MAX_FRAME_SIZE {
        return Err(EncodeError::FrameTooLarge {
            size: buffer.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    Ok(buffer)
}

/// Deserialize a binary frame
pub fn decode(raw: &[u8]) -> Result<OcppMessage, DecodeError> {
    if raw.len() > MAX_FRAME_SIZE {
        return Err(DecodeError::formation(raw, format!("frame of {} bytes is too large", raw.len())));
    }

    let mut reader = FrameReader::new(raw);
    let tag = reader.u8()?;
    let type_id = (tag & !BINARY_FLAG) as i64;
    let message_type = MessageType::from_id(type_id).ok_or_else(|| {
        DecodeError::new(ErrorCode::ProtocolError, raw, format!("unknown binary tag {:#04x}", tag))
            .with_message_type(Some(type_id))
    })?;

    let request_id = reader.string().ok().filter(|id| !id.is_empty()).map(RequestId::from);
    let annotate = |error: DecodeError| {
        error
            .with_request_id(request_id.clone())
            .with_message_type(Some(type_id))
    };
    let request_id = request_id
        .clone()
        .ok_or_else(|| annotate(DecodeError::formation(raw, "request id must be non-empty")))?;

    let message = match message_type {
        MessageType::Call => {
            let action = reader.string().map_err(annotate)?;
            if action.is_empty() {
                return Err(annotate(DecodeError::formation(raw, "action must be non-empty")));
            }
            let payload = Payload::Binary(reader.bytes().map_err(annotate)?);
            let routing = reader.routing().map_err(annotate)?;
            OcppMessage::Call(Call {
                request_id,
                action,
                payload,
                routing,
            })
        }
        MessageType::CallResult => {
            let payload = Payload::Binary(reader.bytes().map_err(annotate)?);
            let routing = reader.routing().map_err(annotate)?;
            OcppMessage::CallResult(CallResult {
                request_id,
                payload,
                routing,
            })
        }
        MessageType::CallError => {
            let error_code = ErrorCode::from_wire(&reader.string().map_err(annotate)?);
            let error_description = reader.string().map_err(annotate)?;
            let details = reader.bytes().map_err(annotate)?;
            let error_details: Value = serde_json::from_slice(&details).map_err(|e| {
                annotate(DecodeError::formation(raw, format!("invalid error details: {}", e)))
            })?;
            let routing = reader.routing().map_err(annotate)?;
            OcppMessage::CallError(CallError {
                request_id,
                error_code,
                error_description,
                error_details,
                framing: Framing::Binary,
                routing,
            })
        }
    };

    reader.finish().map_err(annotate)?;
    Ok(message)
}

fn payload_bytes(payload: &Payload) -> Result<Vec<u8>, EncodeError> {
    match payload {
        Payload::Binary(bytes) => Ok(bytes.clone()),
        Payload::Json(value) => Ok(serde_json::to_vec(value)?),
    }
}

fn write_bytes(buffer: &mut Vec<u8>, bytes: &[u8]) -> Result<(), EncodeError> {
    let len = u32::try_from(bytes.len()).map_err(|_| EncodeError::FieldTooLarge(bytes.len()))?;
    buffer.extend_from_slice(&len.to_le_bytes());
    buffer.extend_from_slice(bytes);
    Ok(())
}

fn write_str(buffer: &mut Vec<u8>, value: &str) -> Result<(), EncodeError> {
    write_bytes(buffer, value.as_bytes())
}

fn write_list(buffer: &mut Vec<u8>, hops: &[NodeId]) -> Result<(), EncodeError> {
    let count = u16::try_from(hops.len()).map_err(|_| EncodeError::TooManyEntries(hops.len()))?;
    buffer.extend_from_slice(&count.to_le_bytes());
    for hop in hops {
        write_str(buffer, hop)?;
    }
    Ok(())
}

/// Cursor over a binary frame that turns every short read into a formation violation
struct FrameReader<'a> {
    raw: &'a [u8],
    cursor: Cursor<&'a [u8]>,
}

impl<'a> FrameReader<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Self {
            raw,
            cursor: Cursor::new(raw),
        }
    }

    fn exact<const N: usize>(&mut self, field: &str) -> Result<[u8; N], DecodeError> {
        let mut buf = [0u8; N];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| DecodeError::formation(self.raw, format!("truncated {}", field)))?;
        Ok(buf)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.exact::<1>("tag")?[0])
    }

    fn bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = u32::from_le_bytes(self.exact::<4>("length prefix")?) as usize;
        let remaining = self.raw.len() - self.cursor.position() as usize;
        if len > remaining {
            return Err(DecodeError::formation(
                self.raw,
                format!("field of {} bytes overruns frame ({} left)", len, remaining),
            ));
        }
        let mut buf = vec![0u8; len];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| DecodeError::formation(self.raw, "truncated field"))?;
        Ok(buf)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes).map_err(|_| DecodeError::formation(self.raw, "field is not UTF-8"))
    }

    fn list(&mut self) -> Result<Vec<NodeId>, DecodeError> {
        let count = u16::from_le_bytes(self.exact::<2>("list count")?);
        (0..count).map(|_| self.string()).collect()
    }

    fn routing(&mut self) -> Result<Option<RoutingHeader>, DecodeError> {
        match self.exact::<1>("routing flag")?[0] {
            0 => Ok(None),
            1 => {
                let destination = self.string()?;
                let source_route = self.list()?;
                let network_path = NetworkPath::from_hops(self.list()?);
                Ok(Some(RoutingHeader {
                    destination,
                    network_path,
                    source_route,
                }))
            }
            flag => Err(DecodeError::formation(self.raw, format!("invalid routing flag {}", flag))),
        }
    }

    fn finish(&self) -> Result<(), DecodeError> {
        let consumed = self.cursor.position() as usize;
        if consumed == self.raw.len() {
            Ok(())
        } else {
            Err(DecodeError::formation(
                self.raw,
                format!("{} trailing bytes", self.raw.len() - consumed),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_binary_call_roundtrip() {
        let call = Call::with_request_id("b-1".into(), "SignedFirmware", Payload::Binary(vec![0, 1, 2, 0xff]));
        let message = OcppMessage::Call(call);

        let bytes = encode(&message).unwrap();
        assert_eq!(bytes[0], 0x82);
        assert_eq!(message.kind(), MessageKind::BinaryCall);
        assert_eq!(decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_binary_error_with_routing() {
        let mut header = RoutingHeader::new("CS001");
        header.source_route = vec!["NN1".into(), "CS001".into()];
        header.network_path = NetworkPath::from_hops(["CSMS"]);
        let error = CallError::new("b-2".into(), ErrorCode::SecurityError, "bad signature")
            .with_details(json!({"keyId": "k1"}))
            .in_framing(Framing::Binary);
        let mut message = OcppMessage::CallError(error);
        message.set_routing(Some(header));

        let bytes = message.encode().unwrap();
        assert_eq!(bytes[0], 0x84);
        assert_eq!(OcppMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_truncated_frame_keeps_request_id() {
        let message = OcppMessage::CallResult(CallResult::new("b-3".into(), Payload::Binary(vec![9; 16])));
        let bytes = encode(&message).unwrap();

        let err = decode(&bytes[..bytes.len() - 4]).unwrap_err();
        assert_eq!(err.code, ErrorCode::FormationViolation);
        assert_eq!(err.request_id, Some(RequestId::from("b-3")));
        assert!(err.is_response());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let message = OcppMessage::CallResult(CallResult::new("b-4".into(), Payload::Binary(vec![])));
        let mut bytes = encode(&message).unwrap();
        bytes.push(0);

        let err = decode(&bytes).unwrap_err();
        assert!(err.reason.contains("trailing"));
    }

    #[test]
    fn test_tag_detection() {
        assert!(is_binary_tag(0x82));
        assert!(is_binary_tag(0x84));
        assert!(!is_binary_tag(0x85));
        assert!(!is_binary_tag(b'['));
    }
}
