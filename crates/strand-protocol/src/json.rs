//! JSON codec: UTF-8 JSON frames terminated by the record separator `0x1E`.
//!
//! Handshake frames use this framing as well, regardless of which protocol
//! the handshake selects.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, MAX_FRAME_SIZE};
use crate::messages::{HandshakeRequest, HandshakeResponse, Message, MessageKind};

/// The frame terminator.
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// Flat wire representation of every message type. Absent optional fields
/// are omitted on encode and tolerated in any order on decode.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Envelope {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    item: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

impl From<&Message> for Envelope {
    fn from(message: &Message) -> Self {
        let mut envelope = Envelope {
            kind: message.kind().into(),
            ..Envelope::default()
        };
        match message {
            Message::Invocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                envelope.invocation_id = invocation_id.clone();
                envelope.target = Some(target.clone());
                envelope.arguments = Some(arguments.clone());
                if !stream_ids.is_empty() {
                    envelope.stream_ids = Some(stream_ids.clone());
                }
            }
            Message::StreamItem {
                invocation_id,
                item,
            } => {
                envelope.invocation_id = Some(invocation_id.clone());
                envelope.item = Some(item.clone());
            }
            Message::Completion {
                invocation_id,
                result,
                error,
            } => {
                envelope.invocation_id = Some(invocation_id.clone());
                envelope.result = result.clone();
                envelope.error = error.clone();
            }
            Message::StreamInvocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                envelope.invocation_id = Some(invocation_id.clone());
                envelope.target = Some(target.clone());
                envelope.arguments = Some(arguments.clone());
                if !stream_ids.is_empty() {
                    envelope.stream_ids = Some(stream_ids.clone());
                }
            }
            Message::CancelInvocation { invocation_id } => {
                envelope.invocation_id = Some(invocation_id.clone());
            }
            Message::Ping => {}
            Message::Close {
                error,
                allow_reconnect,
            } => {
                envelope.error = error.clone();
                envelope.allow_reconnect = *allow_reconnect;
            }
        }
        envelope
    }
}

impl Envelope {
    fn into_message(self) -> Result<Message, ProtocolError> {
        let kind =
            MessageKind::try_from(self.kind).map_err(ProtocolError::UnknownMessageType)?;
        let require = |field: Option<String>, name: &'static str| {
            field.ok_or(ProtocolError::MissingField {
                kind: kind.into(),
                field: name,
            })
        };
        Ok(match kind {
            MessageKind::Invocation => Message::Invocation {
                invocation_id: self.invocation_id,
                target: require(self.target, "target")?,
                arguments: self.arguments.unwrap_or_default(),
                stream_ids: self.stream_ids.unwrap_or_default(),
            },
            MessageKind::StreamItem => Message::StreamItem {
                invocation_id: require(self.invocation_id, "invocationId")?,
                item: self.item.unwrap_or(Value::Null),
            },
            MessageKind::Completion => Message::Completion {
                invocation_id: require(self.invocation_id, "invocationId")?,
                result: self.result,
                error: self.error,
            },
            MessageKind::StreamInvocation => Message::StreamInvocation {
                invocation_id: require(self.invocation_id, "invocationId")?,
                target: require(self.target, "target")?,
                arguments: self.arguments.unwrap_or_default(),
                stream_ids: self.stream_ids.unwrap_or_default(),
            },
            MessageKind::CancelInvocation => Message::CancelInvocation {
                invocation_id: require(self.invocation_id, "invocationId")?,
            },
            MessageKind::Ping => Message::Ping,
            MessageKind::Close => Message::Close {
                error: self.error,
                allow_reconnect: self.allow_reconnect,
            },
        })
    }
}

/// Encode a message as one JSON frame.
///
/// # Errors
///
/// Returns an error if serialization fails or the frame is too large.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(&Envelope::from(message))?;
    if payload.len() >= MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.extend_from_slice(&payload);
    buf.put_u8(RECORD_SEPARATOR);
    Ok(buf.freeze())
}

/// Decode one message from a single complete frame (terminator optional).
///
/// # Errors
///
/// Returns an error if the payload is not a valid message.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    let payload = match data.iter().position(|&b| b == RECORD_SEPARATOR) {
        Some(pos) => &data[..pos],
        None => data,
    };
    let envelope: Envelope = serde_json::from_slice(payload)?;
    envelope.into_message()
}

/// Try to decode one message from a buffer, advancing past the frame on
/// success. Returns `Ok(None)` when no complete frame is buffered yet.
///
/// # Errors
///
/// Returns an error if a complete frame fails to parse; the frame is still
/// consumed so the caller can decide whether to continue.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
    let Some(pos) = buf.iter().position(|&b| b == RECORD_SEPARATOR) else {
        if buf.len() >= MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(buf.len()));
        }
        return Ok(None);
    };
    let payload = buf.split_to(pos);
    buf.advance(1);
    let envelope: Envelope = serde_json::from_slice(&payload)?;
    envelope.into_message().map(Some)
}

/// Split the next record-separated frame off a buffer without interpreting
/// it. Used for handshake frames, which precede protocol selection.
pub fn next_text_frame(buf: &mut BytesMut) -> Option<Bytes> {
    let pos = buf.iter().position(|&b| b == RECORD_SEPARATOR)?;
    let payload = buf.split_to(pos).freeze();
    buf.advance(1);
    Some(payload)
}

/// Encode a handshake request frame.
#[must_use]
pub fn encode_handshake_request(request: &HandshakeRequest) -> Bytes {
    frame_json(serde_json::to_vec(request).unwrap_or_else(|_| b"{}".to_vec()))
}

/// Encode a handshake response frame.
#[must_use]
pub fn encode_handshake_response(response: &HandshakeResponse) -> Bytes {
    frame_json(serde_json::to_vec(response).unwrap_or_else(|_| b"{}".to_vec()))
}

/// Parse a handshake request from a raw frame.
///
/// # Errors
///
/// Returns an error if the frame is not a well-formed handshake request.
pub fn parse_handshake_request(frame: &[u8]) -> Result<HandshakeRequest, ProtocolError> {
    Ok(serde_json::from_slice(frame)?)
}

/// Parse a handshake response from a raw frame.
///
/// # Errors
///
/// Returns an error if the frame is not a well-formed handshake response.
pub fn parse_handshake_response(frame: &[u8]) -> Result<HandshakeResponse, ProtocolError> {
    Ok(serde_json::from_slice(frame)?)
}

fn frame_json(mut payload: Vec<u8>) -> Bytes {
    payload.push(RECORD_SEPARATOR);
    Bytes::from(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn all_messages() -> Vec<Message> {
        vec![
            Message::invocation("1", "echo", vec![json!("hi")]),
            Message::send("notify", vec![json!({"a": 1}), json!(2.5)]),
            Message::Invocation {
                invocation_id: Some("3".into()),
                target: "upload".into(),
                arguments: vec![json!(2.0)],
                stream_ids: vec!["s1".into(), "s2".into()],
            },
            Message::stream_item("2", json!("a")),
            Message::completion_result("1", json!("hi")),
            Message::completion_error("1", "boom"),
            Message::completion_done("2"),
            Message::stream_invocation("2", "dateStream", vec![json!(3)]),
            Message::cancel_invocation("2"),
            Message::Ping,
            Message::close(None),
            Message::Close {
                error: Some("bye".into()),
                allow_reconnect: Some(true),
            },
        ]
    }

    #[test]
    fn test_roundtrip_every_message() {
        for message in all_messages() {
            let encoded = encode(&message).unwrap();
            assert_eq!(*encoded.last().unwrap(), RECORD_SEPARATOR);
            let decoded = decode(&encoded).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn test_wire_shape() {
        let encoded = encode(&Message::invocation("1", "echo", vec![json!("hi")])).unwrap();
        let text = std::str::from_utf8(&encoded[..encoded.len() - 1]).unwrap();
        let value: Value = serde_json::from_str(text).unwrap();
        assert_eq!(value["type"], json!(1));
        assert_eq!(value["invocationId"], json!("1"));
        assert_eq!(value["target"], json!("echo"));
        assert_eq!(value["arguments"], json!(["hi"]));
        assert!(value.get("streamIds").is_none());

        let ping = encode(&Message::Ping).unwrap();
        assert_eq!(&ping[..], b"{\"type\":6}\x1e");
    }

    #[test]
    fn test_decode_key_order_and_unknown_fields() {
        let raw = br#"{"arguments":["hi"],"future":true,"target":"echo","type":1}"#;
        let decoded = decode(raw).unwrap();
        assert_eq!(decoded, Message::send("echo", vec![json!("hi")]));
    }

    #[test]
    fn test_decode_from_partial_and_multiple() {
        let first = encode(&Message::Ping).unwrap();
        let second = encode(&Message::completion_done("9")).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second[..3]);

        assert_eq!(decode_from(&mut buf).unwrap(), Some(Message::Ping));
        assert_eq!(decode_from(&mut buf).unwrap(), None);

        buf.extend_from_slice(&second[3..]);
        assert_eq!(
            decode_from(&mut buf).unwrap(),
            Some(Message::completion_done("9"))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_errors_are_typed() {
        assert!(matches!(
            decode(br#"{"type":9}"#),
            Err(ProtocolError::UnknownMessageType(9))
        ));
        assert!(matches!(
            decode(br#"{"type":2}"#),
            Err(ProtocolError::MissingField { kind: 2, .. })
        ));
        assert!(matches!(
            decode(b"not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_handshake_frames() {
        let request = HandshakeRequest {
            protocol: "json".into(),
            version: 1,
        };
        let encoded = encode_handshake_request(&request);
        let mut buf = BytesMut::from(&encoded[..]);
        let frame = next_text_frame(&mut buf).unwrap();
        assert_eq!(parse_handshake_request(&frame).unwrap(), request);

        let ok = encode_handshake_response(&HandshakeResponse::ok());
        assert_eq!(&ok[..], b"{}\x1e");

        let err = encode_handshake_response(&HandshakeResponse::error("nope"));
        let mut buf = BytesMut::from(&err[..]);
        let frame = next_text_frame(&mut buf).unwrap();
        assert_eq!(
            parse_handshake_response(&frame).unwrap().error.as_deref(),
            Some("nope")
        );
    }
}
