//! MessagePack codec: positional arrays behind a varint length prefix.
//!
//! Each frame is a MessagePack array whose first element is the integer
//! message type; remaining elements are fixed by position, with no field
//! names on the wire. The length prefix uses 7-bit little-endian groups with
//! the high bit as continuation, at most five bytes.

use bytes::{Buf, Bytes, BytesMut};
use rmpv::Value as Mp;
use serde_json::Value as Json;

use crate::error::{ProtocolError, MAX_FRAME_SIZE};
use crate::messages::{Message, MessageKind};

/// Completion discriminators on the MessagePack wire.
const COMPLETION_ERROR: u64 = 1;
const COMPLETION_VOID: u64 = 2;
const COMPLETION_RESULT: u64 = 3;

/// Encode a message as one length-prefixed frame.
///
/// # Errors
///
/// Returns an error if encoding fails or the frame is too large.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let array = to_array(message);
    let mut payload = Vec::with_capacity(64);
    rmpv::encode::write_value(&mut payload, &Mp::Array(array))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    write_varint(&mut buf, payload.len());
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Decode one message from a single complete length-prefixed frame.
///
/// # Errors
///
/// Returns an error if the frame is incomplete or invalid.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    let (length, consumed) = read_varint(data)?
        .ok_or_else(|| ProtocolError::Invalid("truncated length prefix".into()))?;
    let payload = data
        .get(consumed..consumed + length)
        .ok_or_else(|| ProtocolError::Invalid("truncated frame".into()))?;
    parse_payload(payload)
}

/// Try to decode one message from a buffer, advancing past the frame on
/// success. Returns `Ok(None)` when no complete frame is buffered yet.
///
/// # Errors
///
/// Returns an error if the prefix is malformed or a complete frame fails to
/// parse.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
    let Some((length, consumed)) = read_varint(buf)? else {
        return Ok(None);
    };
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    if buf.len() < consumed + length {
        return Ok(None);
    }
    buf.advance(consumed);
    let payload = buf.split_to(length);
    parse_payload(&payload).map(Some)
}

fn to_array(message: &Message) -> Vec<Mp> {
    match message {
        Message::Invocation {
            invocation_id,
            target,
            arguments,
            stream_ids,
        } => invocation_array(1, invocation_id.as_deref(), target, arguments, stream_ids),
        Message::StreamItem {
            invocation_id,
            item,
        } => vec![
            Mp::from(2),
            Mp::Map(Vec::new()),
            Mp::from(invocation_id.as_str()),
            json_to_mp(item),
        ],
        Message::Completion {
            invocation_id,
            result,
            error,
        } => {
            let mut array = vec![
                Mp::from(3),
                Mp::Map(Vec::new()),
                Mp::from(invocation_id.as_str()),
            ];
            match (result, error) {
                (_, Some(message)) => {
                    array.push(Mp::from(COMPLETION_ERROR));
                    array.push(Mp::from(message.as_str()));
                }
                (Some(value), None) => {
                    array.push(Mp::from(COMPLETION_RESULT));
                    array.push(json_to_mp(value));
                }
                (None, None) => array.push(Mp::from(COMPLETION_VOID)),
            }
            array
        }
        Message::StreamInvocation {
            invocation_id,
            target,
            arguments,
            stream_ids,
        } => invocation_array(4, Some(invocation_id), target, arguments, stream_ids),
        Message::CancelInvocation { invocation_id } => vec![
            Mp::from(5),
            Mp::Map(Vec::new()),
            Mp::from(invocation_id.as_str()),
        ],
        Message::Ping => vec![Mp::from(6)],
        Message::Close {
            error,
            allow_reconnect,
        } => {
            let mut array = vec![
                Mp::from(7),
                error
                    .as_deref()
                    .map(Mp::from)
                    .unwrap_or(Mp::Nil),
            ];
            if let Some(allow) = allow_reconnect {
                array.push(Mp::from(*allow));
            }
            array
        }
    }
}

fn invocation_array(
    kind: u8,
    invocation_id: Option<&str>,
    target: &str,
    arguments: &[Json],
    stream_ids: &[String],
) -> Vec<Mp> {
    let mut array = vec![
        Mp::from(kind),
        Mp::Map(Vec::new()),
        invocation_id.map(Mp::from).unwrap_or(Mp::Nil),
        Mp::from(target),
        Mp::Array(arguments.iter().map(json_to_mp).collect()),
    ];
    if !stream_ids.is_empty() {
        array.push(Mp::Array(
            stream_ids.iter().map(|id| Mp::from(id.as_str())).collect(),
        ));
    }
    array
}

fn parse_payload(payload: &[u8]) -> Result<Message, ProtocolError> {
    let mut reader = payload;
    let value = rmpv::decode::read_value(&mut reader)?;
    let Mp::Array(elements) = value else {
        return Err(ProtocolError::Invalid("frame is not an array".into()));
    };
    let kind_raw = elements
        .first()
        .and_then(Mp::as_u64)
        .ok_or_else(|| ProtocolError::Invalid("missing type discriminator".into()))?;
    let kind = u8::try_from(kind_raw)
        .ok()
        .and_then(|raw| MessageKind::try_from(raw).ok())
        .ok_or(ProtocolError::UnknownMessageType(kind_raw as u8))?;

    // Element 1 is an (always empty) header map for every headed type; the
    // payload starts at element 2.
    let field = |index: usize| elements.get(index);
    let require_str = |index: usize, name: &'static str| {
        field(index)
            .and_then(Mp::as_str)
            .map(str::to_owned)
            .ok_or(ProtocolError::MissingField {
                kind: kind.into(),
                field: name,
            })
    };

    Ok(match kind {
        MessageKind::Invocation | MessageKind::StreamInvocation => {
            let invocation_id = match field(2) {
                Some(Mp::Nil) | None => None,
                Some(value) => Some(value.as_str().map(str::to_owned).ok_or(
                    ProtocolError::MissingField {
                        kind: kind.into(),
                        field: "invocationId",
                    },
                )?),
            };
            let target = require_str(3, "target")?;
            let arguments = match field(4) {
                Some(Mp::Array(items)) => items.iter().map(mp_to_json).collect(),
                _ => Vec::new(),
            };
            let stream_ids = match field(5) {
                Some(Mp::Array(ids)) => ids
                    .iter()
                    .filter_map(Mp::as_str)
                    .map(str::to_owned)
                    .collect(),
                _ => Vec::new(),
            };
            if kind == MessageKind::Invocation {
                Message::Invocation {
                    invocation_id,
                    target,
                    arguments,
                    stream_ids,
                }
            } else {
                Message::StreamInvocation {
                    invocation_id: invocation_id.ok_or(ProtocolError::MissingField {
                        kind: kind.into(),
                        field: "invocationId",
                    })?,
                    target,
                    arguments,
                    stream_ids,
                }
            }
        }
        MessageKind::StreamItem => Message::StreamItem {
            invocation_id: require_str(2, "invocationId")?,
            item: field(3).map(mp_to_json).unwrap_or(Json::Null),
        },
        MessageKind::Completion => {
            let invocation_id = require_str(2, "invocationId")?;
            let result_kind =
                field(3)
                    .and_then(Mp::as_u64)
                    .ok_or(ProtocolError::MissingField {
                        kind: kind.into(),
                        field: "resultKind",
                    })?;
            match result_kind {
                COMPLETION_ERROR => Message::Completion {
                    invocation_id,
                    result: None,
                    error: Some(require_str(4, "error")?),
                },
                COMPLETION_VOID => Message::completion_done(invocation_id),
                COMPLETION_RESULT => Message::Completion {
                    invocation_id,
                    result: Some(field(4).map(mp_to_json).unwrap_or(Json::Null)),
                    error: None,
                },
                other => {
                    return Err(ProtocolError::Invalid(format!(
                        "unknown completion result kind {other}"
                    )))
                }
            }
        }
        MessageKind::CancelInvocation => Message::CancelInvocation {
            invocation_id: require_str(2, "invocationId")?,
        },
        MessageKind::Ping => Message::Ping,
        MessageKind::Close => Message::Close {
            error: match field(1) {
                Some(Mp::Nil) | None => None,
                Some(value) => value.as_str().map(str::to_owned),
            },
            allow_reconnect: field(2).and_then(Mp::as_bool),
        },
    })
}

/// Write a 7-bit little-endian varint with high-bit continuation.
fn write_varint(buf: &mut BytesMut, mut value: usize) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.extend_from_slice(&[byte]);
        if value == 0 {
            break;
        }
    }
}

/// Read a varint length prefix. Returns `Ok(None)` on a short read and an
/// error once a prefix spans more than five bytes.
fn read_varint(data: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value: usize = 0;
    for (index, &byte) in data.iter().enumerate() {
        if index >= 5 {
            return Err(ProtocolError::BadLengthPrefix);
        }
        value |= ((byte & 0x7F) as usize) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
    }
    if data.len() >= 5 {
        return Err(ProtocolError::BadLengthPrefix);
    }
    Ok(None)
}

fn json_to_mp(value: &Json) -> Mp {
    match value {
        Json::Null => Mp::Nil,
        Json::Bool(flag) => Mp::from(*flag),
        Json::Number(number) => {
            if let Some(signed) = number.as_i64() {
                Mp::from(signed)
            } else if let Some(unsigned) = number.as_u64() {
                Mp::from(unsigned)
            } else {
                Mp::from(number.as_f64().unwrap_or(0.0))
            }
        }
        Json::String(text) => Mp::from(text.as_str()),
        Json::Array(items) => Mp::Array(items.iter().map(json_to_mp).collect()),
        Json::Object(entries) => Mp::Map(
            entries
                .iter()
                .map(|(key, value)| (Mp::from(key.as_str()), json_to_mp(value)))
                .collect(),
        ),
    }
}

fn mp_to_json(value: &Mp) -> Json {
    match value {
        Mp::Nil => Json::Null,
        Mp::Boolean(flag) => Json::Bool(*flag),
        Mp::Integer(integer) => {
            if let Some(signed) = integer.as_i64() {
                Json::from(signed)
            } else if let Some(unsigned) = integer.as_u64() {
                Json::from(unsigned)
            } else {
                integer
                    .as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(Json::Number)
                    .unwrap_or(Json::Null)
            }
        }
        Mp::F32(float) => serde_json::Number::from_f64(f64::from(*float))
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Mp::F64(float) => serde_json::Number::from_f64(*float)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Mp::String(text) => Json::String(text.as_str().unwrap_or_default().to_owned()),
        Mp::Binary(data) => Json::Array(data.iter().map(|&byte| Json::from(byte)).collect()),
        Mp::Array(items) => Json::Array(items.iter().map(mp_to_json).collect()),
        Mp::Map(entries) => Json::Object(
            entries
                .iter()
                .map(|(key, value)| {
                    let key = key
                        .as_str()
                        .map(str::to_owned)
                        .unwrap_or_else(|| key.to_string());
                    (key, mp_to_json(value))
                })
                .collect(),
        ),
        // Extension types have no JSON counterpart.
        Mp::Ext(..) => Json::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn all_messages() -> Vec<Message> {
        vec![
            Message::invocation("1", "echo", vec![json!("hi")]),
            Message::send("notify", vec![json!({"a": 1, "b": [true, null]})]),
            Message::Invocation {
                invocation_id: Some("3".into()),
                target: "upload".into(),
                arguments: vec![json!(2.0)],
                stream_ids: vec!["s1".into(), "s2".into()],
            },
            Message::stream_item("2", json!(42)),
            Message::completion_result("1", json!(["hi", 1.5])),
            Message::completion_error("1", "boom"),
            Message::completion_done("2"),
            Message::stream_invocation("2", "dateStream", vec![json!(3)]),
            Message::cancel_invocation("2"),
            Message::Ping,
            Message::close(None),
            Message::Close {
                error: Some("bye".into()),
                allow_reconnect: Some(false),
            },
        ]
    }

    #[test]
    fn test_roundtrip_every_message() {
        for message in all_messages() {
            let encoded = encode(&message).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(message, decoded, "roundtrip failed for {message:?}");
        }
    }

    #[test]
    fn test_ping_wire_layout() {
        // [6] is a one-element fixarray: two payload bytes, one prefix byte.
        let encoded = encode(&Message::Ping).unwrap();
        assert_eq!(&encoded[..], &[0x02, 0x91, 0x06]);
    }

    #[test]
    fn test_varint_edges() {
        let mut buf = BytesMut::new();
        write_varint(&mut buf, 0x7F);
        assert_eq!(&buf[..], &[0x7F]);

        buf.clear();
        write_varint(&mut buf, 0x80);
        assert_eq!(&buf[..], &[0x80, 0x01]);

        buf.clear();
        write_varint(&mut buf, 300);
        assert_eq!(read_varint(&buf).unwrap(), Some((300, 2)));

        assert_eq!(read_varint(&[0x80]).unwrap(), None);
        assert!(matches!(
            read_varint(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]),
            Err(ProtocolError::BadLengthPrefix)
        ));
    }

    #[test]
    fn test_decode_from_partial() {
        let encoded = encode(&Message::completion_done("9")).unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..encoded.len() - 2]);
        assert_eq!(decode_from(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[encoded.len() - 2..]);
        assert_eq!(
            decode_from(&mut buf).unwrap(),
            Some(Message::completion_done("9"))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_errors_are_typed() {
        // A valid prefix framing a non-array payload.
        let mut buf = BytesMut::new();
        write_varint(&mut buf, 1);
        buf.extend_from_slice(&[0xC0]); // nil
        assert!(matches!(
            decode_from(&mut buf),
            Err(ProtocolError::Invalid(_))
        ));

        // Unknown type discriminator.
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &Mp::Array(vec![Mp::from(9)])).unwrap();
        let mut buf = BytesMut::new();
        write_varint(&mut buf, payload.len());
        buf.extend_from_slice(&payload);
        assert!(matches!(
            decode_from(&mut buf),
            Err(ProtocolError::UnknownMessageType(9))
        ));
    }

    #[test]
    fn test_binary_arguments_become_arrays() {
        let mut payload = Vec::new();
        let array = Mp::Array(vec![
            Mp::from(1),
            Mp::Map(Vec::new()),
            Mp::Nil,
            Mp::from("blob"),
            Mp::Array(vec![Mp::Binary(vec![1, 2, 3])]),
        ]);
        rmpv::encode::write_value(&mut payload, &array).unwrap();
        let mut buf = BytesMut::new();
        write_varint(&mut buf, payload.len());
        buf.extend_from_slice(&payload);

        let decoded = decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::send("blob", vec![json!([1, 2, 3])]));
    }
}
