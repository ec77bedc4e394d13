//! Message types for the strand hub protocol.
//!
//! Messages are the fundamental unit of communication between a hub server
//! and its clients. The set is closed: seven message types, each carrying a
//! small integer discriminator on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type identifiers (the wire `type` discriminator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Invocation = 1,
    StreamItem = 2,
    Completion = 3,
    StreamInvocation = 4,
    CancelInvocation = 5,
    Ping = 6,
    Close = 7,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(MessageKind::Invocation),
            2 => Ok(MessageKind::StreamItem),
            3 => Ok(MessageKind::Completion),
            4 => Ok(MessageKind::StreamInvocation),
            5 => Ok(MessageKind::CancelInvocation),
            6 => Ok(MessageKind::Ping),
            7 => Ok(MessageKind::Close),
            other => Err(other),
        }
    }
}

/// A hub protocol message.
///
/// Arguments and results are held as [`serde_json::Value`]; decoding to the
/// concrete parameter types of a hub method happens at dispatch time.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A method call. `invocation_id` is absent for fire-and-forget calls
    /// that expect no completion.
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
        /// Client-to-server upload channels bound to this invocation.
        stream_ids: Vec<String>,
    },

    /// A single item of a stream identified by `invocation_id`.
    StreamItem { invocation_id: String, item: Value },

    /// Terminates an invocation or a stream. Carries a result or an error,
    /// never both.
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },

    /// A method call whose response is a lazy sequence of stream items
    /// ending in exactly one completion.
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
        stream_ids: Vec<String>,
    },

    /// Cancels the in-flight invocation identified by `invocation_id`.
    CancelInvocation { invocation_id: String },

    /// Keep-alive. No payload, no reply required.
    Ping,

    /// Graceful connection teardown.
    Close {
        error: Option<String>,
        allow_reconnect: Option<bool>,
    },
}

impl Message {
    /// Get the message kind.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Invocation { .. } => MessageKind::Invocation,
            Message::StreamItem { .. } => MessageKind::StreamItem,
            Message::Completion { .. } => MessageKind::Completion,
            Message::StreamInvocation { .. } => MessageKind::StreamInvocation,
            Message::CancelInvocation { .. } => MessageKind::CancelInvocation,
            Message::Ping => MessageKind::Ping,
            Message::Close { .. } => MessageKind::Close,
        }
    }

    /// Create an invocation that expects a completion.
    #[must_use]
    pub fn invocation(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Message::Invocation {
            invocation_id: Some(invocation_id.into()),
            target: target.into(),
            arguments,
            stream_ids: Vec::new(),
        }
    }

    /// Create a fire-and-forget invocation.
    #[must_use]
    pub fn send(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Message::Invocation {
            invocation_id: None,
            target: target.into(),
            arguments,
            stream_ids: Vec::new(),
        }
    }

    /// Create a stream invocation.
    #[must_use]
    pub fn stream_invocation(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Message::StreamInvocation {
            invocation_id: invocation_id.into(),
            target: target.into(),
            arguments,
            stream_ids: Vec::new(),
        }
    }

    /// Create a stream item.
    #[must_use]
    pub fn stream_item(invocation_id: impl Into<String>, item: Value) -> Self {
        Message::StreamItem {
            invocation_id: invocation_id.into(),
            item,
        }
    }

    /// Create a completion carrying a result.
    ///
    /// A `null` result is normalized to a bare completion so that both wire
    /// encodings round-trip it identically.
    #[must_use]
    pub fn completion_result(invocation_id: impl Into<String>, result: Value) -> Self {
        let result = match result {
            Value::Null => None,
            other => Some(other),
        };
        Message::Completion {
            invocation_id: invocation_id.into(),
            result,
            error: None,
        }
    }

    /// Create a completion carrying an error.
    #[must_use]
    pub fn completion_error(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Message::Completion {
            invocation_id: invocation_id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Create a completion with neither result nor error (stream terminator,
    /// void method result).
    #[must_use]
    pub fn completion_done(invocation_id: impl Into<String>) -> Self {
        Message::Completion {
            invocation_id: invocation_id.into(),
            result: None,
            error: None,
        }
    }

    /// Create a cancellation for an in-flight invocation.
    #[must_use]
    pub fn cancel_invocation(invocation_id: impl Into<String>) -> Self {
        Message::CancelInvocation {
            invocation_id: invocation_id.into(),
        }
    }

    /// Create a close message.
    #[must_use]
    pub fn close(error: Option<String>) -> Self {
        Message::Close {
            error,
            allow_reconnect: None,
        }
    }
}

/// The handshake request a client sends before any protocol message.
///
/// Handshake frames always use JSON framing regardless of the protocol being
/// negotiated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Protocol name, `"json"` or `"messagepack"`.
    pub protocol: String,
    /// Handshake version; the server accepts `1`.
    pub version: u32,
}

/// The server's reply to a handshake request. An empty object means success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    /// The success reply, `{}` on the wire.
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// An error reply.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
        }
    }
}

/// One transport offered in a negotiate response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: String,
    pub transfer_formats: Vec<String>,
}

/// The HTTP negotiate response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    pub connection_id: String,
    /// Present when `negotiate_version >= 1`; clients then use it in
    /// transport URLs instead of the connection id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_token: Option<String>,
    pub negotiate_version: u32,
    pub available_transports: Vec<AvailableTransport>,
}

impl NegotiateResponse {
    /// The token a client should put in transport URLs.
    #[must_use]
    pub fn transport_token(&self) -> &str {
        self.connection_token
            .as_deref()
            .unwrap_or(&self.connection_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_kind() {
        let invocation = Message::invocation("1", "echo", vec![json!("hi")]);
        assert_eq!(invocation.kind(), MessageKind::Invocation);
        assert_eq!(u8::from(invocation.kind()), 1);

        assert_eq!(Message::Ping.kind(), MessageKind::Ping);
        assert_eq!(MessageKind::try_from(7), Ok(MessageKind::Close));
        assert!(MessageKind::try_from(8).is_err());
    }

    #[test]
    fn test_null_result_normalized() {
        let completion = Message::completion_result("1", Value::Null);
        assert_eq!(completion, Message::completion_done("1"));
    }

    #[test]
    fn test_negotiate_transport_token() {
        let mut response = NegotiateResponse {
            connection_id: "id".into(),
            connection_token: Some("token".into()),
            negotiate_version: 1,
            available_transports: vec![],
        };
        assert_eq!(response.transport_token(), "token");

        response.connection_token = None;
        assert_eq!(response.transport_token(), "id");
    }
}
