//! Transport abstraction for the strand hub.
//!
//! A transport is a full-duplex byte-message channel. Adapters own their I/O
//! tasks and surface exactly three events to the invocation loop: a received
//! frame, a transport error, and peer close. Outbound frames go through a
//! bounded queue, which doubles as the connection's writer queue for
//! backpressure purposes.

use bytes::Bytes;
use strand_protocol::TransferFormat;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// The transports a strand server can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSockets,
    ServerSentEvents,
}

impl TransportKind {
    /// The name used in negotiate responses and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSockets => "WebSockets",
            TransportKind::ServerSentEvents => "ServerSentEvents",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// What a transport reports to the invocation loop.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete transport-level message (which may hold any number of
    /// protocol frames, or a fragment of one).
    Frame(Bytes),
    /// The transport failed; no further events follow.
    Error(TransportError),
    /// The peer closed cleanly; no further events follow.
    Closed,
}

/// The loop-facing side of a transport.
#[derive(Debug)]
pub struct TransportChannel {
    kind: TransportKind,
    /// Bounded writer queue feeding the adapter's write task.
    pub outbound: mpsc::Sender<Bytes>,
    /// Inbound events from the adapter's read task.
    pub events: mpsc::Receiver<TransportEvent>,
    /// Announces the negotiated transfer format to the adapter's write
    /// task. Starts as [`TransferFormat::Text`] (handshake frames are
    /// JSON); the invocation loop updates it once a protocol is selected.
    pub format: watch::Sender<TransferFormat>,
}

impl TransportChannel {
    /// Which transport this channel is backed by.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }
}

/// The adapter-facing side of a transport.
#[derive(Debug)]
pub struct TransportBackend {
    /// Frames queued by the connection's writer.
    pub outbound: mpsc::Receiver<Bytes>,
    /// Where the adapter reports frames, errors, and close.
    pub events: mpsc::Sender<TransportEvent>,
    /// The negotiated transfer format for outbound frames.
    pub format: watch::Receiver<TransferFormat>,
}

/// Create a connected channel/backend pair.
///
/// `capacity` bounds both directions; it is the `StreamBufferCapacity`
/// configuration knob.
#[must_use]
pub fn transport_channel(
    kind: TransportKind,
    capacity: usize,
) -> (TransportChannel, TransportBackend) {
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
    let (event_tx, event_rx) = mpsc::channel(capacity.max(1));
    let (format_tx, format_rx) = watch::channel(TransferFormat::Text);
    (
        TransportChannel {
            kind,
            outbound: outbound_tx,
            events: event_rx,
            format: format_tx,
        },
        TransportBackend {
            outbound: outbound_rx,
            events: event_tx,
            format: format_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_pair_carries_frames_both_ways() {
        let (mut channel, mut backend) = transport_channel(TransportKind::WebSockets, 8);

        channel.outbound.send(Bytes::from_static(b"out")).await.unwrap();
        assert_eq!(backend.outbound.recv().await.unwrap(), &b"out"[..]);

        backend
            .events
            .send(TransportEvent::Frame(Bytes::from_static(b"in")))
            .await
            .unwrap();
        match channel.events.recv().await.unwrap() {
            TransportEvent::Frame(data) => assert_eq!(data, &b"in"[..]),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_backend_ends_events() {
        let (mut channel, backend) = transport_channel(TransportKind::ServerSentEvents, 1);
        drop(backend);
        assert!(channel.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_transfer_format_defaults_to_text_and_propagates() {
        let (channel, backend) = transport_channel(TransportKind::WebSockets, 1);
        assert_eq!(*backend.format.borrow(), TransferFormat::Text);

        channel.format.send(TransferFormat::Binary).unwrap();
        assert_eq!(*backend.format.borrow(), TransferFormat::Binary);
    }
}
