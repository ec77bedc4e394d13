//! Server-Sent Events transport plumbing.
//!
//! SSE is half-duplex, so the transport is assembled from two HTTP
//! exchanges: the GET response streams outbound frames as events, and a
//! companion POST route delivers inbound frames. This module owns the
//! channel bookkeeping; the HTTP layer wires the two routes to one session.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::traits::{
    transport_channel, TransportChannel, TransportEvent, TransportKind,
};

/// One SSE connection's channel state, shared between the GET and POST
/// handlers.
#[derive(Debug)]
pub struct SseSession {
    channel: Option<TransportChannel>,
    outbound: Option<mpsc::Receiver<Bytes>>,
    inbound: mpsc::Sender<TransportEvent>,
}

impl SseSession {
    /// Create a session. `capacity` bounds the writer queue.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (channel, backend) = transport_channel(TransportKind::ServerSentEvents, capacity);
        Self {
            channel: Some(channel),
            outbound: Some(backend.outbound),
            inbound: backend.events,
        }
    }

    /// Take the loop-facing channel. Yields once; the invocation loop owns
    /// it afterwards.
    pub fn take_channel(&mut self) -> Option<TransportChannel> {
        self.channel.take()
    }

    /// Take the outbound frame receiver for the GET response stream. Yields
    /// once.
    pub fn take_outbound(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.outbound.take()
    }

    /// Deliver one POST body as an inbound frame. Returns `false` once the
    /// connection is gone.
    pub async fn push_inbound(&self, data: Bytes) -> bool {
        self.inbound.send(TransportEvent::Frame(data)).await.is_ok()
    }

    /// Report peer close (the client dropped the event stream).
    pub async fn close(&self) {
        let _ = self.inbound.send(TransportEvent::Closed).await;
    }

    /// Non-async variant of [`close`](Self::close) for drop guards.
    pub fn close_now(&self) {
        let _ = self.inbound.try_send(TransportEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_routes_both_directions() {
        let mut session = SseSession::new(4);
        let mut channel = session.take_channel().unwrap();
        let mut outbound = session.take_outbound().unwrap();
        assert!(session.take_channel().is_none());
        assert!(session.take_outbound().is_none());

        channel
            .outbound
            .send(Bytes::from_static(b"event"))
            .await
            .unwrap();
        assert_eq!(outbound.recv().await.unwrap(), &b"event"[..]);

        assert!(session.push_inbound(Bytes::from_static(b"post")).await);
        match channel.events.recv().await.unwrap() {
            TransportEvent::Frame(data) => assert_eq!(data, &b"post"[..]),
            other => panic!("unexpected event: {other:?}"),
        }

        session.close().await;
        assert!(matches!(
            channel.events.recv().await.unwrap(),
            TransportEvent::Closed
        ));
    }
}
