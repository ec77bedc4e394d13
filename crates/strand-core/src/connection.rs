//! Per-connection handle shared with the registry and client proxies.
//!
//! A handle is the only way other tasks touch a connection: everything goes
//! through the message-level writer queue, so cross-connection writes never
//! reach another connection's internal state.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use strand_protocol::Message;

use crate::error::{ConnectionError, InvokeError};
use crate::options::OverflowPolicy;
use crate::streams::ValueStream;

#[derive(Debug)]
struct Inner {
    id: String,
    /// Message-level writer queue; the connection's writer task encodes
    /// with the negotiated codec.
    messages: mpsc::Sender<Message>,
    /// Server-originated invocations awaiting a completion from this peer.
    pending: DashMap<String, oneshot::Sender<Result<Value, InvokeError>>>,
    cancel: CancellationToken,
    overflow: OverflowPolicy,
    connected_at: Instant,
}

/// A cloneable handle to one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl ConnectionHandle {
    /// Create a handle around a writer queue.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        messages: mpsc::Sender<Message>,
        overflow: OverflowPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                messages,
                pending: DashMap::new(),
                cancel: CancellationToken::new(),
                overflow,
                connected_at: Instant::now(),
            }),
        }
    }

    /// The connection id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The connection-lifetime cancellation token. Cancelled on abort,
    /// transport loss, or timeout; in-flight invocations derive from it.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// When the connection completed its handshake.
    #[must_use]
    pub fn connected_at(&self) -> Instant {
        self.inner.connected_at
    }

    /// Initiate teardown of this connection.
    pub fn abort(&self) {
        debug!(connection = %self.inner.id, "abort requested");
        self.inner.cancel.cancel();
    }

    /// Whether the connection is already going away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled() || self.inner.messages.is_closed()
    }

    /// Queue one protocol message for this connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] if the connection is gone, or
    /// [`ConnectionError::Backpressure`] when the queue is full under
    /// [`OverflowPolicy::Fail`].
    pub async fn send_message(&self, message: Message) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.enqueue(message).await
    }

    /// Queue a message even while the connection is tearing down. The close
    /// frame of an aborted connection still has to reach the writer.
    pub(crate) async fn send_during_close(&self, message: Message) -> Result<(), ConnectionError> {
        self.enqueue(message).await
    }

    async fn enqueue(&self, message: Message) -> Result<(), ConnectionError> {
        match self.inner.overflow {
            OverflowPolicy::Block => self
                .inner
                .messages
                .send(message)
                .await
                .map_err(|_| ConnectionError::Closed),
            OverflowPolicy::Fail => {
                self.inner.messages.try_send(message).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => ConnectionError::Backpressure,
                    mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
                })
            }
        }
    }

    /// Fire-and-forget invocation on this peer.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`send_message`](Self::send_message).
    pub async fn send(&self, target: &str, arguments: Vec<Value>) -> Result<(), ConnectionError> {
        self.send_message(Message::send(target, arguments)).await
    }

    /// Invoke a method on this peer and await its completion.
    ///
    /// # Errors
    ///
    /// Resolves with the peer's error, [`InvokeError::Canceled`] if the
    /// connection dies first, or [`InvokeError::Unreachable`] if the frame
    /// could not be queued.
    pub async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Value, InvokeError> {
        let invocation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(invocation_id.clone(), tx);

        let message = Message::invocation(invocation_id.clone(), target, arguments);
        if self.send_message(message).await.is_err() {
            self.inner.pending.remove(&invocation_id);
            return Err(InvokeError::Unreachable);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(InvokeError::Canceled),
        }
    }

    /// Push one or more server-to-client streams at this peer: a stream
    /// invocation announcing the stream ids, then each channel's values as
    /// stream items, then one terminating completion per stream.
    ///
    /// # Errors
    ///
    /// Fails only if the announcing frame cannot be queued; forwarding runs
    /// detached and stops silently if the connection dies.
    pub async fn push_streams(
        &self,
        target: &str,
        streams: Vec<ValueStream>,
    ) -> Result<(), ConnectionError> {
        let invocation_id = Uuid::new_v4().to_string();
        let stream_ids: Vec<String> = streams
            .iter()
            .map(|_| Uuid::new_v4().to_string())
            .collect();

        self.send_message(Message::StreamInvocation {
            invocation_id,
            target: target.to_owned(),
            arguments: Vec::new(),
            stream_ids: stream_ids.clone(),
        })
        .await?;

        for (stream_id, mut stream) in stream_ids.into_iter().zip(streams) {
            let handle = self.clone();
            tokio::spawn(async move {
                while let Some(item) = stream.next().await {
                    if handle
                        .send_message(Message::stream_item(stream_id.clone(), item))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                let _ = handle
                    .send_message(Message::completion_done(stream_id))
                    .await;
            });
        }
        Ok(())
    }

    /// Resolve a pending server-originated invocation with the peer's
    /// completion. Returns `false` for unknown ids.
    pub fn complete(&self, invocation_id: &str, result: Result<Value, String>) -> bool {
        match self.inner.pending.remove(invocation_id) {
            Some((_, tx)) => {
                trace!(connection = %self.inner.id, invocation = %invocation_id, "completion delivered");
                let _ = tx.send(result.map_err(InvokeError::Hub));
                true
            }
            None => false,
        }
    }

    /// Resolve every pending invocation with a cancellation error. Called
    /// once when the connection closes.
    pub fn fail_all_pending(&self) {
        let ids: Vec<String> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((_, tx)) = self.inner.pending.remove(&id) {
                let _ = tx.send(Err(InvokeError::Canceled));
            }
        }
    }
}
