//! Stream pipes: client-to-server uploads and server-to-client streams.

use std::marker::PhantomData;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

/// An untyped stream of serialized values, the shape fan-out and stream
/// forwarding work with.
pub type ValueStream = BoxStream<'static, Value>;

/// One event on an upload pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// A decoded stream item.
    Item(Value),
    /// The client sent the terminating completion.
    Completed,
    /// The client terminated the stream with an error.
    Failed(String),
}

/// The untyped receiving end of an upload pipe, as bound by the dispatcher.
#[derive(Debug)]
pub struct UploadSource(pub(crate) mpsc::Receiver<StreamFrame>);

/// Create an upload pipe. The sender side is fed by the connection reader;
/// the source is bound to a hub method parameter.
#[must_use]
pub fn upload_pipe(capacity: usize) -> (mpsc::Sender<StreamFrame>, UploadSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, UploadSource(rx))
}

/// A client-to-server stream of `T`, read by a hub method.
///
/// Items that fail to decode into `T` are logged and skipped. The stream
/// ends when the client sends the terminating completion or the connection
/// dies.
pub struct UploadStream<T> {
    source: mpsc::Receiver<StreamFrame>,
    error: Option<String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for UploadStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadStream").finish_non_exhaustive()
    }
}

impl<T: DeserializeOwned> UploadStream<T> {
    pub(crate) fn new(source: UploadSource) -> Self {
        Self {
            source: source.0,
            error: None,
            _marker: PhantomData,
        }
    }

    /// Receive the next item, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.source.recv().await? {
                StreamFrame::Item(value) => match serde_json::from_value(value) {
                    Ok(item) => return Some(item),
                    Err(e) => {
                        warn!(error = %e, "discarding undecodable upload item");
                    }
                },
                StreamFrame::Completed => {
                    self.source.close();
                    return None;
                }
                StreamFrame::Failed(message) => {
                    self.error = Some(message);
                    self.source.close();
                    return None;
                }
            }
        }
    }

    /// The error the client ended the stream with, if any. Meaningful after
    /// [`recv`](Self::recv) returned `None`.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// A server-to-client stream produced by a channel-returning hub method.
///
/// The method returns the stream; every value sent on the paired sender is
/// forwarded to the peer as a stream item, and dropping the sender completes
/// the stream.
pub struct ServerStream<T> {
    pub(crate) receiver: mpsc::Receiver<T>,
}

impl<T> std::fmt::Debug for ServerStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStream").finish_non_exhaustive()
    }
}

impl<T: Serialize + Send + 'static> ServerStream<T> {
    /// Create a stream and the sender feeding it.
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<T>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { receiver: rx })
    }

    /// Wrap an existing receiver.
    #[must_use]
    pub fn from_receiver(receiver: mpsc::Receiver<T>) -> Self {
        Self { receiver }
    }

    /// Erase the item type. Items that fail to serialize are logged and
    /// skipped.
    #[must_use]
    pub fn into_value_stream(self) -> ValueStream {
        ReceiverStream::new(self.receiver)
            .filter_map(|item| {
                futures_util::future::ready(match serde_json::to_value(item) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!(error = %e, "dropping unserializable stream item");
                        None
                    }
                })
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_upload_stream_decodes_and_ends() {
        let (tx, source) = upload_pipe(4);
        let mut stream = UploadStream::<i64>::new(source);

        tx.send(StreamFrame::Item(json!(1))).await.unwrap();
        tx.send(StreamFrame::Item(json!("not a number"))).await.unwrap();
        tx.send(StreamFrame::Item(json!(2))).await.unwrap();
        tx.send(StreamFrame::Completed).await.unwrap();

        assert_eq!(stream.recv().await, Some(1));
        // The undecodable item is skipped.
        assert_eq!(stream.recv().await, Some(2));
        assert_eq!(stream.recv().await, None);
        assert!(stream.error().is_none());
    }

    #[tokio::test]
    async fn test_upload_stream_surfaces_client_error() {
        let (tx, source) = upload_pipe(4);
        let mut stream = UploadStream::<String>::new(source);

        tx.send(StreamFrame::Failed("gave up".into())).await.unwrap();
        assert_eq!(stream.recv().await, None);
        assert_eq!(stream.error(), Some("gave up"));
    }

    #[tokio::test]
    async fn test_upload_stream_ends_when_sender_drops() {
        let (tx, source) = upload_pipe(4);
        let mut stream = UploadStream::<i64>::new(source);
        drop(tx);
        assert_eq!(stream.recv().await, None);
    }
}
