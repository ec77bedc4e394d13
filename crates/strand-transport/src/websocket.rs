//! Client-side WebSocket adapter over tokio-tungstenite.
//!
//! The server side pumps its own upgraded sockets (see the strand-server
//! handlers); this adapter exists for the programmatic client, which dials
//! out with `connect_async`.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use strand_protocol::TransferFormat;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, warn};

use crate::traits::{
    transport_channel, TransportChannel, TransportError, TransportEvent, TransportKind,
};

/// Dial a WebSocket URL and return the byte-message channel for it.
///
/// `format` decides whether outbound frames travel as text or binary
/// WebSocket messages; the negotiated protocol's transfer format is the
/// right value.
///
/// # Errors
///
/// Returns an error if the WebSocket handshake fails.
pub async fn connect(
    url: &str,
    format: TransferFormat,
    capacity: usize,
) -> Result<TransportChannel, TransportError> {
    let (stream, _response) = connect_async(url)
        .await
        .map_err(|e| TransportError::Other(format!("websocket handshake failed: {e}")))?;

    debug!(url = %url, "websocket connected");

    let (channel, backend) = transport_channel(TransportKind::WebSockets, capacity);
    let _ = channel.format.send(format);
    let (mut sink, mut source) = stream.split();
    let mut outbound = backend.outbound;
    let events = backend.events;
    let format = backend.format;

    // Pongs cross from the read task to the write task so the sink has a
    // single owner.
    let (pong_tx, mut pong_rx) = mpsc::channel::<Vec<u8>>(4);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                data = outbound.recv() => {
                    let Some(data) = data else { break };
                    let message = match *format.borrow() {
                        TransferFormat::Text => {
                            Message::Text(String::from_utf8_lossy(&data).into_owned())
                        }
                        TransferFormat::Binary => Message::Binary(data.to_vec()),
                    };
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                pong = pong_rx.recv() => {
                    let Some(payload) = pong else { break };
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        loop {
            match source.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if events.send(TransportEvent::Frame(Bytes::from(data))).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if events
                        .send(TransportEvent::Frame(Bytes::from(text.into_bytes())))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = pong_tx.send(payload).await;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(WsError::ConnectionClosed)) | None => {
                    let _ = events.send(TransportEvent::Closed).await;
                    break;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "websocket receive error");
                    let _ = events
                        .send(TransportEvent::Error(TransportError::ReceiveFailed(
                            e.to_string(),
                        )))
                        .await;
                    break;
                }
            }
        }
    });

    Ok(channel)
}
