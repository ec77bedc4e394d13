//! HTTP surface for the hub: negotiate, WebSocket upgrade, and the SSE
//! stream/POST pair, mounted under the configured base path.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use strand_core::{HubEngine, HubSource};
use strand_protocol::TransferFormat;
use strand_transport::sse::SseSession;
use strand_transport::{
    transport_channel, TransportBackend, TransportError, TransportEvent, TransportKind,
};

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::negotiate::{bearer_authorized, origin_allowed, NegotiateSlots};

/// Shared server state.
pub struct AppState {
    /// The hub engine driving every connection.
    pub engine: Arc<HubEngine>,
    /// Server configuration.
    pub config: Config,
    /// Negotiated-but-unclaimed connection slots.
    pub slots: NegotiateSlots,
    /// Live SSE sessions, keyed by connection token.
    sse_sessions: DashMap<String, Arc<SseSession>>,
}

impl AppState {
    /// Create the state for one mounted hub.
    #[must_use]
    pub fn new(config: Config, source: HubSource) -> Self {
        let engine = Arc::new(HubEngine::new(source, config.hub_options()));
        let slots = NegotiateSlots::new(config.connect_ttl());
        Self {
            engine,
            config,
            slots,
            sse_sessions: DashMap::new(),
        }
    }
}

/// Build the router for the hub endpoints under the configured base path.
#[must_use]
pub fn hub_router(state: Arc<AppState>) -> Router {
    let base = state.config.base_path.trim_end_matches('/').to_owned();
    Router::new()
        .route(&format!("{base}/negotiate"), post(negotiate))
        .route(&base, get(transport_get).post(sse_post))
        .with_state(state)
}

/// Bind and serve the hub (plus the metrics exporter when enabled) until
/// the process ends.
///
/// # Errors
///
/// Returns an error if binding or serving fails. Startup errors are fatal;
/// peer behavior never is.
pub async fn run_server(config: Config, source: HubSource) -> anyhow::Result<()> {
    if config.metrics.enabled {
        metrics::start_metrics_server(config.metrics.port)?;
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config, source));
    let app = hub_router(Arc::clone(&state));

    let listener = TcpListener::bind(addr).await?;
    info!(
        address = %addr,
        base_path = %state.config.base_path,
        "strand hub listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct NegotiateParams {
    #[serde(rename = "negotiateVersion", default)]
    negotiate_version: u32,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransportParams {
    id: Option<String>,
    access_token: Option<String>,
}

/// Origin and bearer checks shared by every hub endpoint.
fn guard_request(
    state: &AppState,
    headers: &HeaderMap,
    access_token: Option<&str>,
) -> Result<(), Response> {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !origin_allowed(&state.config, origin) {
        warn!(origin = ?origin, "origin rejected");
        return Err(StatusCode::FORBIDDEN.into_response());
    }

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !bearer_authorized(&state.config.auth, authorization, access_token) {
        return Err(StatusCode::UNAUTHORIZED.into_response());
    }
    Ok(())
}

async fn negotiate(
    State(state): State<Arc<AppState>>,
    Query(params): Query<NegotiateParams>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = guard_request(&state, &headers, params.access_token.as_deref()) {
        return response;
    }
    Json(state.slots.allocate(params.negotiate_version)).into_response()
}

/// `GET {base}` serves both transports: a WebSocket upgrade when the
/// request asks for one, the SSE event stream when it accepts
/// `text/event-stream`.
async fn transport_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TransportParams>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Err(response) = guard_request(&state, &headers, params.access_token.as_deref()) {
        return response;
    }
    let Some(token) = params.id else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(connection_id) = state.slots.claim(&token) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if let Some(ws) = ws {
        let state = Arc::clone(&state);
        return ws
            .on_upgrade(move |socket| async move {
                let _guard = ConnectionMetricsGuard::new();
                let capacity = state.engine.options().stream_buffer_capacity;
                let (channel, backend) = transport_channel(TransportKind::WebSockets, capacity);
                pump_websocket(socket, backend, state.config.limits.max_message_size);
                state.engine.run_connection(connection_id, channel).await;
            })
            .into_response();
    }

    if accepts_event_stream(&headers) {
        return serve_sse(state, token, connection_id);
    }

    StatusCode::BAD_REQUEST.into_response()
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

/// Pump an upgraded WebSocket into a transport backend. The socket's two
/// halves each get their own task; pongs cross from reader to writer so the
/// sink has a single owner. Outbound frames travel as text or binary
/// WebSocket messages per the transfer format the handshake negotiated.
fn pump_websocket(socket: WebSocket, backend: TransportBackend, max_message_size: usize) {
    let (mut sink, mut stream) = socket.split();
    let TransportBackend {
        mut outbound,
        events,
        format,
    } = backend;
    let (pong_tx, mut pong_rx) = mpsc::channel::<Vec<u8>>(4);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                data = outbound.recv() => {
                    let Some(data) = data else { break };
                    metrics::record_frame(data.len(), "outbound");
                    let message = match *format.borrow() {
                        TransferFormat::Text => {
                            WsMessage::Text(String::from_utf8_lossy(&data).into_owned())
                        }
                        TransferFormat::Binary => WsMessage::Binary(data.to_vec()),
                    };
                    if sink.send(message).await.is_err() {
                        return;
                    }
                }
                pong = pong_rx.recv() => {
                    let Some(payload) = pong else { break };
                    if sink.send(WsMessage::Pong(payload)).await.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = sink.send(WsMessage::Close(None)).await;
    });

    tokio::spawn(async move {
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    if data.len() > max_message_size {
                        warn!(size = data.len(), "inbound message too large");
                        metrics::record_error("oversized_message");
                        let _ = events
                            .send(TransportEvent::Error(TransportError::ReceiveFailed(
                                "message too large".into(),
                            )))
                            .await;
                        return;
                    }
                    metrics::record_frame(data.len(), "inbound");
                    if events
                        .send(TransportEvent::Frame(Bytes::from(data)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Some(Ok(WsMessage::Text(text))) => {
                    if text.len() > max_message_size {
                        warn!(size = text.len(), "inbound message too large");
                        let _ = events
                            .send(TransportEvent::Error(TransportError::ReceiveFailed(
                                "message too large".into(),
                            )))
                            .await;
                        return;
                    }
                    metrics::record_frame(text.len(), "inbound");
                    if events
                        .send(TransportEvent::Frame(Bytes::from(text.into_bytes())))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = pong_tx.send(payload).await;
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close(_))) | None => {
                    let _ = events.send(TransportEvent::Closed).await;
                    return;
                }
                Some(Err(e)) => {
                    debug!(error = %e, "websocket receive error");
                    metrics::record_error("websocket");
                    let _ = events
                        .send(TransportEvent::Error(TransportError::ReceiveFailed(
                            e.to_string(),
                        )))
                        .await;
                    return;
                }
            }
        }
    });
}

/// Start the SSE half-duplex pair: this GET response streams outbound
/// frames; the companion POST route feeds inbound ones.
fn serve_sse(state: Arc<AppState>, token: String, connection_id: String) -> Response {
    let mut session = SseSession::new(state.engine.options().stream_buffer_capacity);
    let (Some(channel), Some(events)) = (session.take_channel(), session.take_outbound()) else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let session = Arc::new(session);
    state.sse_sessions.insert(token.clone(), session);

    let engine = Arc::clone(&state.engine);
    let connection_state = Arc::clone(&state);
    let connection_token = token.clone();
    tokio::spawn(async move {
        let _guard = ConnectionMetricsGuard::new();
        engine.run_connection(connection_id, channel).await;
        connection_state.sse_sessions.remove(&connection_token);
    });

    // The guard notices the client dropping the event stream and reports
    // peer close to the engine.
    let guard = SseStreamGuard { state, token };
    let stream = ReceiverStream::new(events).map(move |frame| {
        let _ = &guard;
        metrics::record_frame(frame.len(), "outbound");
        Ok::<Event, std::convert::Infallible>(
            Event::default().data(String::from_utf8_lossy(&frame).into_owned()),
        )
    });

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

struct SseStreamGuard {
    state: Arc<AppState>,
    token: String,
}

impl Drop for SseStreamGuard {
    fn drop(&mut self) {
        if let Some((_, session)) = self.state.sse_sessions.remove(&self.token) {
            session.close_now();
        }
    }
}

/// `POST {base}?id=<token>`: the SSE companion inbound channel.
async fn sse_post(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TransportParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = guard_request(&state, &headers, params.access_token.as_deref()) {
        return response;
    }
    let Some(token) = params.id else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if body.len() > state.config.limits.max_message_size {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    let session = state
        .sse_sessions
        .get(&token)
        .map(|entry| Arc::clone(entry.value()));
    match session {
        Some(session) => {
            metrics::record_frame(body.len(), "inbound");
            if session.push_inbound(body).await {
                StatusCode::OK.into_response()
            } else {
                StatusCode::NOT_FOUND.into_response()
            }
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
