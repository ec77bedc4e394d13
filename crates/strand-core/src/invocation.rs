//! The per-connection invocation loop.
//!
//! [`HubEngine::run_connection`] drives one connection from handshake to
//! teardown over a [`TransportChannel`]: it negotiates the protocol codec,
//! spawns the writer (with keep-alive pings) and runs the reader, dispatches
//! every invocation on its own task, demultiplexes upload streams, and
//! cleans up exactly once when the connection ends.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strand_protocol::{
    json, protocol_by_name, HandshakeResponse, HubProtocol, Message, ProtocolError,
    TransferFormat, HANDSHAKE_VERSION,
};
use strand_transport::{TransportChannel, TransportError, TransportEvent, TransportKind};

use crate::connection::ConnectionHandle;
use crate::context::HubContext;
use crate::error::DispatchError;
use crate::hub::{Hub, HubSource, InvocationOutput, InvocationRequest};
use crate::options::HubOptions;
use crate::registry::ClientRegistry;
use crate::streams::{upload_pipe, StreamFrame};

/// The error completion used when a hub method panics. The panic payload is
/// never forwarded to the peer.
const PANIC_COMPLETION_ERROR: &str = "An unexpected error occurred invoking the hub method";

/// Why a connection left the steady state.
#[derive(Debug)]
enum CloseOutcome {
    /// The peer sent a close frame.
    PeerClose(Option<String>),
    /// The transport ended without a close frame.
    PeerGone,
    /// No inbound traffic within the timeout interval.
    Timeout,
    /// The transport reported an error.
    Transport(TransportError),
    /// A frame failed to decode.
    Protocol(ProtocolError),
    /// The server side aborted the connection.
    Aborted,
}

/// The shared engine behind every connection of one mounted hub.
pub struct HubEngine {
    source: HubSource,
    registry: Arc<ClientRegistry>,
    options: HubOptions,
}

impl std::fmt::Debug for HubEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubEngine")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl HubEngine {
    /// Create an engine. Options are validated (timeout clamped to at least
    /// twice the keep-alive interval).
    #[must_use]
    pub fn new(source: HubSource, options: HubOptions) -> Self {
        Self {
            source,
            registry: Arc::new(ClientRegistry::new()),
            options: options.validated(),
        }
    }

    /// The engine's client-group registry.
    #[must_use]
    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    /// The validated options.
    #[must_use]
    pub fn options(&self) -> &HubOptions {
        &self.options
    }

    /// Drive one connection to completion. Returns once the connection is
    /// fully torn down and its disconnected callback has run.
    pub async fn run_connection(&self, connection_id: String, transport: TransportChannel) {
        let kind = transport.kind();
        let outbound = transport.outbound;
        let mut events = transport.events;
        let format = transport.format;
        let mut inbound = BytesMut::with_capacity(4096);

        // Handshake: a JSON frame selecting the protocol, within the
        // handshake timeout. Failures answer with an error frame and never
        // reach the hub.
        let protocol = match self
            .handshake(&connection_id, kind, &mut events, &mut inbound, &outbound)
            .await
        {
            Some(protocol) => protocol,
            None => return,
        };

        // Tell the transport adapter how protocol frames travel from here
        // on; the handshake itself always went out as text.
        let _ = format.send(protocol.transfer_format());

        info!(
            connection = %connection_id,
            transport = %kind,
            protocol = %protocol.name(),
            "connection established"
        );

        let (message_tx, message_rx) = mpsc::channel(self.options.stream_buffer_capacity);
        let handle = ConnectionHandle::new(
            connection_id.clone(),
            message_tx,
            self.options.overflow_policy,
        );
        let cancel = handle.cancellation();
        self.registry.add(handle.clone());

        let writer = tokio::spawn(write_loop(
            message_rx,
            outbound,
            Arc::clone(&protocol),
            self.options.keep_alive_interval,
            cancel.clone(),
        ));

        let hub = self.source.instance();
        let lifecycle_context = HubContext::new(
            &connection_id,
            self.registry(),
            cancel.clone(),
            cancel.clone(),
        );
        hub.connected(lifecycle_context.clone()).await;

        let state = Arc::new(ConnectionState {
            connection_id: connection_id.clone(),
            hub,
            handle: handle.clone(),
            registry: self.registry(),
            options: self.options.clone(),
            protocol,
            cancel: cancel.clone(),
            uploads: DashMap::new(),
            inflight: DashMap::new(),
        });

        let outcome = read_loop(&state, &mut events, inbound).await;
        debug!(connection = %connection_id, outcome = ?outcome, "connection closing");

        // Closing: answer or announce the close, then stop the timers and
        // cancel whatever is still in flight.
        let close_frame = match &outcome {
            CloseOutcome::PeerClose(_) | CloseOutcome::Aborted => Some(Message::close(None)),
            CloseOutcome::Timeout => Some(Message::close(Some("connection timed out".into()))),
            CloseOutcome::Protocol(e) => Some(Message::close(Some(e.to_string()))),
            CloseOutcome::PeerGone | CloseOutcome::Transport(_) => None,
        };
        if let Some(frame) = close_frame {
            let _ = handle.send_during_close(frame).await;
        }

        // Closed: cancel in-flight invocations, resolve pending futures,
        // end upload pipes, strip group memberships, then notify the hub
        // exactly once.
        cancel.cancel();
        handle.fail_all_pending();
        state.uploads.clear();
        self.registry.remove(&connection_id);
        state.hub.disconnected(lifecycle_context).await;

        drop(state);
        drop(handle);
        let _ = writer.await;

        info!(connection = %connection_id, "connection closed");
    }

    async fn handshake(
        &self,
        connection_id: &str,
        kind: TransportKind,
        events: &mut mpsc::Receiver<TransportEvent>,
        inbound: &mut BytesMut,
        outbound: &mpsc::Sender<Bytes>,
    ) -> Option<Arc<dyn HubProtocol>> {
        let reply_error = |message: String| {
            let outbound = outbound.clone();
            async move {
                let frame = json::encode_handshake_response(&HandshakeResponse::error(message));
                let _ = outbound.send(frame).await;
            }
        };

        let frame = timeout(self.options.handshake_timeout, async {
            loop {
                if let Some(frame) = json::next_text_frame(inbound) {
                    return Some(frame);
                }
                match events.recv().await {
                    Some(TransportEvent::Frame(data)) => inbound.extend_from_slice(&data),
                    Some(TransportEvent::Error(_)) | Some(TransportEvent::Closed) | None => {
                        return None
                    }
                }
            }
        })
        .await;

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(connection = %connection_id, "transport ended before handshake");
                return None;
            }
            Err(_) => {
                warn!(connection = %connection_id, "handshake timed out");
                reply_error("handshake timed out".into()).await;
                return None;
            }
        };

        let request = match json::parse_handshake_request(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "malformed handshake");
                reply_error(format!("malformed handshake: {e}")).await;
                return None;
            }
        };

        if request.version != HANDSHAKE_VERSION {
            reply_error(format!("unsupported handshake version {}", request.version)).await;
            return None;
        }
        let Some(protocol) = protocol_by_name(&request.protocol) else {
            reply_error(format!("unsupported protocol '{}'", request.protocol)).await;
            return None;
        };
        if protocol.transfer_format() == TransferFormat::Binary
            && kind == TransportKind::ServerSentEvents
        {
            reply_error(format!(
                "protocol '{}' requires a binary-capable transport",
                request.protocol
            ))
            .await;
            return None;
        }

        let ok = json::encode_handshake_response(&HandshakeResponse::ok());
        if outbound.send(ok).await.is_err() {
            return None;
        }
        Some(protocol)
    }
}

/// Everything the reader and the per-invocation tasks share.
struct ConnectionState {
    connection_id: String,
    hub: Arc<Hub>,
    handle: ConnectionHandle,
    registry: Arc<ClientRegistry>,
    options: HubOptions,
    protocol: Arc<dyn HubProtocol>,
    /// Connection-lifetime token; in-flight invocations derive from it.
    cancel: CancellationToken,
    /// Upload pipes keyed by stream id, fed by the reader.
    uploads: DashMap<String, mpsc::Sender<StreamFrame>>,
    /// In-flight invocation tokens keyed by invocation id.
    inflight: DashMap<String, CancellationToken>,
}

/// The steady-state reader: decode frames, route them, enforce the
/// inactivity deadline. Never blocks on hub code.
async fn read_loop(
    state: &Arc<ConnectionState>,
    events: &mut mpsc::Receiver<TransportEvent>,
    mut inbound: BytesMut,
) -> CloseOutcome {
    loop {
        loop {
            match state.protocol.decode(&mut inbound) {
                Ok(Some(message)) => {
                    if let Some(outcome) = route(state, message).await {
                        return outcome;
                    }
                }
                Ok(None) => break,
                Err(e) => return CloseOutcome::Protocol(e),
            }
        }

        let event = tokio::select! {
            () = state.cancel.cancelled() => return CloseOutcome::Aborted,
            event = timeout(state.options.timeout_interval, events.recv()) => event,
        };
        match event {
            Err(_) => return CloseOutcome::Timeout,
            Ok(Some(TransportEvent::Frame(data))) => inbound.extend_from_slice(&data),
            Ok(Some(TransportEvent::Error(e))) => return CloseOutcome::Transport(e),
            Ok(Some(TransportEvent::Closed)) | Ok(None) => return CloseOutcome::PeerGone,
        }
    }
}

/// Route one decoded frame. Returns the close outcome once the connection
/// should leave the steady state.
async fn route(state: &Arc<ConnectionState>, message: Message) -> Option<CloseOutcome> {
    match message {
        // Receiving anything already reset the read deadline; a ping needs
        // no reply of its own.
        Message::Ping => None,

        Message::Close { error, .. } => Some(CloseOutcome::PeerClose(error)),

        Message::Invocation {
            invocation_id,
            target,
            arguments,
            stream_ids,
        } => {
            dispatch(state, invocation_id, target, arguments, stream_ids, false);
            None
        }

        Message::StreamInvocation {
            invocation_id,
            target,
            arguments,
            stream_ids,
        } => {
            dispatch(
                state,
                Some(invocation_id),
                target,
                arguments,
                stream_ids,
                true,
            );
            None
        }

        Message::StreamItem {
            invocation_id,
            item,
        } => {
            // Clone the sender out before awaiting; delivery into a full
            // pipe waits, pausing the reader, and that is the upload
            // backpressure bound.
            let pipe = state
                .uploads
                .get(&invocation_id)
                .map(|entry| entry.value().clone());
            match pipe {
                Some(pipe) => {
                    let _ = pipe.send(StreamFrame::Item(item)).await;
                }
                None => {
                    warn!(
                        connection = %state.connection_id,
                        stream = %invocation_id,
                        "stream item for unknown upload stream, discarding"
                    );
                }
            }
            None
        }

        Message::Completion {
            invocation_id,
            result,
            error,
        } => {
            // A completion terminates an upload stream when the id names
            // one; otherwise it answers a server-originated invocation.
            if let Some((_, pipe)) = state.uploads.remove(&invocation_id) {
                let frame = match error {
                    Some(message) => StreamFrame::Failed(message),
                    None => StreamFrame::Completed,
                };
                let _ = pipe.send(frame).await;
            } else {
                let outcome = match error {
                    Some(message) => Err(message),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                if !state.handle.complete(&invocation_id, outcome) {
                    warn!(
                        connection = %state.connection_id,
                        invocation = %invocation_id,
                        "completion for unknown invocation, discarding"
                    );
                }
            }
            None
        }

        Message::CancelInvocation { invocation_id } => {
            if let Some(token) = state.inflight.get(&invocation_id) {
                token.cancel();
            } else {
                debug!(
                    connection = %state.connection_id,
                    invocation = %invocation_id,
                    "cancel for unknown invocation"
                );
            }
            None
        }
    }
}

/// Resolve the target and run the invocation on its own task.
fn dispatch(
    state: &Arc<ConnectionState>,
    invocation_id: Option<String>,
    target: String,
    arguments: Vec<Value>,
    stream_ids: Vec<String>,
    streaming_call: bool,
) {
    let Some(entry) = state.hub.method(&target) else {
        warn!(connection = %state.connection_id, target = %target, "method not found");
        if let Some(id) = invocation_id {
            spawn_completion_error(state, id, DispatchError::MethodNotFound.to_string());
        }
        return;
    };

    if arguments.len() != entry.value_params() {
        let error = DispatchError::BadArity {
            target: target.clone(),
            expected: entry.value_params(),
            got: arguments.len(),
        };
        if let Some(id) = invocation_id {
            spawn_completion_error(state, id, error.to_string());
        }
        return;
    }
    if stream_ids.len() != entry.stream_params() {
        let error = DispatchError::BadStreamArity {
            target: target.clone(),
            expected: entry.stream_params(),
            got: stream_ids.len(),
        };
        if let Some(id) = invocation_id {
            spawn_completion_error(state, id, error.to_string());
        }
        return;
    }

    // Bind one upload pipe per announced stream id, in parameter order.
    let mut sources = Vec::with_capacity(stream_ids.len());
    for stream_id in &stream_ids {
        let (pipe, source) = upload_pipe(state.options.stream_buffer_capacity);
        state.uploads.insert(stream_id.clone(), pipe);
        sources.push(source);
    }

    let token = state.cancel.child_token();
    if let Some(id) = &invocation_id {
        state.inflight.insert(id.clone(), token.clone());
    }
    let context = HubContext::new(
        &state.connection_id,
        Arc::clone(&state.registry),
        state.cancel.clone(),
        token.clone(),
    );

    let entry = entry.clone();
    let state = Arc::clone(state);
    tokio::spawn(async move {
        let request = InvocationRequest {
            target: target.clone(),
            context,
            arguments,
            streams: sources,
        };

        // The method runs on its own task so a panic is isolated from this
        // connection's other invocations.
        let output = match tokio::spawn(async move { entry.invoke(request).await }).await {
            Ok(output) => output,
            Err(e) if e.is_panic() => {
                warn!(
                    connection = %state.connection_id,
                    target = %target,
                    "hub method panicked"
                );
                InvocationOutput::Error(PANIC_COMPLETION_ERROR.into())
            }
            Err(_) => {
                state.invocation_finished(invocation_id.as_deref(), &stream_ids);
                return;
            }
        };

        state
            .deliver_output(invocation_id.as_deref(), &target, streaming_call, output, &token)
            .await;
        state.invocation_finished(invocation_id.as_deref(), &stream_ids);
    });
}

fn spawn_completion_error(state: &Arc<ConnectionState>, invocation_id: String, message: String) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        let _ = state
            .handle
            .send_message(Message::completion_error(invocation_id, message))
            .await;
    });
}

impl ConnectionState {
    /// Emit the frames an invocation's output calls for, honoring the
    /// ordering contract: stream items first, then exactly one completion.
    async fn deliver_output(
        &self,
        invocation_id: Option<&str>,
        target: &str,
        streaming_call: bool,
        output: InvocationOutput,
        token: &CancellationToken,
    ) {
        match output {
            InvocationOutput::Streaming(stream) => {
                let Some(id) = invocation_id else {
                    // Nobody is listening; drain so the producer can finish.
                    discard(stream).await;
                    return;
                };
                if streaming_call {
                    self.forward_stream(id, stream, token).await;
                } else {
                    // A channel-returning method reached through a plain
                    // invocation: collect everything into one completion.
                    self.accumulate_stream(id, stream, token).await;
                }
            }
            InvocationOutput::Value(value) => {
                let Some(id) = invocation_id else { return };
                if token.is_cancelled() {
                    return;
                }
                let message = if streaming_call {
                    Message::completion_error(
                        id,
                        DispatchError::NotStreaming {
                            target: target.to_owned(),
                        }
                        .to_string(),
                    )
                } else {
                    Message::completion_result(id, value)
                };
                let _ = self.handle.send_message(message).await;
            }
            InvocationOutput::Error(message) => {
                match invocation_id {
                    Some(id) if !token.is_cancelled() => {
                        let _ = self
                            .handle
                            .send_message(Message::completion_error(id, message))
                            .await;
                    }
                    Some(_) => {}
                    None => {
                        warn!(
                            connection = %self.connection_id,
                            target = %target,
                            error = %message,
                            "fire-and-forget invocation failed"
                        );
                    }
                }
            }
        }
    }

    async fn forward_stream(
        &self,
        invocation_id: &str,
        mut stream: BoxStream<'static, Value>,
        token: &CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => {
                    // Cancelled: discard whatever the method still produces
                    // and emit nothing further under this id.
                    discard(stream).await;
                    return;
                }
                next = timeout(self.options.chan_receive_timeout, stream.next()) => match next {
                    Ok(Some(item)) => {
                        if self
                            .handle
                            .send_message(Message::stream_item(invocation_id, item))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = self
                            .handle
                            .send_message(Message::completion_done(invocation_id))
                            .await;
                        return;
                    }
                    Err(_) => {
                        let _ = self
                            .handle
                            .send_message(Message::completion_error(
                                invocation_id,
                                "stream timed out producing the next item",
                            ))
                            .await;
                        return;
                    }
                }
            }
        }
    }

    async fn accumulate_stream(
        &self,
        invocation_id: &str,
        mut stream: BoxStream<'static, Value>,
        token: &CancellationToken,
    ) {
        let mut items = Vec::new();
        loop {
            match timeout(self.options.chan_receive_timeout, stream.next()).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => break,
                Err(_) => {
                    if !token.is_cancelled() {
                        let _ = self
                            .handle
                            .send_message(Message::completion_error(
                                invocation_id,
                                "stream timed out producing the next item",
                            ))
                            .await;
                    }
                    return;
                }
            }
        }
        if !token.is_cancelled() {
            let _ = self
                .handle
                .send_message(Message::completion_result(
                    invocation_id,
                    Value::Array(items),
                ))
                .await;
        }
    }

    fn invocation_finished(&self, invocation_id: Option<&str>, stream_ids: &[String]) {
        if let Some(id) = invocation_id {
            self.inflight.remove(id);
        }
        for stream_id in stream_ids {
            self.uploads.remove(stream_id);
        }
    }
}

async fn discard(mut stream: BoxStream<'static, Value>) {
    while stream.next().await.is_some() {}
}

/// The writer: the single task that serializes this connection's outbound
/// frames, pinging when idle past the keep-alive interval. On cancellation
/// it flushes what is already queued and stops.
async fn write_loop(
    mut messages: mpsc::Receiver<Message>,
    outbound: mpsc::Sender<Bytes>,
    protocol: Arc<dyn HubProtocol>,
    keep_alive: Duration,
    cancel: CancellationToken,
) {
    let mut last_write = Instant::now();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                // Flush frames queued around the cancellation (the close
                // frame in particular), then stop.
                loop {
                    match timeout(Duration::from_millis(100), messages.recv()).await {
                        Ok(Some(message)) => {
                            if !write_frame(&outbound, protocol.as_ref(), &message).await {
                                return;
                            }
                        }
                        Ok(None) | Err(_) => return,
                    }
                }
            }
            message = messages.recv() => {
                let Some(message) = message else { return };
                if !write_frame(&outbound, protocol.as_ref(), &message).await {
                    return;
                }
                last_write = Instant::now();
            }
            () = sleep_until(last_write + keep_alive) => {
                if !write_frame(&outbound, protocol.as_ref(), &Message::Ping).await {
                    return;
                }
                last_write = Instant::now();
            }
        }
    }
}

async fn write_frame(
    outbound: &mpsc::Sender<Bytes>,
    protocol: &dyn HubProtocol,
    message: &Message,
) -> bool {
    match protocol.encode(message) {
        Ok(frame) => outbound.send(frame).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "dropping unencodable outbound frame");
            true
        }
    }
}
