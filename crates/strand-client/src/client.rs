//! The hub client: negotiate, connect, handshake, and the mirror of the
//! server's invocation loop from the other side of the wire.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strand_core::{Hub, HubContext, InvocationOutput, InvocationRequest};
use strand_protocol::{
    json, protocol_by_name, HandshakeRequest, HubProtocol, Message, NegotiateResponse,
};
use strand_transport::{websocket, TransportEvent};

use crate::error::ClientError;
use crate::reconnect::ReconnectPolicy;

/// Client configuration, fixed at build time.
#[derive(Debug, Clone)]
struct ClientConfig {
    url: String,
    protocol: String,
    access_token: Option<String>,
    keep_alive_interval: Duration,
    timeout_interval: Duration,
    handshake_timeout: Duration,
    buffer_capacity: usize,
    reconnect: ReconnectPolicy,
}

/// Builder for [`Client`].
#[derive(Debug)]
pub struct ClientBuilder {
    config: ClientConfig,
    receiver: Option<Hub>,
}

impl ClientBuilder {
    fn new(url: impl Into<String>) -> Self {
        Self {
            config: ClientConfig {
                url: url.into(),
                protocol: "json".to_owned(),
                access_token: None,
                keep_alive_interval: Duration::from_secs(15),
                timeout_interval: Duration::from_secs(30),
                handshake_timeout: Duration::from_secs(15),
                buffer_capacity: 32,
                reconnect: ReconnectPolicy::default(),
            },
            receiver: None,
        }
    }

    /// Wire protocol to hand-shake (`"json"` or `"messagepack"`).
    #[must_use]
    pub fn protocol(mut self, name: impl Into<String>) -> Self {
        self.config.protocol = name.into();
        self
    }

    /// Bearer token sent on negotiate and transport requests.
    #[must_use]
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.config.access_token = Some(token.into());
        self
    }

    /// The receiver hub: its methods are the targets the server can invoke
    /// on this client.
    #[must_use]
    pub fn receiver(mut self, receiver: Hub) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Outgoing ping cadence when idle.
    #[must_use]
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    /// Inbound inactivity deadline. Should match or exceed the server's.
    #[must_use]
    pub fn timeout_interval(mut self, interval: Duration) -> Self {
        self.config.timeout_interval = interval;
        self
    }

    /// Protocol handshake deadline.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Reconnect behavior after a lost transport.
    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Writer queue and buffer bound.
    #[must_use]
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_capacity = capacity.max(1);
        self
    }

    /// Finish the client. Call [`Client::start`] to connect.
    #[must_use]
    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                config: self.config,
                http: reqwest::Client::new(),
                receiver: self.receiver.map(Arc::new),
                pending: DashMap::new(),
                pull_streams: DashMap::new(),
                uploads: DashMap::new(),
                session: RwLock::new(None),
                stopped: CancellationToken::new(),
            }),
        }
    }
}

/// Why a session ended.
#[derive(Debug)]
enum SessionEnd {
    /// The server sent a close frame; reconnect only if it allowed one.
    Close { reconnect: bool },
    /// No inbound traffic within the timeout interval.
    Timeout,
    /// The transport dropped or errored.
    Transport,
    /// [`Client::stop`] was called.
    Stopped,
}

struct SessionHandle {
    connection_id: String,
    messages: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

struct ClientInner {
    config: ClientConfig,
    http: reqwest::Client,
    receiver: Option<Arc<Hub>>,
    /// Invocations awaiting a completion.
    pending: DashMap<String, oneshot::Sender<Result<Value, ClientError>>>,
    /// Stream invocations and their item sinks.
    pull_streams: DashMap<String, mpsc::Sender<Result<Value, ClientError>>>,
    /// Upload pipes for server-pushed streams, keyed by stream id.
    uploads: DashMap<String, mpsc::Sender<strand_core::streams::StreamFrame>>,
    session: RwLock<Option<SessionHandle>>,
    stopped: CancellationToken,
}

/// A connected hub client.
///
/// Cloning is cheap; all clones share one session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.inner.config.url)
            .field("connection_id", &self.connection_id())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Start building a client for the hub at `url`.
    #[must_use]
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    /// Negotiate, connect the transport, perform the protocol handshake,
    /// and spawn the reader/writer/pacer tasks. On later transport loss the
    /// client reconnects per its policy, negotiating a fresh connection id.
    ///
    /// # Errors
    ///
    /// Returns an error if the first connection cannot be established.
    pub async fn start(&self) -> Result<(), ClientError> {
        if self.connection_id().is_some() {
            return Ok(());
        }
        let reader = connect_once(&self.inner).await?;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(supervise(inner, reader));
        Ok(())
    }

    /// The current session's connection id, if connected.
    #[must_use]
    pub fn connection_id(&self) -> Option<String> {
        self.inner
            .session
            .read()
            .ok()
            .and_then(|session| session.as_ref().map(|s| s.connection_id.clone()))
    }

    /// Fire-and-forget invocation.
    ///
    /// # Errors
    ///
    /// Fails if no session is established or the writer queue is gone.
    pub async fn send(&self, target: &str, arguments: Vec<Value>) -> Result<(), ClientError> {
        self.enqueue(Message::send(target, arguments)).await
    }

    /// Invoke a hub method and await its typed result.
    ///
    /// # Errors
    ///
    /// Resolves with the server's error, a cancellation if the session dies
    /// first, or a decode error for the wrong result type.
    pub async fn invoke<T: DeserializeOwned>(
        &self,
        target: &str,
        arguments: Vec<Value>,
    ) -> Result<T, ClientError> {
        let value = self.invoke_value(target, arguments).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Invoke a hub method and await its raw result.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`invoke`](Self::invoke), without decoding.
    pub async fn invoke_value(
        &self,
        target: &str,
        arguments: Vec<Value>,
    ) -> Result<Value, ClientError> {
        let invocation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(invocation_id.clone(), tx);

        let message = Message::invocation(invocation_id.clone(), target, arguments);
        if let Err(e) = self.enqueue(message).await {
            self.inner.pending.remove(&invocation_id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Canceled),
        }
    }

    /// Issue a stream invocation and pull its items. The receiver yields
    /// each stream item and ends at the terminating completion; a
    /// completion error arrives as a final `Err` item.
    ///
    /// # Errors
    ///
    /// Fails if no session is established.
    pub async fn pull_stream(
        &self,
        target: &str,
        arguments: Vec<Value>,
    ) -> Result<mpsc::Receiver<Result<Value, ClientError>>, ClientError> {
        let invocation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.inner.config.buffer_capacity);
        self.inner.pull_streams.insert(invocation_id.clone(), tx);

        let message = Message::stream_invocation(invocation_id.clone(), target, arguments);
        if let Err(e) = self.enqueue(message).await {
            self.inner.pull_streams.remove(&invocation_id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Cancel an in-flight stream invocation by dropping its receiver and
    /// telling the server.
    ///
    /// # Errors
    ///
    /// Fails if no session is established.
    pub async fn cancel(&self, invocation_id: &str) -> Result<(), ClientError> {
        self.inner.pull_streams.remove(invocation_id);
        self.enqueue(Message::cancel_invocation(invocation_id)).await
    }

    /// Close the session and stop reconnecting.
    pub async fn stop(&self) {
        self.inner.stopped.cancel();
        let _ = self.enqueue(Message::close(None)).await;
        // Give the writer a moment to flush the close frame.
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(session) = self.inner.session.write().ok().and_then(|mut s| s.take()) {
            session.cancel.cancel();
        }
        clear_session(&self.inner);
    }

    async fn enqueue(&self, message: Message) -> Result<(), ClientError> {
        let sender = self
            .inner
            .session
            .read()
            .ok()
            .and_then(|session| session.as_ref().map(|s| s.messages.clone()))
            .ok_or(ClientError::NotConnected)?;
        sender
            .send(message)
            .await
            .map_err(|_| ClientError::NotConnected)
    }
}

/// Negotiate, attach the WebSocket transport, handshake, and spawn the
/// session tasks. Returns the reader task, whose result says how the
/// session ended.
async fn connect_once(
    inner: &Arc<ClientInner>,
) -> Result<tokio::task::JoinHandle<SessionEnd>, ClientError> {
    let config = &inner.config;
    let protocol = protocol_by_name(&config.protocol)
        .ok_or_else(|| ClientError::UnsupportedProtocol(config.protocol.clone()))?;

    // Negotiate.
    let base = config.url.trim_end_matches('/');
    let mut request = inner
        .http
        .post(format!("{base}/negotiate?negotiateVersion=1"));
    if let Some(token) = &config.access_token {
        request = request.bearer_auth(token);
    }
    let negotiate: NegotiateResponse = request
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    debug!(connection = %negotiate.connection_id, "negotiated");

    // Transport.
    let mut ws_url = url::Url::parse(base)?;
    let scheme = if ws_url.scheme() == "https" { "wss" } else { "ws" };
    let _ = ws_url.set_scheme(scheme);
    ws_url
        .query_pairs_mut()
        .append_pair("id", negotiate.transport_token());
    if let Some(token) = &config.access_token {
        ws_url.query_pairs_mut().append_pair("access_token", token);
    }
    let transport = websocket::connect(
        ws_url.as_str(),
        protocol.transfer_format(),
        config.buffer_capacity,
    )
    .await?;
    let outbound = transport.outbound;
    let mut events = transport.events;

    // Handshake.
    let request = HandshakeRequest {
        protocol: protocol.name().to_owned(),
        version: 1,
    };
    outbound
        .send(json::encode_handshake_request(&request))
        .await
        .map_err(|_| ClientError::Handshake("transport closed during handshake".into()))?;

    let mut inbound = BytesMut::with_capacity(4096);
    let reply = timeout(config.handshake_timeout, async {
        loop {
            if let Some(frame) = json::next_text_frame(&mut inbound) {
                return Some(frame);
            }
            match events.recv().await {
                Some(TransportEvent::Frame(data)) => inbound.extend_from_slice(&data),
                _ => return None,
            }
        }
    })
    .await
    .map_err(|_| ClientError::Handshake("handshake timed out".into()))?
    .ok_or_else(|| ClientError::Handshake("transport closed during handshake".into()))?;

    let reply = json::parse_handshake_response(&reply)?;
    if let Some(error) = reply.error {
        return Err(ClientError::Handshake(error));
    }

    // Session established: install the writer queue and spawn the tasks.
    let (message_tx, message_rx) = mpsc::channel(config.buffer_capacity);
    let cancel = CancellationToken::new();
    if let Ok(mut session) = inner.session.write() {
        *session = Some(SessionHandle {
            connection_id: negotiate.connection_id.clone(),
            messages: message_tx,
            cancel: cancel.clone(),
        });
    }

    info!(connection = %negotiate.connection_id, protocol = %protocol.name(), "connected");

    tokio::spawn(write_loop(
        message_rx,
        outbound,
        Arc::clone(&protocol),
        config.keep_alive_interval,
        cancel.clone(),
    ));

    let reader_inner = Arc::clone(inner);
    Ok(tokio::spawn(read_loop(
        reader_inner,
        events,
        inbound,
        protocol,
        cancel,
    )))
}

/// Reconnect supervision: await the session's end, clear state, and retry
/// with exponential backoff when the policy allows.
async fn supervise(inner: Arc<ClientInner>, mut reader: tokio::task::JoinHandle<SessionEnd>) {
    loop {
        let end = reader.await.unwrap_or(SessionEnd::Transport);
        clear_session(&inner);

        match end {
            SessionEnd::Stopped | SessionEnd::Close { reconnect: false } => return,
            SessionEnd::Close { reconnect: true }
            | SessionEnd::Timeout
            | SessionEnd::Transport => {}
        }
        if inner.stopped.is_cancelled() || !inner.config.reconnect.enabled {
            return;
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let max = inner.config.reconnect.max_attempts;
            if max != 0 && attempt > max {
                warn!(attempts = attempt - 1, "giving up on reconnecting");
                return;
            }
            tokio::time::sleep(inner.config.reconnect.delay_for_attempt(attempt)).await;
            if inner.stopped.is_cancelled() {
                return;
            }
            match connect_once(&inner).await {
                Ok(new_reader) => {
                    reader = new_reader;
                    break;
                }
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "reconnect attempt failed");
                }
            }
        }
    }
}

fn clear_session(inner: &Arc<ClientInner>) {
    if let Ok(mut session) = inner.session.write() {
        if let Some(session) = session.take() {
            session.cancel.cancel();
        }
    }

    let pending: Vec<String> = inner.pending.iter().map(|e| e.key().clone()).collect();
    for id in pending {
        if let Some((_, tx)) = inner.pending.remove(&id) {
            let _ = tx.send(Err(ClientError::Canceled));
        }
    }
    inner.pull_streams.clear();
    inner.uploads.clear();
}

/// The client-side reader: mirror of the server's routing table.
async fn read_loop(
    inner: Arc<ClientInner>,
    mut events: mpsc::Receiver<TransportEvent>,
    mut inbound: BytesMut,
    protocol: Arc<dyn HubProtocol>,
    cancel: CancellationToken,
) -> SessionEnd {
    loop {
        loop {
            match protocol.decode(&mut inbound) {
                Ok(Some(message)) => {
                    if let Some(end) = route(&inner, message).await {
                        return end;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "undecodable frame from server");
                    return SessionEnd::Transport;
                }
            }
        }

        let event = tokio::select! {
            () = cancel.cancelled() => return SessionEnd::Stopped,
            event = timeout(inner.config.timeout_interval, events.recv()) => event,
        };
        match event {
            Err(_) => {
                warn!("server went silent past the timeout interval");
                return SessionEnd::Timeout;
            }
            Ok(Some(TransportEvent::Frame(data))) => inbound.extend_from_slice(&data),
            Ok(Some(TransportEvent::Error(e))) => {
                warn!(error = %e, "transport error");
                return SessionEnd::Transport;
            }
            Ok(Some(TransportEvent::Closed)) | Ok(None) => return SessionEnd::Transport,
        }
    }
}

async fn route(inner: &Arc<ClientInner>, message: Message) -> Option<SessionEnd> {
    match message {
        Message::Ping => None,

        Message::Close {
            error,
            allow_reconnect,
        } => {
            if let Some(error) = &error {
                warn!(error = %error, "server closed the connection");
            }
            Some(SessionEnd::Close {
                reconnect: allow_reconnect.unwrap_or(false),
            })
        }

        Message::Invocation {
            invocation_id,
            target,
            arguments,
            stream_ids,
        } => {
            dispatch_receiver(inner, invocation_id, target, arguments, stream_ids, false);
            None
        }

        Message::StreamInvocation {
            invocation_id,
            target,
            arguments,
            stream_ids,
        } => {
            dispatch_receiver(
                inner,
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
            if let Some(sink) = inner
                .pull_streams
                .get(&invocation_id)
                .map(|e| e.value().clone())
            {
                let _ = sink.send(Ok(item)).await;
            } else if let Some(pipe) = inner.uploads.get(&invocation_id).map(|e| e.value().clone())
            {
                let _ = pipe
                    .send(strand_core::streams::StreamFrame::Item(item))
                    .await;
            } else {
                debug!(stream = %invocation_id, "stream item for unknown stream");
            }
            None
        }

        Message::Completion {
            invocation_id,
            result,
            error,
        } => {
            if let Some((_, tx)) = inner.pending.remove(&invocation_id) {
                let outcome = match error {
                    Some(message) => Err(ClientError::Hub(message)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            } else if let Some((_, sink)) = inner.pull_streams.remove(&invocation_id) {
                if let Some(message) = error {
                    let _ = sink.send(Err(ClientError::Hub(message))).await;
                }
                // Dropping the sink ends the pull sequence.
            } else if let Some((_, pipe)) = inner.uploads.remove(&invocation_id) {
                let frame = match error {
                    Some(message) => strand_core::streams::StreamFrame::Failed(message),
                    None => strand_core::streams::StreamFrame::Completed,
                };
                let _ = pipe.send(frame).await;
            } else {
                debug!(invocation = %invocation_id, "completion for unknown invocation");
            }
            None
        }

        Message::CancelInvocation { invocation_id } => {
            debug!(invocation = %invocation_id, "server-side cancellation ignored");
            None
        }
    }
}

/// Dispatch a server-initiated invocation to the receiver hub.
fn dispatch_receiver(
    inner: &Arc<ClientInner>,
    invocation_id: Option<String>,
    target: String,
    arguments: Vec<Value>,
    stream_ids: Vec<String>,
    streaming_call: bool,
) {
    let Some(receiver) = inner.receiver.as_ref().map(Arc::clone) else {
        debug!(target = %target, "no receiver registered, dropping invocation");
        return;
    };
    let Some(entry) = receiver.method(&target) else {
        warn!(target = %target, "receiver method not found");
        if let Some(id) = invocation_id {
            spawn_reply(inner, Message::completion_error(id, "Method not found"));
        }
        return;
    };
    if arguments.len() != entry.value_params() || stream_ids.len() != entry.stream_params() {
        warn!(target = %target, "receiver argument mismatch");
        if let Some(id) = invocation_id {
            spawn_reply(
                inner,
                Message::completion_error(id, format!("invalid arguments for '{target}'")),
            );
        }
        return;
    }

    let mut sources = Vec::with_capacity(stream_ids.len());
    for stream_id in &stream_ids {
        let (pipe, source) = strand_core::streams::upload_pipe(inner.config.buffer_capacity);
        inner.uploads.insert(stream_id.clone(), pipe);
        sources.push(source);
    }

    let connection_id = inner
        .session
        .read()
        .ok()
        .and_then(|s| s.as_ref().map(|s| s.connection_id.clone()))
        .unwrap_or_default();

    let entry = entry.clone();
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let request = InvocationRequest {
            target,
            context: HubContext::detached(connection_id),
            arguments,
            streams: sources,
        };
        let output = entry.invoke(request).await;

        match (invocation_id, output) {
            (Some(id), InvocationOutput::Value(value)) => {
                let message = if streaming_call {
                    Message::completion_error(id, "method does not return a stream")
                } else {
                    Message::completion_result(id, value)
                };
                reply(&inner, message).await;
            }
            (Some(id), InvocationOutput::Error(message)) => {
                reply(&inner, Message::completion_error(id, message)).await;
            }
            (Some(id), InvocationOutput::Streaming(mut stream)) => {
                use futures_util::StreamExt;
                if streaming_call {
                    while let Some(item) = stream.next().await {
                        reply(&inner, Message::stream_item(id.clone(), item)).await;
                    }
                    reply(&inner, Message::completion_done(id)).await;
                } else {
                    let mut items = Vec::new();
                    while let Some(item) = stream.next().await {
                        items.push(item);
                    }
                    reply(&inner, Message::completion_result(id, Value::Array(items))).await;
                }
            }
            (None, InvocationOutput::Error(message)) => {
                warn!(error = %message, "receiver method failed");
            }
            (None, _) => {}
        }

        for stream_id in stream_ids {
            inner.uploads.remove(&stream_id);
        }
    });
}

fn session_sender(inner: &Arc<ClientInner>) -> Option<mpsc::Sender<Message>> {
    inner
        .session
        .read()
        .ok()
        .and_then(|s| s.as_ref().map(|s| s.messages.clone()))
}

/// Queue one frame on the current session, in the caller's task so frame
/// order within an invocation is preserved.
async fn reply(inner: &Arc<ClientInner>, message: Message) {
    if let Some(sender) = session_sender(inner) {
        let _ = sender.send(message).await;
    }
}

/// Queue one frame from a context that cannot await.
fn spawn_reply(inner: &Arc<ClientInner>, message: Message) {
    if let Some(sender) = session_sender(inner) {
        tokio::spawn(async move {
            let _ = sender.send(message).await;
        });
    }
}

/// The client writer: single owner of the outbound transport queue, pinging
/// when idle past the keep-alive interval.
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
                while let Ok(message) = messages.try_recv() {
                    if !write_frame(&outbound, protocol.as_ref(), &message).await {
                        return;
                    }
                }
                return;
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
