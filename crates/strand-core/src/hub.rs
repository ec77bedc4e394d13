//! Hub construction and the method registry.
//!
//! A hub is built once, at server construction, by registering each exposed
//! method under its name. Registration wraps the typed method into a uniform
//! invoker and records a descriptor (parameter counts, context flag, result
//! kind) that the dispatcher consults before calling. Lookup is O(1) on the
//! canonical lowercase name.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::context::HubContext;
use crate::handler::{HandlerSpec, HubHandler};
use crate::streams::{UploadSource, ValueStream};

/// Names that can never be registered as hub methods.
const RESERVED_NAMES: [&str; 3] = ["onconnected", "ondisconnected", "abort"];

/// What a method produces, as recorded at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// A single value (possibly unit or a tuple serialized as an array).
    Single,
    /// A channel of values: stream items followed by one completion.
    Streaming,
}

/// The uniform result of a wrapped method invocation.
pub enum InvocationOutput {
    /// The method's single serialized result; `Value::Null` for unit.
    Value(Value),
    /// The method failed; the string becomes the completion error.
    Error(String),
    /// The method returned a stream to forward item by item.
    Streaming(ValueStream),
}

impl std::fmt::Debug for InvocationOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationOutput::Value(value) => f.debug_tuple("Value").field(value).finish(),
            InvocationOutput::Error(message) => f.debug_tuple("Error").field(message).finish(),
            InvocationOutput::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

/// Everything a wrapped method needs to run once.
pub struct InvocationRequest {
    /// The target as the caller spelled it, for error messages.
    pub target: String,
    pub context: HubContext,
    pub arguments: Vec<Value>,
    /// Upload pipes bound from the invocation's stream ids, in order.
    pub streams: Vec<UploadSource>,
}

type MethodFn = Arc<dyn Fn(InvocationRequest) -> BoxFuture<'static, InvocationOutput> + Send + Sync>;
type LifecycleFn = Arc<dyn Fn(HubContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// One registered method: its descriptor plus the invoker.
#[derive(Clone)]
pub struct MethodEntry {
    name: String,
    spec: HandlerSpec,
    invoke: MethodFn,
}

impl MethodEntry {
    /// The name the method was registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of parameters decoded from `arguments`.
    #[must_use]
    pub fn value_params(&self) -> usize {
        self.spec.value_params
    }

    /// Number of upload-stream parameters bound from `streamIds`.
    #[must_use]
    pub fn stream_params(&self) -> usize {
        self.spec.stream_params
    }

    /// Whether the method takes the connection context.
    #[must_use]
    pub fn takes_context(&self) -> bool {
        self.spec.takes_context
    }

    /// What the method produces.
    #[must_use]
    pub fn result_kind(&self) -> ResultKind {
        self.spec.result
    }

    /// Run the method.
    pub fn invoke(&self, request: InvocationRequest) -> BoxFuture<'static, InvocationOutput> {
        (self.invoke)(request)
    }
}

impl std::fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodEntry")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// A hub: the set of methods a server (or a client receiver) exposes to its
/// peer, plus optional lifecycle callbacks.
#[derive(Default)]
pub struct Hub {
    methods: HashMap<String, MethodEntry>,
    on_connected: Option<LifecycleFn>,
    on_disconnected: Option<LifecycleFn>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Start building a hub.
    #[must_use]
    pub fn builder() -> HubBuilder {
        HubBuilder::default()
    }

    /// Case-insensitive method lookup.
    #[must_use]
    pub fn method(&self, target: &str) -> Option<&MethodEntry> {
        self.methods.get(target.to_lowercase().as_str())
    }

    /// Registered method names, in registration casing.
    #[must_use]
    pub fn method_names(&self) -> Vec<&str> {
        self.methods.values().map(|entry| entry.name()).collect()
    }

    /// Run the connected callback, if any.
    pub async fn connected(&self, context: HubContext) {
        if let Some(callback) = &self.on_connected {
            callback(context).await;
        }
    }

    /// Run the disconnected callback, if any.
    pub async fn disconnected(&self, context: HubContext) {
        if let Some(callback) = &self.on_disconnected {
            callback(context).await;
        }
    }
}

/// Builder for [`Hub`].
///
/// Registration is a construction-time concern; invalid registrations
/// (reserved or duplicate names) panic with a descriptive message rather
/// than surfacing at dispatch time.
#[derive(Default)]
pub struct HubBuilder {
    methods: HashMap<String, MethodEntry>,
    on_connected: Option<LifecycleFn>,
    on_disconnected: Option<LifecycleFn>,
}

impl HubBuilder {
    /// Register a method under `name` (matched case-insensitively).
    ///
    /// # Panics
    ///
    /// Panics if the name is reserved or already registered.
    #[must_use]
    pub fn method<M, H>(mut self, name: &str, handler: H) -> Self
    where
        H: HubHandler<M>,
    {
        let key = name.to_lowercase();
        assert!(
            !RESERVED_NAMES.contains(&key.as_str()),
            "'{name}' is a reserved hub method name"
        );
        let entry = MethodEntry {
            name: name.to_owned(),
            spec: H::spec(),
            invoke: Arc::new(move |request| handler.call(request)),
        };
        assert!(
            self.methods.insert(key, entry).is_none(),
            "hub method '{name}' registered twice"
        );
        self
    }

    /// Set the callback run after a connection completes its handshake.
    #[must_use]
    pub fn on_connected<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(HubContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_connected = Some(Arc::new(move |context| Box::pin(callback(context))));
        self
    }

    /// Set the callback run exactly once when a connection goes away.
    #[must_use]
    pub fn on_disconnected<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(HubContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_disconnected = Some(Arc::new(move |context| Box::pin(callback(context))));
        self
    }

    /// Finish the hub.
    #[must_use]
    pub fn build(self) -> Hub {
        Hub {
            methods: self.methods,
            on_connected: self.on_connected,
            on_disconnected: self.on_disconnected,
        }
    }
}

/// Where connection hubs come from: one shared instance, or a fresh hub per
/// connection (whose lifetime then equals the connection's).
#[derive(Clone)]
pub enum HubSource {
    Singleton(Arc<Hub>),
    PerConnection(Arc<dyn Fn() -> Hub + Send + Sync>),
}

impl std::fmt::Debug for HubSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubSource::Singleton(_) => f.write_str("HubSource::Singleton"),
            HubSource::PerConnection(_) => f.write_str("HubSource::PerConnection"),
        }
    }
}

impl HubSource {
    /// Share one hub across every connection.
    #[must_use]
    pub fn singleton(hub: Hub) -> Self {
        HubSource::Singleton(Arc::new(hub))
    }

    /// Build a fresh hub for each connection.
    #[must_use]
    pub fn per_connection<F>(factory: F) -> Self
    where
        F: Fn() -> Hub + Send + Sync + 'static,
    {
        HubSource::PerConnection(Arc::new(factory))
    }

    /// The hub instance for a new connection.
    #[must_use]
    pub fn instance(&self) -> Arc<Hub> {
        match self {
            HubSource::Singleton(hub) => Arc::clone(hub),
            HubSource::PerConnection(factory) => Arc::new(factory()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::ServerStream;
    use serde_json::json;

    fn sample_hub() -> Hub {
        Hub::builder()
            .method("Echo", |message: String| async move { message })
            .method("Add", |a: i64, b: i64| async move { a + b })
            .method("Ticks", |count: usize| async move {
                let (tx, stream) = ServerStream::channel(4);
                tokio::spawn(async move {
                    for tick in 0..count {
                        if tx.send(tick).await.is_err() {
                            break;
                        }
                    }
                });
                stream
            })
            .build()
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let hub = sample_hub();
        assert!(hub.method("echo").is_some());
        assert!(hub.method("ECHO").is_some());
        assert!(hub.method("missing").is_none());
        assert_eq!(hub.method("echo").unwrap().name(), "Echo");
    }

    #[test]
    fn test_descriptors_record_shape() {
        let hub = sample_hub();
        let add = hub.method("add").unwrap();
        assert_eq!(add.value_params(), 2);
        assert_eq!(add.stream_params(), 0);
        assert!(!add.takes_context());
        assert_eq!(add.result_kind(), ResultKind::Single);

        let ticks = hub.method("ticks").unwrap();
        assert_eq!(ticks.result_kind(), ResultKind::Streaming);
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn test_reserved_names_rejected() {
        let _ = Hub::builder().method("OnConnected", || async {});
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_names_rejected() {
        let _ = Hub::builder()
            .method("Echo", |message: String| async move { message })
            .method("echo", |message: String| async move { message });
    }

    #[tokio::test]
    async fn test_invoke_through_entry() {
        let hub = sample_hub();
        let entry = hub.method("add").unwrap();
        let request = InvocationRequest {
            target: "add".into(),
            context: HubContext::detached("test"),
            arguments: vec![json!(2), json!(3)],
            streams: Vec::new(),
        };
        match entry.invoke(request).await {
            InvocationOutput::Value(value) => assert_eq!(value, json!(5)),
            other => panic!("unexpected output: {other:?}"),
        }
    }
}
