//! The client API available inside hub method bodies.
//!
//! A [`HubContext`] is handed to every invocation (and lifecycle callback)
//! that declares it. It exposes the caller's identity, cooperative
//! cancellation, the fan-out proxies, and group management.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::ConnectionHandle;
use crate::error::{ConnectionError, InvokeError};
use crate::registry::{ClientRegistry, RegistryError};
use crate::streams::ValueStream;

/// Per-invocation view of a connection, passed to hub methods that declare
/// a leading context parameter.
#[derive(Clone)]
pub struct HubContext {
    connection_id: String,
    registry: Arc<ClientRegistry>,
    connection_cancel: CancellationToken,
    invocation_cancel: CancellationToken,
}

impl std::fmt::Debug for HubContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubContext")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl HubContext {
    pub(crate) fn new(
        connection_id: impl Into<String>,
        registry: Arc<ClientRegistry>,
        connection_cancel: CancellationToken,
        invocation_cancel: CancellationToken,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            registry,
            connection_cancel,
            invocation_cancel,
        }
    }

    /// A context with no connections behind it. Client receivers and tests
    /// use this; every fan-out is a no-op.
    #[must_use]
    pub fn detached(connection_id: impl Into<String>) -> Self {
        let token = CancellationToken::new();
        Self::new(
            connection_id,
            Arc::new(ClientRegistry::new()),
            token.clone(),
            token,
        )
    }

    /// The calling connection's id.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// This invocation's cancellation token. Cancelled by an explicit peer
    /// cancellation or by connection teardown; observation is cooperative.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.invocation_cancel.clone()
    }

    /// The fan-out proxies.
    #[must_use]
    pub fn clients(&self) -> Clients {
        Clients {
            registry: Arc::clone(&self.registry),
            caller_id: self.connection_id.clone(),
        }
    }

    /// Group management.
    #[must_use]
    pub fn groups(&self) -> Groups {
        Groups {
            registry: Arc::clone(&self.registry),
        }
    }

    /// Tear down the calling connection.
    pub fn abort(&self) {
        debug!(connection = %self.connection_id, "hub requested abort");
        self.connection_cancel.cancel();
    }
}

/// Entry point for choosing fan-out targets.
#[derive(Debug, Clone)]
pub struct Clients {
    registry: Arc<ClientRegistry>,
    caller_id: String,
}

impl Clients {
    /// The calling connection.
    #[must_use]
    pub fn caller(&self) -> ClientProxy {
        self.client(self.caller_id.clone())
    }

    /// One specific connection; sends are no-ops if it is gone.
    #[must_use]
    pub fn client(&self, connection_id: impl Into<String>) -> ClientProxy {
        ClientProxy {
            registry: Arc::clone(&self.registry),
            target: Target::Connection(connection_id.into()),
        }
    }

    /// Every connection the registry currently lists.
    #[must_use]
    pub fn all(&self) -> ClientProxy {
        ClientProxy {
            registry: Arc::clone(&self.registry),
            target: Target::All { except: Vec::new() },
        }
    }

    /// Every connection except the given ids.
    #[must_use]
    pub fn all_except(&self, excluded: impl IntoIterator<Item = String>) -> ClientProxy {
        ClientProxy {
            registry: Arc::clone(&self.registry),
            target: Target::All {
                except: excluded.into_iter().collect(),
            },
        }
    }

    /// All members of a group.
    #[must_use]
    pub fn group(&self, name: impl Into<String>) -> ClientProxy {
        ClientProxy {
            registry: Arc::clone(&self.registry),
            target: Target::Group {
                name: name.into(),
                except: Vec::new(),
            },
        }
    }

    /// All members of a group except the given ids.
    #[must_use]
    pub fn group_except(
        &self,
        name: impl Into<String>,
        excluded: impl IntoIterator<Item = String>,
    ) -> ClientProxy {
        ClientProxy {
            registry: Arc::clone(&self.registry),
            target: Target::Group {
                name: name.into(),
                except: excluded.into_iter().collect(),
            },
        }
    }
}

#[derive(Debug, Clone)]
enum Target {
    Connection(String),
    All { except: Vec<String> },
    Group { name: String, except: Vec<String> },
}

/// A send/invoke surface over one fan-out target.
#[derive(Debug, Clone)]
pub struct ClientProxy {
    registry: Arc<ClientRegistry>,
    target: Target,
}

impl ClientProxy {
    /// Snapshot the live handles behind this target. Members that vanished
    /// since the snapshot are skipped at delivery time.
    fn resolve(&self) -> Vec<ConnectionHandle> {
        match &self.target {
            Target::Connection(id) => self.registry.get(id).into_iter().collect(),
            Target::All { except } => self
                .registry
                .all_ids()
                .into_iter()
                .filter(|id| !except.contains(id))
                .filter_map(|id| self.registry.get(&id))
                .collect(),
            Target::Group { name, except } => self
                .registry
                .group_members(name)
                .into_iter()
                .filter(|id| !except.contains(id))
                .filter_map(|id| self.registry.get(&id))
                .collect(),
        }
    }

    /// Fire-and-forget invocation on every resolved target. Dead targets
    /// are silently skipped; fan-out never fails because a member died.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Backpressure`] if any target's writer
    /// queue rejected the frame under the fail-fast overflow policy; the
    /// remaining targets were still attempted.
    pub async fn send(&self, target: &str, arguments: Vec<Value>) -> Result<(), ConnectionError> {
        let mut backpressured = false;
        for handle in self.resolve() {
            match handle.send(target, arguments.clone()).await {
                Ok(()) | Err(ConnectionError::Closed) => {}
                Err(ConnectionError::Backpressure) => backpressured = true,
                Err(e) => return Err(e),
            }
        }
        if backpressured {
            Err(ConnectionError::Backpressure)
        } else {
            Ok(())
        }
    }

    /// Invoke a method on a single connection and await its completion.
    ///
    /// # Errors
    ///
    /// Fails with [`InvokeError::NotSingle`] for group or broadcast
    /// targets, [`InvokeError::Unreachable`] if the connection is gone, or
    /// the peer's own error.
    pub async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Value, InvokeError> {
        let Target::Connection(id) = &self.target else {
            return Err(InvokeError::NotSingle);
        };
        let Some(handle) = self.registry.get(id) else {
            return Err(InvokeError::Unreachable);
        };
        handle.invoke(target, arguments).await
    }

    /// Push server-to-client streams at every resolved target. With more
    /// than one recipient, items are duplicated to each.
    ///
    /// # Errors
    ///
    /// Fails only if no announcing frame could be queued anywhere.
    pub async fn push_streams(
        &self,
        target: &str,
        streams: Vec<ValueStream>,
    ) -> Result<(), ConnectionError> {
        let handles = self.resolve();
        match handles.len() {
            0 => Ok(()),
            1 => {
                let handle = &handles[0];
                match handle.push_streams(target, streams).await {
                    Ok(()) | Err(ConnectionError::Closed) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            _ => {
                // Duplicate each stream into one bounded pipe per recipient.
                let mut per_handle: Vec<Vec<ValueStream>> =
                    handles.iter().map(|_| Vec::new()).collect();
                for mut stream in streams {
                    let mut senders = Vec::with_capacity(handles.len());
                    for streams_of_handle in &mut per_handle {
                        let (tx, rx) = mpsc::channel::<Value>(16);
                        senders.push(tx);
                        streams_of_handle.push(ReceiverStream::new(rx).boxed());
                    }
                    tokio::spawn(async move {
                        while let Some(item) = stream.next().await {
                            for sender in &senders {
                                let _ = sender.send(item.clone()).await;
                            }
                        }
                    });
                }

                let mut delivered = false;
                for (handle, streams) in handles.iter().zip(per_handle) {
                    if handle.push_streams(target, streams).await.is_ok() {
                        delivered = true;
                    }
                }
                if delivered {
                    Ok(())
                } else {
                    Err(ConnectionError::Closed)
                }
            }
        }
    }
}

/// Group membership management.
#[derive(Debug, Clone)]
pub struct Groups {
    registry: Arc<ClientRegistry>,
}

impl Groups {
    /// Add a connection to a group.
    ///
    /// # Errors
    ///
    /// Returns an error if the group name is invalid.
    pub fn add_to_group(&self, group: &str, connection_id: &str) -> Result<(), RegistryError> {
        self.registry.add_to_group(group, connection_id)
    }

    /// Remove a connection from a group.
    ///
    /// # Errors
    ///
    /// Returns an error if the group name is invalid.
    pub fn remove_from_group(&self, group: &str, connection_id: &str) -> Result<(), RegistryError> {
        self.registry.remove_from_group(group, connection_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OverflowPolicy;
    use serde_json::json;
    use strand_protocol::Message;

    fn wired_context() -> (HubContext, Arc<ClientRegistry>, mpsc::Receiver<Message>) {
        let registry = Arc::new(ClientRegistry::new());
        let (tx, rx) = mpsc::channel(16);
        registry.add(ConnectionHandle::new("caller", tx, OverflowPolicy::Block));
        let token = CancellationToken::new();
        let context = HubContext::new("caller", Arc::clone(&registry), token.clone(), token);
        (context, registry, rx)
    }

    #[tokio::test]
    async fn test_caller_send_reaches_caller_queue() {
        let (context, _registry, mut rx) = wired_context();
        context
            .clients()
            .caller()
            .send("echo", vec![json!("hi")])
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Message::Invocation { target, .. } => assert_eq!(target, "echo"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_to_vanished_connection_is_silent() {
        let (context, _registry, _rx) = wired_context();
        context
            .clients()
            .client("nobody")
            .send("echo", vec![])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_group_fanout_respects_except() {
        let (context, registry, mut caller_rx) = wired_context();
        let (tx, mut other_rx) = mpsc::channel(16);
        registry.add(ConnectionHandle::new("other", tx, OverflowPolicy::Block));
        registry.add_to_group("g", "caller").unwrap();
        registry.add_to_group("g", "other").unwrap();

        context
            .clients()
            .group_except("g", ["caller".to_owned()])
            .send("ping", vec![])
            .await
            .unwrap();

        assert!(other_rx.try_recv().is_ok());
        assert!(caller_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invoke_rejects_multi_targets() {
        let (context, _registry, _rx) = wired_context();
        assert_eq!(
            context.clients().all().invoke("m", vec![]).await,
            Err(InvokeError::NotSingle)
        );
        assert_eq!(
            context.clients().client("nobody").invoke("m", vec![]).await,
            Err(InvokeError::Unreachable)
        );
    }
}
