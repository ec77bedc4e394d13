//! The message-bus hub served by the binary.
//!
//! Every connection joins the shared bus group on connect; publishing fans
//! a message out to the group under its topic name. This is application
//! code built on the hub API; the core never depends on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info, warn};

use strand_core::{Hub, HubContext, ServerStream, UploadStream};

/// The group every bus client belongs to.
pub const BUS_GROUP: &str = "message_bus";

/// Maximum topic length in bytes.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Maximum message size in bytes (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Connection bookkeeping for the bus.
#[derive(Debug, Default)]
pub struct BusState {
    connections: DashMap<String, Instant>,
    total_connections: AtomicU64,
}

impl BusState {
    /// Currently connected clients.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connections seen since server start.
    #[must_use]
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }
}

fn validate_topic(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic cannot be empty");
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err("topic too long");
    }
    if topic.contains(['\n', '\r', '\t']) {
        return Err("topic contains invalid characters");
    }
    Ok(())
}

fn validate_message(message: &str) -> Result<(), &'static str> {
    if message.len() > MAX_MESSAGE_SIZE {
        return Err("message too large");
    }
    Ok(())
}

/// Tell the caller its request was rejected, on the `error` target.
async fn reject(ctx: &HubContext, code: &str, detail: &str) {
    warn!(connection = %ctx.connection_id(), code = %code, detail = %detail, "rejected bus request");
    let _ = ctx
        .clients()
        .caller()
        .send("error", vec![json!({ "code": code, "message": detail })])
        .await;
}

async fn echo_to_caller(ctx: &HubContext, message: String) {
    let _ = ctx
        .clients()
        .caller()
        .send("echo", vec![json!(message)])
        .await;
}

fn clock_string() -> String {
    let seconds_today = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() % 86_400)
        .unwrap_or_default();
    format!(
        "{:02}:{:02}:{:02}",
        seconds_today / 3600,
        (seconds_today / 60) % 60,
        seconds_today % 60
    )
}

/// Build the bus hub with fresh state.
#[must_use]
pub fn message_bus_hub() -> Hub {
    message_bus_hub_with(Arc::new(BusState::default()))
}

/// Build the bus hub around shared state (so the binary can expose counts).
#[must_use]
pub fn message_bus_hub_with(state: Arc<BusState>) -> Hub {
    let connect_state = Arc::clone(&state);
    let disconnect_state = Arc::clone(&state);
    let count_state = Arc::clone(&state);
    let total_state = Arc::clone(&state);

    Hub::builder()
        .method("Echo", |ctx: HubContext, message: String| async move {
            echo_to_caller(&ctx, message).await;
        })
        .method("Broadcast", |ctx: HubContext, message: String| async move {
            if let Err(detail) = validate_message(&message) {
                reject(&ctx, "INVALID_MESSAGE", detail).await;
                return;
            }
            debug!(connection = %ctx.connection_id(), size = message.len(), "broadcast");
            let group = ctx.clients().group(BUS_GROUP);
            let _ = group.send("broadcast", vec![json!(message)]).await;
            let _ = group.send("receive", vec![json!(message)]).await;
        })
        .method(
            "Send",
            |ctx: HubContext, topic: String, message: String, sender: String| async move {
                if let Err(detail) = validate_topic(&topic) {
                    reject(&ctx, "INVALID_TOPIC", detail).await;
                    return;
                }
                if let Err(detail) = validate_message(&message) {
                    reject(&ctx, "INVALID_MESSAGE", detail).await;
                    return;
                }
                debug!(topic = %topic, size = message.len(), sender = %sender, "bus send");
                let _ = ctx
                    .clients()
                    .group(BUS_GROUP)
                    .send(&topic, vec![json!(message)])
                    .await;
            },
        )
        .method(
            "SendToBackend",
            |ctx: HubContext, topic: String, message: String, sender: String| async move {
                if let Err(detail) = validate_topic(&topic) {
                    reject(&ctx, "INVALID_TOPIC", detail).await;
                    return;
                }
                if let Err(detail) = validate_message(&message) {
                    reject(&ctx, "INVALID_MESSAGE", detail).await;
                    return;
                }
                debug!(topic = %topic, sender = %sender, "bus send to backend");
                let envelope = json!({
                    "topic": topic,
                    "message": message,
                    "sender": sender,
                });
                let _ = ctx
                    .clients()
                    .group(BUS_GROUP)
                    .send("sendtobackend", vec![envelope])
                    .await;
            },
        )
        .method(
            "AddMessage",
            |ctx: HubContext, message: String, topic: String, sender: String| async move {
                if let Err(detail) = validate_topic(&topic) {
                    reject(&ctx, "INVALID_TOPIC", detail).await;
                    return;
                }
                if let Err(detail) = validate_message(&message) {
                    reject(&ctx, "INVALID_MESSAGE", detail).await;
                    return;
                }
                debug!(topic = %topic, sender = %sender, "bus add message");
                let _ = ctx
                    .clients()
                    .group(BUS_GROUP)
                    .send(&topic, vec![json!(message)])
                    .await;
            },
        )
        .method("RequestTuple", |message: String| async move {
            (
                message.to_uppercase(),
                message.to_lowercase(),
                message.len(),
            )
        })
        .method("RequestAsync", |message: String| async move {
            let (tx, stream) = ServerStream::channel(1);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let _ = tx
                    .send(json!({
                        "ToUpper": message.to_uppercase(),
                        "ToLower": message.to_lowercase(),
                        "len": message.len().to_string(),
                    }))
                    .await;
            });
            stream
        })
        .method("DateStream", || async {
            let (tx, stream) = ServerStream::channel(1);
            tokio::spawn(async move {
                for _ in 0..50 {
                    if tx.send(clock_string()).await.is_err() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            });
            stream
        })
        .method(
            "UploadStream",
            |ctx: HubContext,
             factor: f64,
             mut xs: UploadStream<i64>,
             mut ys: UploadStream<f64>| async move {
                echo_to_caller(&ctx, format!("f: {factor}")).await;
                let mut xs_open = true;
                let mut ys_open = true;
                while xs_open || ys_open {
                    tokio::select! {
                        x = xs.recv(), if xs_open => match x {
                            Some(value) => echo_to_caller(&ctx, format!("u1: {value}")).await,
                            None => xs_open = false,
                        },
                        y = ys.recv(), if ys_open => match y {
                            Some(value) => echo_to_caller(&ctx, format!("u2: {value}")).await,
                            None => ys_open = false,
                        },
                    }
                }
                echo_to_caller(&ctx, "Finished".to_owned()).await;
            },
        )
        .method("Panic", || async {
            panic!("Don't panic!");
            #[allow(unreachable_code)]
            ()
        })
        .method("AbortConnection", |ctx: HubContext| async move {
            warn!(connection = %ctx.connection_id(), "connection abort requested");
            ctx.abort();
        })
        .method("GetConnectionCount", move || {
            let state = Arc::clone(&count_state);
            async move { state.connection_count() }
        })
        .method("GetTotalConnections", move || {
            let state = Arc::clone(&total_state);
            async move { state.total_connections() }
        })
        .on_connected(move |ctx: HubContext| {
            let state = Arc::clone(&connect_state);
            async move {
                state
                    .connections
                    .insert(ctx.connection_id().to_owned(), Instant::now());
                let total = state.total_connections.fetch_add(1, Ordering::Relaxed) + 1;
                let _ = ctx.groups().add_to_group(BUS_GROUP, ctx.connection_id());
                info!(
                    connection = %ctx.connection_id(),
                    group = BUS_GROUP,
                    active = state.connection_count(),
                    total = total,
                    "bus client connected"
                );
            }
        })
        .on_disconnected(move |ctx: HubContext| {
            let state = Arc::clone(&disconnect_state);
            async move {
                let duration = state
                    .connections
                    .remove(ctx.connection_id())
                    .map(|(_, connected_at)| connected_at.elapsed());
                let _ = ctx.groups().remove_from_group(BUS_GROUP, ctx.connection_id());
                info!(
                    connection = %ctx.connection_id(),
                    duration = ?duration,
                    active = state.connection_count(),
                    "bus client disconnected"
                );
            }
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::ResultKind;

    #[test]
    fn test_topic_validation() {
        assert!(validate_topic("sensors/temp").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("bad\ntopic").is_err());
        assert!(validate_topic(&"t".repeat(MAX_TOPIC_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_message_validation() {
        assert!(validate_message("fine").is_ok());
        assert!(validate_message(&"m".repeat(MAX_MESSAGE_SIZE + 1)).is_err());
    }

    #[test]
    fn test_hub_shape() {
        let hub = message_bus_hub();
        for name in [
            "echo",
            "broadcast",
            "send",
            "sendtobackend",
            "addmessage",
            "requesttuple",
            "requestasync",
            "datestream",
            "uploadstream",
            "panic",
            "abortconnection",
            "getconnectioncount",
            "gettotalconnections",
        ] {
            assert!(hub.method(name).is_some(), "missing method {name}");
        }

        let upload = hub.method("uploadstream").unwrap();
        assert_eq!(upload.value_params(), 1);
        assert_eq!(upload.stream_params(), 2);
        assert_eq!(
            hub.method("datestream").unwrap().result_kind(),
            ResultKind::Streaming
        );
        assert_eq!(
            hub.method("requesttuple").unwrap().result_kind(),
            ResultKind::Single
        );
    }

    #[test]
    fn test_connection_tracking_state() {
        let state = Arc::new(BusState::default());
        state.connections.insert("c1".into(), Instant::now());
        state.total_connections.fetch_add(1, Ordering::Relaxed);
        assert_eq!(state.connection_count(), 1);
        assert_eq!(state.total_connections(), 1);

        state.connections.remove("c1");
        assert_eq!(state.connection_count(), 0);
        assert_eq!(state.total_connections(), 1);
    }
}
