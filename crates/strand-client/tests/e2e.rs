//! Client-against-server end-to-end tests over real WebSockets on an
//! ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use strand_client::{Client, ReconnectPolicy};
use strand_core::{Hub, HubContext, HubSource, ServerStream};
use strand_server::config::TimingConfig;
use strand_server::{hub_router, AppState, Config};

fn server_hub() -> Hub {
    Hub::builder()
        .method("Echo", |message: String| async move { message })
        .method("Letters", |count: usize| async move {
            let (tx, stream) = ServerStream::channel(4);
            tokio::spawn(async move {
                for letter in ["a", "b", "c"].into_iter().take(count) {
                    if tx.send(letter.to_owned()).await.is_err() {
                        break;
                    }
                }
            });
            stream
        })
        .method("NotifyMe", |ctx: HubContext, payload: String| async move {
            let _ = ctx
                .clients()
                .caller()
                .send("notify", vec![json!(payload)])
                .await;
        })
        .method("WhoAmI", |ctx: HubContext| async move {
            ctx.connection_id().to_owned()
        })
        .build()
}

async fn spawn_server(config: Config) -> SocketAddr {
    let state = Arc::new(AppState::new(config, HubSource::singleton(server_hub())));
    let app = hub_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn base_config() -> Config {
    Config {
        base_path: "/hub".into(),
        ..Config::default()
    }
}

fn hub_url(addr: SocketAddr) -> String {
    format!("http://{addr}/hub")
}

#[tokio::test]
async fn invoke_round_trips_json() {
    let addr = spawn_server(base_config()).await;
    let client = Client::builder(hub_url(addr)).build();
    client.start().await.unwrap();

    let echoed: String = client.invoke("echo", vec![json!("hi")]).await.unwrap();
    assert_eq!(echoed, "hi");

    client.stop().await;
}

#[tokio::test]
async fn invoke_round_trips_messagepack() {
    let addr = spawn_server(base_config()).await;
    let client = Client::builder(hub_url(addr))
        .protocol("messagepack")
        .build();
    client.start().await.unwrap();

    let echoed: String = client.invoke("echo", vec![json!("hi")]).await.unwrap();
    assert_eq!(echoed, "hi");

    client.stop().await;
}

#[tokio::test]
async fn unknown_method_surfaces_the_server_error() {
    let addr = spawn_server(base_config()).await;
    let client = Client::builder(hub_url(addr)).build();
    client.start().await.unwrap();

    let result = client.invoke::<Value>("missing", vec![]).await;
    match result {
        Err(strand_client::ClientError::Hub(message)) => {
            assert_eq!(message, "Method not found");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    client.stop().await;
}

#[tokio::test]
async fn pull_stream_ends_at_completion() {
    let addr = spawn_server(base_config()).await;
    let client = Client::builder(hub_url(addr)).build();
    client.start().await.unwrap();

    let mut items = client.pull_stream("letters", vec![json!(3)]).await.unwrap();
    let mut collected = Vec::new();
    while let Some(item) = timeout(Duration::from_secs(2), items.recv())
        .await
        .expect("stream stalled")
    {
        collected.push(item.unwrap());
    }
    assert_eq!(collected, vec![json!("a"), json!("b"), json!("c")]);

    client.stop().await;
}

#[tokio::test]
async fn receiver_methods_handle_server_pushes() {
    let addr = spawn_server(base_config()).await;

    let (notify_tx, mut notify_rx) = mpsc::channel::<String>(4);
    let receiver = Hub::builder()
        .method("Notify", move |payload: String| {
            let notify_tx = notify_tx.clone();
            async move {
                let _ = notify_tx.send(payload).await;
            }
        })
        .build();

    let client = Client::builder(hub_url(addr)).receiver(receiver).build();
    client.start().await.unwrap();

    client
        .send("notifyMe", vec![json!("wake up")])
        .await
        .unwrap();

    let payload = timeout(Duration::from_secs(2), notify_rx.recv())
        .await
        .expect("no push before deadline")
        .unwrap();
    assert_eq!(payload, "wake up");

    client.stop().await;
}

#[tokio::test]
async fn silent_server_triggers_reconnect_with_fresh_id() {
    // The server never pings (hour-long keep-alive); the client's short
    // timeout trips, and the reconnect performs a fresh negotiate.
    let config = Config {
        timing: TimingConfig {
            keep_alive_ms: 3_600_000,
            timeout_ms: 7_200_000,
            ..TimingConfig::default()
        },
        ..base_config()
    };
    let addr = spawn_server(config).await;

    let client = Client::builder(hub_url(addr))
        .keep_alive_interval(Duration::from_millis(100))
        .timeout_interval(Duration::from_millis(400))
        .reconnect(ReconnectPolicy {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            ..ReconnectPolicy::default()
        })
        .build();
    client.start().await.unwrap();

    let first_id: String = client.invoke("whoAmI", vec![]).await.unwrap();

    // Stay quiet past the client-side timeout so the session drops, then
    // poll until a fresh session answers with a different id.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let second_id = timeout(Duration::from_secs(5), async {
        loop {
            tokio::time::sleep(Duration::from_millis(150)).await;
            match client.invoke::<String>("whoAmI", vec![]).await {
                Ok(id) if id != first_id => return id,
                _ => {}
            }
        }
    })
    .await
    .expect("client never reconnected");

    assert_ne!(first_id, second_id);
    client.stop().await;
}
