//! HTTP integration tests: negotiate, origin and bearer checks, token
//! lookup, and the SSE pair, against a server on an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;

use strand_core::{Hub, HubSource};
use strand_protocol::NegotiateResponse;
use strand_server::config::AuthConfig;
use strand_server::{hub_router, AppState, Config};

fn test_hub() -> Hub {
    Hub::builder()
        .method("Echo", |message: String| async move { message })
        .build()
}

async fn spawn_server(config: Config) -> SocketAddr {
    let state = Arc::new(AppState::new(config, HubSource::singleton(test_hub())));
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

#[tokio::test]
async fn negotiate_lists_websockets_first() {
    let addr = spawn_server(base_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/hub/negotiate?negotiateVersion=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let negotiate: NegotiateResponse = response.json().await.unwrap();
    assert_eq!(negotiate.negotiate_version, 1);
    assert!(negotiate.connection_token.is_some());
    assert_ne!(
        negotiate.connection_token.as_deref(),
        Some(negotiate.connection_id.as_str())
    );
    assert_eq!(negotiate.available_transports[0].transport, "WebSockets");
    assert_eq!(
        negotiate.available_transports[0].transfer_formats,
        vec!["Text".to_owned(), "Binary".to_owned()]
    );
    assert_eq!(
        negotiate.available_transports[1].transport,
        "ServerSentEvents"
    );
}

#[tokio::test]
async fn negotiate_v0_reuses_the_connection_id() {
    let addr = spawn_server(base_config()).await;
    let client = reqwest::Client::new();

    let negotiate: NegotiateResponse = client
        .post(format!("http://{addr}/hub/negotiate"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(negotiate.negotiate_version, 0);
    assert!(negotiate.connection_token.is_none());
}

#[tokio::test]
async fn disallowed_origin_is_forbidden() {
    let config = Config {
        allowed_origin_patterns: vec!["https://app.example.com".into()],
        ..base_config()
    };
    let addr = spawn_server(config).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/hub/negotiate?negotiateVersion=1"))
        .header("Origin", "https://evil.example.net")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let response = client
        .post(format!("http://{addr}/hub/negotiate?negotiateVersion=1"))
        .header("Origin", "https://app.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn bearer_auth_gates_every_endpoint() {
    let config = Config {
        auth: AuthConfig {
            enabled: true,
            token: "secret".into(),
        },
        ..base_config()
    };
    let addr = spawn_server(config).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/hub/negotiate?negotiateVersion=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .post(format!("http://{addr}/hub/negotiate?negotiateVersion=1"))
        .header("Authorization", "Bearer secret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // The query-parameter form works too.
    let response = client
        .post(format!(
            "http://{addr}/hub/negotiate?negotiateVersion=1&access_token=secret"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn unknown_connection_token_is_not_found() {
    let addr = spawn_server(base_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/hub?id=bogus"))
        .header("Accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .post(format!("http://{addr}/hub?id=bogus"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn connection_tokens_are_single_use() {
    let addr = spawn_server(base_config()).await;
    let client = reqwest::Client::new();

    let negotiate: NegotiateResponse = client
        .post(format!("http://{addr}/hub/negotiate?negotiateVersion=1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = negotiate.transport_token().to_owned();

    let first = client
        .get(format!("http://{addr}/hub?id={token}"))
        .header("Accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let second = client
        .get(format!("http://{addr}/hub?id={token}"))
        .header("Accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 404);
}

#[tokio::test]
async fn sse_pair_carries_the_handshake() {
    let addr = spawn_server(base_config()).await;
    let client = reqwest::Client::new();

    let negotiate: NegotiateResponse = client
        .post(format!("http://{addr}/hub/negotiate?negotiateVersion=1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = negotiate.transport_token().to_owned();

    let mut events = client
        .get(format!("http://{addr}/hub?id={token}"))
        .header("Accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(events.status(), 200);
    assert!(events
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .contains("text/event-stream"));

    // Handshake goes in through the companion POST channel.
    let response = client
        .post(format!("http://{addr}/hub?id={token}"))
        .body("{\"protocol\":\"json\",\"version\":1}\u{1e}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // The handshake reply comes back on the event stream.
    let chunk = tokio::time::timeout(std::time::Duration::from_secs(2), events.chunk())
        .await
        .expect("no event before deadline")
        .unwrap()
        .expect("stream ended");
    let text = String::from_utf8_lossy(&chunk);
    assert!(text.contains("data:"), "unexpected event: {text}");
    assert!(text.contains("{}"), "unexpected event: {text}");
}
