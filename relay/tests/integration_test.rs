//! End-to-end tests: an in-process backend, relay, and agent wired together
//! over real sockets.

use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use burrow_agent::agent::Agent;
use burrow_agent::config as agent_config;
use burrow_relay::config::{AuthConfig, ListenConfig, RelayConfig, TlsConfig, TunnelConfig};
use burrow_relay::server::{serve, AppState, SharedState};

const SECRET: &str = "integration-test-secret";

/// A small backend with the routes the scenarios need.
async fn start_backend() -> SocketAddr {
    let app = Router::new()
        .route(
            "/hello",
            get(|| async { ([("x-test", "passed")], "hello from backend") }),
        )
        .route("/echo", post(|body: axum::body::Bytes| async move { body }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "late"
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn start_relay(secret: &str, request_timeout_secs: u64) -> (SocketAddr, SharedState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = RelayConfig {
        listen: ListenConfig {
            addr: addr.to_string(),
        },
        tls: TlsConfig::default(),
        auth: AuthConfig {
            shared_secret: secret.to_string(),
        },
        tunnel: TunnelConfig {
            path: "/_tunnel/ws".to_string(),
            ping_interval_secs: 5,
            request_timeout_secs,
        },
    };

    let state = AppState::new(config);
    tokio::spawn(serve(listener, state.clone()));
    (addr, state)
}

fn agent_config(
    relay_addr: SocketAddr,
    backend_addr: SocketAddr,
    secret: &str,
) -> agent_config::AgentConfig {
    agent_config::AgentConfig {
        relay: agent_config::RelayEndpoint {
            url: format!("ws://{relay_addr}/_tunnel/ws"),
        },
        proxy: agent_config::ProxyConfig::default(),
        backend: agent_config::BackendConfig {
            target_url: format!("http://{backend_addr}"),
        },
        auth: agent_config::AuthConfig {
            shared_secret: secret.to_string(),
        },
        tunnel: agent_config::TunnelConfig {
            reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 5,
            ping_interval_secs: 5,
        },
    }
}

/// Start an agent in the background; cancel the returned token to stop it.
fn start_agent(cfg: agent_config::AgentConfig) -> CancellationToken {
    let agent = Agent::new(cfg).unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = agent.run(shutdown).await;
        }
    });
    shutdown
}

async fn wait_for_pool(state: &SharedState, size: usize) {
    for _ in 0..100 {
        if state.pool.size().await == size {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("pool never reached size {size}");
}

#[tokio::test]
async fn test_get_pass_through() {
    let backend = start_backend().await;
    let (relay, state) = start_relay(SECRET, 10).await;
    let shutdown = start_agent(agent_config(relay, backend, SECRET));
    wait_for_pool(&state, 1).await;

    let response = reqwest::get(format!("http://{relay}/hello")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-test").and_then(|v| v.to_str().ok()),
        Some("passed")
    );
    assert_eq!(response.text().await.unwrap(), "hello from backend");

    shutdown.cancel();
}

#[tokio::test]
async fn test_echo_post() {
    let backend = start_backend().await;
    let (relay, state) = start_relay(SECRET, 10).await;
    let shutdown = start_agent(agent_config(relay, backend, SECRET));
    wait_for_pool(&state, 1).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{relay}/echo"))
        .body("abc123")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "abc123");

    shutdown.cancel();
}

#[tokio::test]
async fn test_no_agents_connected() {
    let (relay, _state) = start_relay(SECRET, 10).await;

    let response = reqwest::get(format!("http://{relay}/anything"))
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    assert_eq!(response.text().await.unwrap(), "no backend agents connected");
}

#[tokio::test]
async fn test_request_timeout() {
    let backend = start_backend().await;
    let (relay, state) = start_relay(SECRET, 1).await;
    let shutdown = start_agent(agent_config(relay, backend, SECRET));
    wait_for_pool(&state, 1).await;

    let response = reqwest::get(format!("http://{relay}/slow")).await.unwrap();
    assert_eq!(response.status(), 504);
    assert_eq!(response.text().await.unwrap(), "request timed out");

    shutdown.cancel();
}

#[tokio::test]
async fn test_large_body_round_trip() {
    let backend = start_backend().await;
    let (relay, state) = start_relay(SECRET, 30).await;
    let shutdown = start_agent(agent_config(relay, backend, SECRET));
    wait_for_pool(&state, 1).await;

    // large enough that request and response each span several frames
    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{relay}/echo"))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let returned = response.bytes().await.unwrap();
    assert_eq!(returned.len(), body.len());
    assert_eq!(&returned[..], &body[..]);

    shutdown.cancel();
}

#[tokio::test]
async fn test_unauthorized_agent_rejected() {
    let backend = start_backend().await;
    let (relay, state) = start_relay(SECRET, 10).await;

    // direct probe: a bogus token gets 401, no upgrade
    let err = tokio_tungstenite::connect_async(format!("ws://{relay}/_tunnel/ws?token=bogus"))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected http 401 rejection, got {other:?}"),
    }

    // an agent with the wrong secret never makes it into the pool
    let shutdown = start_agent(agent_config(relay, backend, "wrong-secret"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(state.pool.size().await, 0);

    shutdown.cancel();
}

#[tokio::test]
async fn test_concurrent_requests_multiplex() {
    let backend = start_backend().await;
    let (relay, state) = start_relay(SECRET, 10).await;
    let shutdown = start_agent(agent_config(relay, backend, SECRET));
    wait_for_pool(&state, 1).await;

    let client = reqwest::Client::new();
    let mut handles = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        let url = format!("http://{relay}/echo");
        handles.push(tokio::spawn(async move {
            let body = format!("request-{i}");
            let response = client.post(&url).body(body.clone()).send().await.unwrap();
            assert_eq!(response.status(), 200);
            assert_eq!(response.text().await.unwrap(), body);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    shutdown.cancel();
}
