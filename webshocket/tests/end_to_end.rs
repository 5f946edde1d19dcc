//!
//! End-to-end client/server scenarios (§8 Testable properties, S1-S7).
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;

use webshocket::client::{Client, ClientConfig, RetryPolicy};
use webshocket::connection::Connection;
use webshocket::handler::DefaultHandler;
use webshocket::packet::{ErrorCode, PacketData, RpcEnvelope};
use webshocket::rpc::{RateLimit, RpcMethodEntry};
use webshocket::rpc_method;
use webshocket::server::{Server, ServerConfig};

async fn start_default_server(config: ServerConfig) -> (Arc<Server>, String) {
    let server = Server::new(DefaultHandler, config);
    let addr = server.start("127.0.0.1:0").await.unwrap();
    (server, format!("ws://{addr}"))
}

async fn connected_client(url: &str) -> Client {
    let client = Client::new(url, ClientConfig::default());
    client.connect().await.unwrap();
    client
}

/// S1 - Echo: server echoes received text, prefixed.
#[tokio::test(flavor = "multi_thread")]
async fn echo_scenario() {
    let (server, url) = start_default_server(ServerConfig::default()).await;

    tokio::spawn({
        let server = server.clone();
        async move {
            loop {
                let conn = server.accept().await.unwrap();
                tokio::spawn(async move {
                    loop {
                        let packet = match conn.recv(Duration::from_secs(5)).await {
                            Ok(p) => p,
                            Err(_) => break,
                        };
                        if let Some(text) = packet.data.as_ref().and_then(PacketData::as_text) {
                            let _ = conn.send(format!("Echo: {text}"));
                        }
                    }
                });
            }
        }
    });

    let client = connected_client(&url).await;
    client.send("Hello").unwrap();
    let response = client.recv(Duration::from_secs(5)).await.unwrap();
    assert_eq!(response.data.unwrap().as_text(), Some("Echo: Hello"));
}

/// S2/S3 - chunking is invisible above the codec, at and across the 64 KiB boundary.
#[tokio::test(flavor = "multi_thread")]
async fn large_payload_round_trips_unchanged() {
    let (server, url) = start_default_server(ServerConfig::default()).await;

    tokio::spawn({
        let server = server.clone();
        async move {
            let conn = server.accept().await.unwrap();
            loop {
                let packet = match conn.recv(Duration::from_secs(5)).await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                if let Some(text) = packet.data.as_ref().and_then(PacketData::as_text) {
                    let _ = conn.send(text.to_string());
                }
            }
        }
    });

    let client = connected_client(&url).await;

    for len in [65536usize, 65546usize] {
        let payload = "a".repeat(len);
        client.send(payload.clone()).unwrap();
        let echoed = client.recv(Duration::from_secs(5)).await.unwrap();
        assert_eq!(echoed.data.unwrap().as_text(), Some(payload.as_str()));
    }
}

/// S4 - RPC with a rate limit: calls 1-2 succeed, call 3 is rejected.
#[tokio::test(flavor = "multi_thread")]
async fn rpc_rate_limit_scenario() {
    let server = Server::new(DefaultHandler, ServerConfig::default());
    server.register_rpc_method(
        "ping",
        RpcMethodEntry::new(rpc_method!(|_conn, _args, _kwargs| Ok(json!("pong"))))
            .with_rate_limit(RateLimit::new(2, Duration::from_secs(60))),
    );
    let addr = server.start("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{addr}");

    let client = connected_client(&url).await;

    let mut errors = Vec::new();
    for _ in 0..3 {
        let response = client.send_rpc("ping", vec![], Map::new(), false).await.unwrap();
        match response.rpc {
            Some(RpcEnvelope::Response { error, .. }) => errors.push(error),
            _ => panic!("expected an rpc response"),
        }
    }

    assert_eq!(errors, vec![None, None, Some(ErrorCode::RateLimitExceeded)]);
}

/// S5 - wildcard pub/sub: glob subscribers receive exactly the matching publishes.
#[tokio::test(flavor = "multi_thread")]
async fn wildcard_pubsub_scenario() {
    let (server, url) = start_default_server(ServerConfig::default()).await;

    let client_a = connected_client(&url).await;
    let conn_a = server.accept().await.unwrap();
    conn_a.subscribe(["news.*"]);

    let client_b = connected_client(&url).await;
    let conn_b = server.accept().await.unwrap();
    conn_b.subscribe(["news.tech"]);

    let client_c = connected_client(&url).await;
    let conn_c = server.accept().await.unwrap();
    conn_c.subscribe(["news.sport.?"]);

    // Matches the pattern "news.*" (A) and the exact channel "news.tech" (B).
    server.publish("news.tech", "tech update", &[], None);
    assert_eq!(client_a.recv(Duration::from_secs(2)).await.unwrap().data.unwrap().as_text(), Some("tech update"));
    assert_eq!(client_b.recv(Duration::from_secs(2)).await.unwrap().data.unwrap().as_text(), Some("tech update"));
    assert!(client_c.recv(Duration::from_millis(200)).await.is_err());

    // Matches "news.*" (A) and "news.sport.?" with exactly one trailing character (C).
    server.publish("news.sport.x", "sport flash", &[], None);
    assert_eq!(client_a.recv(Duration::from_secs(2)).await.unwrap().data.unwrap().as_text(), Some("sport flash"));
    assert_eq!(client_c.recv(Duration::from_secs(2)).await.unwrap().data.unwrap().as_text(), Some("sport flash"));
    assert!(client_b.recv(Duration::from_millis(200)).await.is_err());

    // Matches nobody.
    server.publish("weather.today", "sunny", &[], None);
    assert!(client_a.recv(Duration::from_millis(200)).await.is_err());
    assert!(client_b.recv(Duration::from_millis(200)).await.is_err());
    assert!(client_c.recv(Duration::from_millis(200)).await.is_err());
}

/// S6 - max-connection reject: the second upgrade is refused with HTTP 503
/// and the client tally never exceeds the configured limit.
#[tokio::test(flavor = "multi_thread")]
async fn max_connection_reject_scenario() {
    let (server, url) = start_default_server(ServerConfig { max_connection: Some(1), ..ServerConfig::default() }).await;

    let _first = connected_client(&url).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.registry().client_count(), 1);

    let err = tokio_tungstenite::connect_async(url.clone()).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 503);
            let body = response.body().as_deref().unwrap_or_default();
            assert!(body.contains("Server is full"));
        }
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }

    assert_eq!(server.registry().client_count(), 1);
}

/// S7 - access-predicate broadcast: only connections whose session state
/// satisfies the predicate receive the broadcast; others time out.
#[tokio::test(flavor = "multi_thread")]
async fn access_predicate_broadcast_scenario() {
    let server = Server::new(DefaultHandler, ServerConfig::default());
    server.register_rpc_method(
        "get_admin",
        RpcMethodEntry::new(rpc_method!(|conn, _args, _kwargs| {
            conn.session_set("admin", true);
            Ok(json!("ok"))
        })),
    );
    let addr = server.start("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{addr}");

    let admin = connected_client(&url).await;
    admin.send_rpc("get_admin", vec![], Map::new(), false).await.unwrap();

    let regular = connected_client(&url).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    server.broadcast("admins only", &[], Some(&|conn: &Connection| conn.session_get("admin").and_then(|v| v.as_bool()).unwrap_or(false)));

    assert_eq!(admin.recv(Duration::from_secs(2)).await.unwrap().data.unwrap().as_text(), Some("admins only"));
    assert!(matches!(regular.recv(Duration::from_millis(200)).await, Err(webshocket::error::Error::ReceiveTimeout)));
}

/// publish_many fans a single publication out across several named channels,
/// each with its own independently-computed recipient set.
#[tokio::test(flavor = "multi_thread")]
async fn publish_many_delivers_to_each_named_channel() {
    let (server, url) = start_default_server(ServerConfig::default()).await;

    let client_a = connected_client(&url).await;
    let conn_a = server.accept().await.unwrap();
    conn_a.subscribe(["alerts.fire"]);

    let client_b = connected_client(&url).await;
    let conn_b = server.accept().await.unwrap();
    conn_b.subscribe(["alerts.flood"]);

    server.publish_many(["alerts.fire", "alerts.flood"], "evacuate", &[], None);

    assert_eq!(client_a.recv(Duration::from_secs(2)).await.unwrap().data.unwrap().as_text(), Some("evacuate"));
    assert_eq!(client_b.recv(Duration::from_secs(2)).await.unwrap().data.unwrap().as_text(), Some("evacuate"));
}

/// §7 `ConnectionFailed`: once `RetryPolicy::max_attempts` is exhausted
/// against a peer that never accepts, `connect()` must resolve to an error
/// rather than hang waiting for an `Open` that will never arrive.
#[tokio::test(flavor = "multi_thread")]
async fn connect_reports_connection_failed_once_retries_are_exhausted() {
    let config = ClientConfig {
        retry: RetryPolicy { max_attempts: Some(0), retry_interval: Duration::from_millis(1) },
        ..ClientConfig::default()
    };
    let client = Client::new("ws://127.0.0.1:1", config);

    let result = tokio::time::timeout(Duration::from_secs(5), client.connect()).await.expect("connect() never returned");
    assert!(matches!(result, Err(webshocket::error::Error::ConnectionFailed(_))));
}
