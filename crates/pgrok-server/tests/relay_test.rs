//! Relay server integration tests
//!
//! Drive a real bound relay with reqwest on the public side and a
//! hand-rolled WebSocket client on the control side.

use futures_util::{SinkExt, StreamExt};
use pgrok_server::{AllowAll, RelayServer, ServerConfig, StaticToken};
use pgrok_proto::{Frame, HttpResponseEnvelope};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay(config: ServerConfig) -> (SocketAddr, Arc<pgrok_control::TunnelRegistry>) {
    let server = RelayServer::new(config, Arc::new(AllowAll));
    let bound = server.bind().await.expect("bind relay");
    let addr = bound.http_addr().expect("http addr");
    let registry = bound.state().registry.clone();
    tokio::spawn(bound.serve());
    (addr, registry)
}

async fn connect_tunnel(addr: SocketAddr, id: &str) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{}/tunnel?id={}", addr, id))
        .await
        .expect("connect control channel");
    // Registration happens on the server after the upgrade completes
    tokio::time::sleep(Duration::from_millis(200)).await;
    ws
}

/// Answer every forwarded request by echoing its body as text/plain
fn spawn_echo_client(ws: WsStream) {
    tokio::spawn(async move {
        let (mut sink, mut stream) = ws.split();
        while let Some(Ok(message)) = stream.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let reply = match Frame::decode(&text) {
                Ok(Frame::Ping) => Some(Frame::Pong),
                Ok(Frame::HttpRequest(env)) => {
                    let mut headers = HashMap::new();
                    headers.insert("content-type".to_string(), "text/plain".to_string());
                    Some(Frame::HttpResponse(HttpResponseEnvelope {
                        request_id: env.request_id,
                        status_code: 200,
                        headers,
                        body: Some(env.body.unwrap_or_default()),
                        error_message: None,
                    }))
                }
                _ => None,
            };
            if let Some(frame) = reply {
                let text = frame.encode().expect("encode reply");
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    });
}

#[tokio::test]
async fn test_unknown_tunnel_returns_404() {
    let (addr, _registry) = start_relay(ServerConfig {
        port: 0,
        localhost_only: true,
        ..Default::default()
    })
    .await;

    let response = reqwest::get(format!("http://{}/nope/x", addr))
        .await
        .expect("request");
    assert_eq!(response.status(), 404);

    let body: serde_json::Value = response.json().await.expect("json body");
    assert!(body["message"].as_str().unwrap().contains("nope"));
    assert_eq!(body["availableTunnels"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_http_echo_through_tunnel() {
    let (addr, _registry) = start_relay(ServerConfig {
        port: 0,
        localhost_only: true,
        ..Default::default()
    })
    .await;

    let ws = connect_tunnel(addr, "svc1").await;
    spawn_echo_client(ws);

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/svc1/echo", addr))
        .body("hello")
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello");
}

#[tokio::test]
async fn test_empty_body_round_trips_as_empty() {
    let (addr, _registry) = start_relay(ServerConfig {
        port: 0,
        localhost_only: true,
        ..Default::default()
    })
    .await;

    let ws = connect_tunnel(addr, "svc1").await;
    spawn_echo_client(ws);

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/svc1/echo", addr))
        .body("")
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_disconnect_mid_request_returns_503() {
    let (addr, registry) = start_relay(ServerConfig {
        port: 0,
        localhost_only: true,
        ..Default::default()
    })
    .await;

    let ws = connect_tunnel(addr, "svc1").await;

    // A client that reads the request and then vanishes
    tokio::spawn(async move {
        let (_sink, mut stream) = ws.split();
        while let Some(Ok(message)) = stream.next().await {
            if let Message::Text(text) = message {
                if matches!(Frame::decode(&text), Ok(Frame::HttpRequest(_))) {
                    break;
                }
            }
        }
        // Dropping both halves closes the control channel
    });

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/svc1/slow", addr))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), 503);
    let body = response.text().await.unwrap();
    assert!(body.contains("Tunnel Disconnected"), "body: {}", body);

    // The registry entry is gone shortly after the channel closed
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(registry.lookup("svc1").is_err());
}

#[tokio::test]
async fn test_duplicate_id_rejected_with_policy_close() {
    let (addr, _registry) = start_relay(ServerConfig {
        port: 0,
        localhost_only: true,
        ..Default::default()
    })
    .await;

    let _first = connect_tunnel(addr, "svc1").await;

    let (mut second, _) = connect_async(format!("ws://{}/tunnel?id=svc1", addr))
        .await
        .expect("second upgrade");

    // The server accepts the upgrade, then closes with a policy violation
    let mut saw_close = false;
    while let Some(Ok(message)) = second.next().await {
        if let Message::Close(Some(frame)) = message {
            assert_eq!(u16::from(frame.code), 1008);
            assert!(frame.reason.contains("in use"), "reason: {}", frame.reason);
            saw_close = true;
            break;
        }
    }
    assert!(saw_close, "expected a close frame");
}

#[tokio::test]
async fn test_single_tunnel_mode_routes_any_path() {
    let (addr, _registry) = start_relay(ServerConfig {
        port: 0,
        localhost_only: true,
        single_tunnel: true,
        ..Default::default()
    })
    .await;

    let ws = connect_tunnel(addr, "only").await;
    spawn_echo_client(ws);

    // No tunnel-id prefix in the path
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/any/path/at/all", addr))
        .body("routed")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "routed");

    // A second registration is refused
    let (mut second, _) = connect_async(format!("ws://{}/tunnel?id=more", addr))
        .await
        .expect("second upgrade");
    let mut saw_close = false;
    while let Some(Ok(message)) = second.next().await {
        if let Message::Close(Some(frame)) = message {
            assert_eq!(u16::from(frame.code), 1008);
            saw_close = true;
            break;
        }
    }
    assert!(saw_close);
}

#[tokio::test]
async fn test_status_page_lists_tunnels() {
    let (addr, _registry) = start_relay(ServerConfig {
        port: 0,
        localhost_only: true,
        ..Default::default()
    })
    .await;

    let ws = connect_tunnel(addr, "visible-tunnel").await;
    spawn_echo_client(ws);

    let body = reqwest::get(format!("http://{}/$status", addr))
        .await
        .expect("status request")
        .text()
        .await
        .unwrap();
    assert!(body.contains("visible-tunnel"));
    assert!(body.contains("1 tunnel(s) registered"));
}

#[tokio::test]
async fn test_auth_token_enforced() {
    let server = RelayServer::new(
        ServerConfig {
            port: 0,
            localhost_only: true,
            ..Default::default()
        },
        Arc::new(StaticToken::new("s3cret")),
    );
    let bound = server.bind().await.expect("bind relay");
    let addr = bound.http_addr().expect("http addr");
    tokio::spawn(bound.serve());

    // Wrong token: upgraded, then policy-closed
    let (mut denied, _) = connect_async(format!("ws://{}/tunnel?id=svc1&token=wrong", addr))
        .await
        .expect("upgrade");
    let mut saw_close = false;
    while let Some(Ok(message)) = denied.next().await {
        if let Message::Close(Some(frame)) = message {
            assert_eq!(u16::from(frame.code), 1008);
            saw_close = true;
            break;
        }
    }
    assert!(saw_close);

    // Correct token: tunnel serves traffic
    let (ws, _) = connect_async(format!("ws://{}/tunnel?id=svc1&token=s3cret", addr))
        .await
        .expect("upgrade");
    tokio::time::sleep(Duration::from_millis(200)).await;
    spawn_echo_client(ws);

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/svc1/echo", addr))
        .body("authed")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_idle_reaper_removes_silent_tunnel() {
    let (addr, registry) = start_relay(ServerConfig {
        port: 0,
        localhost_only: true,
        idle_threshold: Duration::from_secs(1),
        reap_interval: Duration::from_millis(500),
        ..Default::default()
    })
    .await;

    // Connect and then stay completely silent
    let ws = connect_tunnel(addr, "sleepy").await;
    assert!(registry.lookup("sleepy").is_ok());

    // Keep the ws alive but idle; the reaper should dispose it
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(registry.lookup("sleepy").is_err());
    drop(ws);

    let response = reqwest::get(format!("http://{}/sleepy/x", addr))
        .await
        .expect("request");
    assert_eq!(response.status(), 404);
}
