//! End-to-end tests: real relay server, real client, real local services

use axum::body::Bytes;
use axum::extract::Request;
use axum::response::IntoResponse;
use axum::Router;
use pgrok_client::{ClientConfig, ReconnectConfig, TunnelSupervisor};
use pgrok_server::{AllowAll, RelayServer, ServerConfig};
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

struct Relay {
    http_addr: SocketAddr,
    tcp_addr: Option<SocketAddr>,
    registry: Arc<pgrok_control::TunnelRegistry>,
}

async fn start_relay(config: ServerConfig) -> Relay {
    let server = RelayServer::new(config, Arc::new(AllowAll));
    let bound = server.bind().await.expect("bind relay");
    let relay = Relay {
        http_addr: bound.http_addr().expect("http addr"),
        tcp_addr: bound.tcp_addr(),
        registry: bound.state().registry.clone(),
    };
    tokio::spawn(bound.serve());
    relay
}

/// Local HTTP service that echoes the request body as text/plain
async fn start_local_echo() -> SocketAddr {
    async fn echo(req: Request) -> impl IntoResponse {
        let body = axum::body::to_bytes(req.into_body(), usize::MAX)
            .await
            .unwrap_or_default();
        ([("content-type", "text/plain")], body)
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");
    let app = Router::new().fallback(echo);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Local TCP service that echoes bytes back
async fn start_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind tcp echo");
    let addr = listener.local_addr().expect("tcp echo addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Spawn a supervisor and wait until its tunnel shows up in the registry
async fn start_client(config: ClientConfig, relay: &Relay) -> CancellationToken {
    let tunnel_id = config.tunnel_id.clone();
    let supervisor = TunnelSupervisor::new(config);
    let shutdown = supervisor.shutdown_token();
    tokio::spawn(supervisor.run());
    wait_for_tunnel(relay, &tunnel_id).await;
    shutdown
}

async fn wait_for_tunnel(relay: &Relay, tunnel_id: &str) {
    for _ in 0..100 {
        if relay.registry.lookup(tunnel_id).is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("tunnel '{}' never registered", tunnel_id);
}

#[tokio::test]
async fn test_http_echo_end_to_end() {
    let relay = start_relay(ServerConfig {
        port: 0,
        localhost_only: true,
        ..Default::default()
    })
    .await;
    let echo_addr = start_local_echo().await;

    let config = ClientConfig::http(
        "svc1",
        &format!("http://{}", relay.http_addr),
        &format!("http://{}", echo_addr),
    )
    .expect("client config");
    let _shutdown = start_client(config, &relay).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/svc1/echo", relay.http_addr))
        .body("hello")
        .send()
        .await
        .expect("public request");

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello");
}

#[tokio::test]
async fn test_binary_body_round_trip() {
    let relay = start_relay(ServerConfig {
        port: 0,
        localhost_only: true,
        ..Default::default()
    })
    .await;
    let echo_addr = start_local_echo().await;

    let config = ClientConfig::http(
        "bin",
        &format!("http://{}", relay.http_addr),
        &format!("http://{}", echo_addr),
    )
    .expect("client config");
    let _shutdown = start_client(config, &relay).await;

    let mut payload = vec![0u8; 32 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/bin/blob", relay.http_addr))
        .body(payload.clone())
        .send()
        .await
        .expect("public request");

    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap(), Bytes::from(payload));
}

#[tokio::test]
async fn test_client_shutdown_fails_inflight_with_503() {
    let relay = start_relay(ServerConfig {
        port: 0,
        localhost_only: true,
        ..Default::default()
    })
    .await;

    // A local service that never answers in time
    async fn slow() -> &'static str {
        tokio::time::sleep(Duration::from_secs(30)).await;
        "too late"
    }
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind slow");
    let slow_addr = listener.local_addr().expect("slow addr");
    tokio::spawn(async move {
        let app = Router::new().fallback(slow);
        let _ = axum::serve(listener, app).await;
    });

    let config = ClientConfig::http(
        "svc1",
        &format!("http://{}", relay.http_addr),
        &format!("http://{}", slow_addr),
    )
    .expect("client config");
    let shutdown = start_client(config, &relay).await;

    let http_addr = relay.http_addr;
    let request = tokio::spawn(async move {
        reqwest::Client::new()
            .get(format!("http://{}/svc1/slow", http_addr))
            .send()
            .await
            .expect("public request")
    });

    // Stop the client while the request is in flight
    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.cancel();

    let response = request.await.expect("join");
    assert_eq!(response.status(), 503);
    let body = response.text().await.unwrap();
    assert!(body.contains("Tunnel Disconnected"), "body: {}", body);

    // The registry entry is gone within a second
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(relay.registry.lookup("svc1").is_err());
}

#[tokio::test]
async fn test_client_reconnects_after_tunnel_disposed() {
    let relay = start_relay(ServerConfig {
        port: 0,
        localhost_only: true,
        ..Default::default()
    })
    .await;
    let echo_addr = start_local_echo().await;

    let mut config = ClientConfig::http(
        "svc1",
        &format!("http://{}", relay.http_addr),
        &format!("http://{}", echo_addr),
    )
    .expect("client config");
    // Short backoff keeps the test fast
    config.reconnect = ReconnectConfig {
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(500),
        ..Default::default()
    };
    let _shutdown = start_client(config, &relay).await;

    // Kill the tunnel from the server side; the client must come back
    relay
        .registry
        .lookup("svc1")
        .expect("tunnel registered")
        .dispose();

    tokio::time::sleep(Duration::from_millis(300)).await;
    wait_for_tunnel(&relay, "svc1").await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/svc1/echo", relay.http_addr))
        .body("back again")
        .send()
        .await
        .expect("public request");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "back again");
}

#[tokio::test]
async fn test_tcp_passthrough_concurrent_streams() {
    let relay = start_relay(ServerConfig {
        port: 0,
        localhost_only: true,
        tcp_port: Some(0),
        ..Default::default()
    })
    .await;
    let tcp_public = relay.tcp_addr.expect("tcp listener");
    let tcp_echo = start_tcp_echo().await;

    let config = ClientConfig::tcp(
        "raw",
        &format!("http://{}", relay.http_addr),
        &tcp_echo.to_string(),
    )
    .expect("client config");
    let _shutdown = start_client(config, &relay).await;

    const STREAMS: usize = 5;
    const PAYLOAD: usize = 64 * 1024;

    let mut tasks = Vec::new();
    for _ in 0..STREAMS {
        tasks.push(tokio::spawn(async move {
            let mut payload = vec![0u8; PAYLOAD];
            rand::thread_rng().fill_bytes(&mut payload);

            let mut socket = TcpStream::connect(tcp_public).await.expect("dial public");
            socket.write_all(&payload).await.expect("write payload");

            let mut received = vec![0u8; PAYLOAD];
            socket
                .read_exact(&mut received)
                .await
                .expect("read echoed payload");
            assert_eq!(received, payload, "payload mismatch");
        }));
    }

    for task in tasks {
        tokio::time::timeout(Duration::from_secs(30), task)
            .await
            .expect("stream timed out")
            .expect("stream task");
    }
}

#[tokio::test]
async fn test_dispatch_through_reverse_proxy() {
    let relay = start_relay(ServerConfig {
        port: 0,
        localhost_only: true,
        ..Default::default()
    })
    .await;
    let echo_addr = start_local_echo().await;

    // svc2 answers dispatches; svc1 originates them via its proxy port
    let svc2 = ClientConfig::http(
        "svc2",
        &format!("http://{}", relay.http_addr),
        &format!("http://{}", echo_addr),
    )
    .expect("svc2 config");
    let _svc2_shutdown = start_client(svc2, &relay).await;

    // Grab a free local port for the reverse proxy
    let probe = TcpListener::bind("127.0.0.1:0").await.expect("probe bind");
    let proxy_port = probe.local_addr().expect("probe addr").port();
    drop(probe);

    let mut svc1 = ClientConfig::http(
        "svc1",
        &format!("http://{}", relay.http_addr),
        &format!("http://{}", echo_addr),
    )
    .expect("svc1 config");
    svc1.proxy_port = Some(proxy_port);
    let _svc1_shutdown = start_client(svc1, &relay).await;

    // Give the reverse-proxy listener a moment to come up
    tokio::time::sleep(Duration::from_millis(300)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://127.0.0.1:{}/svc2/echo", proxy_port))
        .body("dispatched")
        .send()
        .await
        .expect("dispatch request");

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "dispatched");
}

#[tokio::test]
async fn test_concurrent_tcp_clients_only_one_registers() {
    let relay = start_relay(ServerConfig {
        port: 0,
        localhost_only: true,
        tcp_port: Some(0),
        ..Default::default()
    })
    .await;
    let tcp_echo = start_tcp_echo().await;

    // Both upgrades fire at once; exactly one may win the TCP slot
    let mut shutdowns = Vec::new();
    for id in ["raw-a", "raw-b"] {
        let config = ClientConfig::tcp(
            id,
            &format!("http://{}", relay.http_addr),
            &tcp_echo.to_string(),
        )
        .expect("client config");
        let supervisor = TunnelSupervisor::new(config);
        shutdowns.push(supervisor.shutdown_token());
        tokio::spawn(supervisor.run());
    }

    for _ in 0..100 {
        if relay.registry.has_tcp_tunnel() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(relay.registry.has_tcp_tunnel());

    // Give the losing attempt time to land and be rejected
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(relay.registry.len(), 1);

    for shutdown in shutdowns {
        shutdown.cancel();
    }
}

#[tokio::test]
async fn test_second_tcp_client_rejected() {
    let relay = start_relay(ServerConfig {
        port: 0,
        localhost_only: true,
        tcp_port: Some(0),
        ..Default::default()
    })
    .await;
    let tcp_echo = start_tcp_echo().await;

    let config = ClientConfig::tcp(
        "raw",
        &format!("http://{}", relay.http_addr),
        &tcp_echo.to_string(),
    )
    .expect("client config");
    let _shutdown = start_client(config, &relay).await;

    // A second TCP tunnel is rejected with conflict, so it never registers
    let second = ClientConfig::tcp(
        "raw2",
        &format!("http://{}", relay.http_addr),
        &tcp_echo.to_string(),
    )
    .expect("client config");
    let supervisor = TunnelSupervisor::new(second);
    let shutdown = supervisor.shutdown_token();
    tokio::spawn(supervisor.run());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(relay.registry.lookup("raw2").is_err());
    assert_eq!(relay.registry.len(), 1);
    shutdown.cancel();
}
