//! Relay server assembly
//!
//! Owns the registry for its whole lifetime: created at startup, drained by
//! tunnel loops and the reaper, gone at shutdown. Binding is split from
//! serving so callers (and tests) can bind port 0 and read the real address.

use crate::auth::ConnectAuthorizer;
use crate::config::ServerConfig;
use crate::tcp::TcpRelay;
use crate::{control, ingress, status};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use pgrok_control::TunnelRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}:{port}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Shared state behind every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TunnelRegistry>,
    pub authorizer: Arc<dyn ConnectAuthorizer>,
    pub tcp_relay: Option<Arc<TcpRelay>>,
    pub request_deadline: Duration,
    pub shutdown: CancellationToken,
}

/// The relay server, ready to bind
pub struct RelayServer {
    config: ServerConfig,
    authorizer: Arc<dyn ConnectAuthorizer>,
    shutdown: CancellationToken,
}

impl RelayServer {
    pub fn new(config: ServerConfig, authorizer: Arc<dyn ConnectAuthorizer>) -> Self {
        Self {
            config,
            authorizer,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the whole server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind all configured listeners
    pub async fn bind(self) -> Result<BoundRelay, ServerError> {
        let registry = Arc::new(TunnelRegistry::new(self.config.single_tunnel));

        let http_listener = bind_listener(self.config.http_addr()).await?;
        let http_addr = http_listener.local_addr()?;

        let tcp = match self.config.tcp_addr() {
            Some(addr) => {
                let listener = bind_listener(addr).await?;
                let relay = TcpRelay::new(registry.clone(), self.shutdown.clone());
                Some((listener, relay))
            }
            None => None,
        };

        let proxy_listener = match self.config.proxy_addr() {
            Some(addr) => Some(bind_listener(addr).await?),
            None => None,
        };

        let state = AppState {
            registry,
            authorizer: self.authorizer,
            tcp_relay: tcp.as_ref().map(|(_, relay)| relay.clone()),
            request_deadline: self.config.request_deadline,
            shutdown: self.shutdown.clone(),
        };

        info!("relay server listening on http://{}", http_addr);
        if self.config.single_tunnel {
            info!("single-tunnel mode: all public paths route to the sole tunnel");
        }

        Ok(BoundRelay {
            config: self.config,
            state,
            http_listener,
            tcp,
            proxy_listener,
            shutdown: self.shutdown,
        })
    }

    /// Bind and serve until the shutdown token fires
    pub async fn run(self) -> Result<(), ServerError> {
        self.bind().await?.serve().await
    }
}

/// A relay with its listeners bound; addresses are now known
pub struct BoundRelay {
    config: ServerConfig,
    state: AppState,
    http_listener: TcpListener,
    tcp: Option<(TcpListener, Arc<TcpRelay>)>,
    proxy_listener: Option<TcpListener>,
    shutdown: CancellationToken,
}

impl BoundRelay {
    pub fn http_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.http_listener.local_addr()?)
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp
            .as_ref()
            .and_then(|(listener, _)| listener.local_addr().ok())
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn serve(self) -> Result<(), ServerError> {
        let router = build_router(self.state.clone());

        tokio::spawn(idle_reaper(
            self.state.registry.clone(),
            self.config.idle_threshold,
            self.config.reap_interval,
            self.shutdown.clone(),
        ));

        if let Some((listener, relay)) = self.tcp {
            tokio::spawn(relay.run(listener));
        }

        if let Some(listener) = self.proxy_listener {
            let proxy_router = build_router(self.state.clone());
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if let Err(err) = axum::serve(listener, proxy_router)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await
                {
                    warn!(%err, "proxy listener failed");
                }
            });
        }

        axum::serve(self.http_listener, router)
            .with_graceful_shutdown(self.shutdown.cancelled_owned())
            .await?;

        info!("relay server stopped");
        Ok(())
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/$status", get(status::status_page))
        .route("/tunnel", get(control::tunnel_upgrade))
        .fallback(ingress::proxy_request)
        .with_state(state)
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
        address: addr.ip().to_string(),
        port: addr.port(),
        reason: e.to_string(),
    })
}

/// Dispose tunnels idle beyond the threshold; removal itself stays with the
/// owning processing loop.
async fn idle_reaper(
    registry: Arc<TunnelRegistry>,
    idle_threshold: Duration,
    reap_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(reap_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                for summary in registry.snapshot() {
                    let idle = (Utc::now() - summary.last_activity)
                        .to_std()
                        .unwrap_or_default();
                    if idle >= idle_threshold {
                        if let Ok(tunnel) = registry.lookup(&summary.id) {
                            warn!(
                                tunnel_id = summary.id,
                                idle_secs = idle.as_secs(),
                                "reaping idle tunnel"
                            );
                            tunnel.dispose();
                        }
                    }
                }
            }
        }
    }
}
