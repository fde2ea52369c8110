//! pgrok CLI - expose local services through a public relay

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pgrok_client::{ClientConfig, TunnelSupervisor};
use pgrok_server::{AllowAll, ConnectAuthorizer, RelayServer, ServerConfig, StaticToken};

/// pgrok - reverse HTTP/TCP tunnels over a single public endpoint
#[derive(Parser, Debug)]
#[command(name = "pgrok")]
#[command(about = "Expose local services through a public relay", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "PGROK_LOG")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public relay server
    StartServer {
        /// Public HTTP port (control channels upgrade on the same port)
        #[arg(long, default_value_t = 8080, env = "PGROK_PORT")]
        port: u16,

        /// Bind to 127.0.0.1 instead of 0.0.0.0
        #[arg(long, env = "PGROK_LOCALHOST")]
        localhost: bool,

        /// Admit at most one tunnel and route every public path to it
        #[arg(long = "single-tunnel", visible_alias = "singleTunnel", env = "PGROK_SINGLE_TUNNEL")]
        single_tunnel: bool,

        /// Public raw-TCP listener port (enables the TCP relay)
        #[arg(long = "tcp-port", visible_alias = "tcpPort", env = "PGROK_TCPPORT")]
        tcp_port: Option<u16>,

        /// Second plain-HTTP listener serving the same routing surface
        #[arg(long = "proxy-port", visible_alias = "proxyPort", env = "PGROK_PROXYPORT")]
        proxy_port: Option<u16>,

        /// Shared secret clients must present on connect
        #[arg(long = "auth-token", visible_alias = "authToken", env = "PGROK_AUTH_TOKEN")]
        auth_token: Option<String>,
    },
    /// Run an HTTP tunnel client
    Start {
        /// Tunnel id; the public routing prefix
        #[arg(long = "tunnel-id", visible_alias = "tunnelId", env = "PGROK_TUNNEL_ID")]
        tunnel_id: String,

        /// Relay base URL, e.g. http://relay.example.com:8080
        #[arg(long = "server-address", visible_alias = "serverAddress", env = "PGROK_SERVER_ADDRESS")]
        server_address: String,

        /// Local HTTP service base URL, e.g. http://127.0.0.1:5000
        #[arg(long = "local-address", visible_alias = "localAddress", env = "PGROK_LOCAL_ADDRESS")]
        local_address: String,

        /// Local reverse-proxy port for dispatching to sibling tunnels
        #[arg(long = "proxy-port", visible_alias = "proxyPort", env = "PGROK_PROXYPORT")]
        proxy_port: Option<u16>,

        /// Shared secret for the relay's auth hook
        #[arg(long = "auth-token", visible_alias = "authToken", env = "PGROK_AUTH_TOKEN")]
        auth_token: Option<String>,
    },
    /// Run a TCP tunnel client
    StartTcp {
        /// Tunnel id
        #[arg(long = "tunnel-id", visible_alias = "tunnelId", env = "PGROK_TUNNEL_ID")]
        tunnel_id: String,

        /// Relay base URL, e.g. http://relay.example.com:8080
        #[arg(long = "server-address", visible_alias = "serverAddress", env = "PGROK_SERVER_ADDRESS")]
        server_address: String,

        /// Local TCP service address, e.g. 127.0.0.1:9000
        #[arg(long = "local-address", visible_alias = "localAddress", env = "PGROK_LOCAL_ADDRESS")]
        local_address: String,

        /// Shared secret for the relay's auth hook
        #[arg(long = "auth-token", visible_alias = "authToken", env = "PGROK_AUTH_TOKEN")]
        auth_token: Option<String>,
    },
}

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::StartServer {
            port,
            localhost,
            single_tunnel,
            tcp_port,
            proxy_port,
            auth_token,
        } => {
            let config = ServerConfig {
                port,
                localhost_only: localhost,
                single_tunnel,
                tcp_port,
                proxy_port,
                ..Default::default()
            };

            let authorizer: Arc<dyn ConnectAuthorizer> = match auth_token {
                Some(token) => Arc::new(StaticToken::new(token)),
                None => Arc::new(AllowAll),
            };

            let server = RelayServer::new(config, authorizer);
            let shutdown = server.shutdown_token();

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    shutdown.cancel();
                }
            });

            server.run().await.context("relay server failed")?;
        }
        Commands::Start {
            tunnel_id,
            server_address,
            local_address,
            proxy_port,
            auth_token,
        } => {
            let mut config = ClientConfig::http(tunnel_id, &server_address, &local_address)
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            config.proxy_port = proxy_port;
            config.auth_token = auth_token;

            run_client(config).await?;
        }
        Commands::StartTcp {
            tunnel_id,
            server_address,
            local_address,
            auth_token,
        } => {
            let mut config = ClientConfig::tcp(tunnel_id, &server_address, &local_address)
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            config.auth_token = auth_token;

            run_client(config).await?;
        }
    }

    Ok(())
}

async fn run_client(config: ClientConfig) -> Result<()> {
    let supervisor = TunnelSupervisor::new(config);
    let shutdown = supervisor.shutdown_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    if let Err(err) = supervisor.run().await {
        warn!(%err, "tunnel client terminated");
        return Err(anyhow::anyhow!("{}", err));
    }
    Ok(())
}
