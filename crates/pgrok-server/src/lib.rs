//! pgrok relay server
//!
//! Accepts WebSocket control channels from tunnel clients at `/tunnel`,
//! serves public HTTP traffic routed by tunnel-id path prefix, multiplexes a
//! public TCP listener over the sole TCP tunnel, and reaps idle tunnels.

pub mod auth;
pub mod config;
mod control;
mod dispatch;
mod ingress;
mod relay;
pub mod server;
mod status;
pub mod tcp;

pub use auth::{AllowAll, AuthError, ConnectAuthorizer, StaticToken};
pub use config::ServerConfig;
pub use server::{AppState, BoundRelay, RelayServer, ServerError};
pub use tcp::TcpRelay;
