//! pgrok tunnel client
//!
//! Dials the relay's control channel, forwards relayed HTTP requests to a
//! colocated local service (or mirrors TCP sub-streams onto a local socket),
//! and reconnects with bounded-exponential backoff when the channel drops.

pub mod backoff;
pub mod config;
pub mod forward;
pub mod reverse_proxy;
pub mod supervisor;
pub mod tcp;

pub use backoff::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use config::{ClientConfig, TunnelMode};
pub use forward::LocalForwarder;
pub use supervisor::TunnelSupervisor;
pub use tcp::TcpMirror;

use thiserror::Error;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("reconnect attempts exhausted after {0} attempts")]
    ReconnectExhausted(usize),
}
