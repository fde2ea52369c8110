//! Relay server configuration

use pgrok_control::{IDLE_THRESHOLD, REAP_INTERVAL, REQUEST_DEADLINE};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port for the public HTTP surface and the control-channel upgrade
    pub port: u16,
    /// Bind to 127.0.0.1 instead of 0.0.0.0
    pub localhost_only: bool,
    /// Admit at most one tunnel and serve all public paths from it
    pub single_tunnel: bool,
    /// Public raw-TCP listener port (enables the TCP relay)
    pub tcp_port: Option<u16>,
    /// Second plain-HTTP listener serving the same routing surface
    pub proxy_port: Option<u16>,
    /// Deadline for a public request to be answered by the client
    pub request_deadline: Duration,
    /// Idle age beyond which the reaper disposes a tunnel
    pub idle_threshold: Duration,
    /// How often the idle reaper scans the registry
    pub reap_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            localhost_only: false,
            single_tunnel: false,
            tcp_port: None,
            proxy_port: None,
            request_deadline: REQUEST_DEADLINE,
            idle_threshold: IDLE_THRESHOLD,
            reap_interval: REAP_INTERVAL,
        }
    }
}

impl ServerConfig {
    pub fn bind_ip(&self) -> IpAddr {
        if self.localhost_only {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip(), self.port)
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_port.map(|port| SocketAddr::new(self.bind_ip(), port))
    }

    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        self.proxy_port
            .map(|port| SocketAddr::new(self.bind_ip(), port))
    }
}
