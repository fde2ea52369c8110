//! Client configuration

use crate::backoff::ReconnectConfig;
use crate::ClientError;
use url::Url;

/// What this client bridges the tunnel to
#[derive(Debug, Clone)]
pub enum TunnelMode {
    /// Forward HTTP envelopes to a local HTTP service
    Http { local_url: Url },
    /// Mirror TCP sub-streams onto a local host:port
    Tcp { local_addr: String },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client-chosen tunnel id; the routing prefix on the public side
    pub tunnel_id: String,
    /// Relay base URL (http:// or https://)
    pub server_address: Url,
    pub mode: TunnelMode,
    /// Local reverse-proxy port (HTTP mode only)
    pub proxy_port: Option<u16>,
    /// Shared-secret token passed on the connect query string
    pub auth_token: Option<String>,
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    pub fn http(
        tunnel_id: impl Into<String>,
        server_address: &str,
        local_address: &str,
    ) -> Result<Self, ClientError> {
        let tunnel_id = tunnel_id.into();
        validate_tunnel_id(&tunnel_id)?;
        Ok(Self {
            tunnel_id,
            server_address: parse_server_address(server_address)?,
            mode: TunnelMode::Http {
                local_url: Url::parse(local_address).map_err(|e| {
                    ClientError::Config(format!("invalid local address '{}': {}", local_address, e))
                })?,
            },
            proxy_port: None,
            auth_token: None,
            reconnect: ReconnectConfig::default(),
        })
    }

    pub fn tcp(
        tunnel_id: impl Into<String>,
        server_address: &str,
        local_addr: &str,
    ) -> Result<Self, ClientError> {
        let tunnel_id = tunnel_id.into();
        validate_tunnel_id(&tunnel_id)?;
        if !local_addr.contains(':') {
            return Err(ClientError::Config(format!(
                "local address '{}' must be host:port",
                local_addr
            )));
        }
        Ok(Self {
            tunnel_id,
            server_address: parse_server_address(server_address)?,
            mode: TunnelMode::Tcp {
                local_addr: local_addr.to_string(),
            },
            proxy_port: None,
            auth_token: None,
            reconnect: ReconnectConfig::default(),
        })
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self.mode, TunnelMode::Tcp { .. })
    }

    /// The ws(s) URL of the control-channel upgrade, query string included
    pub fn control_url(&self) -> Result<Url, ClientError> {
        let mut url = self.server_address.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ClientError::Config(format!(
                    "unsupported server address scheme '{}'",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Config("could not derive ws scheme".to_string()))?;
        url.set_path("/tunnel");
        url.set_query(None);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("id", &self.tunnel_id);
            if self.is_tcp() {
                query.append_pair("mode", "tcp");
            }
            if let Some(token) = &self.auth_token {
                query.append_pair("token", token);
            }
        }
        Ok(url)
    }
}

fn parse_server_address(address: &str) -> Result<Url, ClientError> {
    Url::parse(address)
        .map_err(|e| ClientError::Config(format!("invalid server address '{}': {}", address, e)))
}

fn validate_tunnel_id(id: &str) -> Result<(), ClientError> {
    if id.is_empty() || id.chars().any(|c| c.is_control() || c == '/') {
        return Err(ClientError::Config(format!("invalid tunnel id '{}'", id)));
    }
    Ok(())
}
