//! Pluggable control-channel authentication
//!
//! The relay itself ships no strong authentication; deployments plug their
//! own policy in through [`ConnectAuthorizer`]. Denial rejects the upgrade
//! with a policy-violation close.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication failed: {0}")]
    Denied(String),
}

/// Decides whether a control-channel connect is admitted
#[async_trait]
pub trait ConnectAuthorizer: Send + Sync {
    /// `token` is the `token` query parameter of the upgrade request, if any
    async fn authorize(&self, tunnel_id: &str, token: Option<&str>) -> Result<(), AuthError>;
}

/// Default authorizer: every connect is admitted
pub struct AllowAll;

#[async_trait]
impl ConnectAuthorizer for AllowAll {
    async fn authorize(&self, _tunnel_id: &str, _token: Option<&str>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Shared-secret authorizer: the connect must carry the configured token
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl ConnectAuthorizer for StaticToken {
    async fn authorize(&self, tunnel_id: &str, token: Option<&str>) -> Result<(), AuthError> {
        match token {
            Some(presented) if presented == self.token => Ok(()),
            Some(_) => Err(AuthError::Denied(format!(
                "invalid token for tunnel '{}'",
                tunnel_id
            ))),
            None => Err(AuthError::Denied(format!(
                "missing token for tunnel '{}'",
                tunnel_id
            ))),
        }
    }
}
