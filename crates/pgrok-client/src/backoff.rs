//! Reconnection backoff
//!
//! Bounded-exponential delays with multiplicative jitter. The delay sequence
//! grows by the configured factor, is jittered uniformly per attempt and
//! never exceeds the configured maximum; an attempt ceiling terminates the
//! supervisor.

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// First backoff delay
    pub initial_backoff: Duration,
    /// Delay cap
    pub max_backoff: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Uniform jitter bounds applied to each delay
    pub jitter: (f64, f64),
    /// Attempt ceiling (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(120),
            multiplier: 1.5,
            jitter: (0.8, 1.2),
            max_attempts: Some(100),
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("max reconnection attempts reached")]
    MaxAttemptsReached,
}

/// Backoff state across reconnection attempts
pub struct ReconnectManager {
    config: ReconnectConfig,
    base: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            base: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Compute the next delay and advance the backoff state
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectError> {
        self.attempt += 1;
        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        let (low, high) = self.config.jitter;
        let jitter = rand::thread_rng().gen_range(low..=high);
        let delay = self.base.mul_f64(jitter).min(self.config.max_backoff);

        self.base = self
            .base
            .mul_f64(self.config.multiplier)
            .min(self.config.max_backoff);

        Ok(delay)
    }

    /// Sleep for the next delay
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        let delay = self.next_delay()?;
        debug!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.attempt,
            "waiting before reconnection attempt"
        );
        sleep(delay).await;
        Ok(())
    }

    /// Call after a successful connection
    pub fn reset(&mut self) {
        debug!("resetting reconnection backoff");
        self.base = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}
