//! Tunnel lifecycle plumbing shared by server and client
//!
//! Holds the tunnel record and registry, the pending-request correlator and
//! the serialized control-channel sender, plus the timing constants of the
//! liveness/reaping machinery.

pub mod pending;
pub mod registry;
pub mod tunnel;

pub use pending::{CorrelatorError, PendingRequests};
pub use registry::{RegistryError, TunnelRegistry};
pub use tunnel::{ChannelClosed, ControlSender, Tunnel, TunnelKind, TunnelSummary};

use std::time::Duration;

/// Interval between pings on an active control channel
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Silence on a control channel after which it is force-closed (two missed pings)
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(90);

/// Interval between heartbeat control frames on a TCP tunnel
pub const TCP_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for a public request to be answered by the client
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(120);

/// Deadline for the client's call to the colocated local service
pub const LOCAL_CALL_DEADLINE: Duration = Duration::from_secs(60);

/// How often the idle reaper scans the registry
pub const REAP_INTERVAL: Duration = Duration::from_secs(300);

/// Idle age beyond which the reaper disposes a tunnel
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(30 * 60);
