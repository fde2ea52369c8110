//! Tunnel registry
//!
//! In-memory mapping from tunnel id to active tunnel. Concurrent-safe for
//! independent keys; registration is atomic per id, and the occupancy
//! constraints (single-tunnel mode, at most one TCP tunnel) are checked and
//! inserted as one step. The registry is owned by the server component and
//! created at startup — it is never a global.

use crate::tunnel::{Tunnel, TunnelKind, TunnelSummary};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::trace;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tunnel id already in use: {0}")]
    IdInUse(String),

    #[error("single-tunnel mode: a tunnel is already registered")]
    SingleTunnelOccupied,

    #[error("conflict: a TCP tunnel is already connected")]
    TcpTunnelOccupied,

    #[error("no tunnel registered with id: {0}")]
    NotFound(String),
}

/// Registry of active tunnels
pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<Tunnel>>,
    single_tunnel: bool,
    // Serializes registration so the single-tunnel occupancy check and the
    // insert are one step.
    register_lock: Mutex<()>,
}

impl TunnelRegistry {
    pub fn new(single_tunnel: bool) -> Self {
        Self {
            tunnels: DashMap::new(),
            single_tunnel,
            register_lock: Mutex::new(()),
        }
    }

    pub fn single_tunnel_mode(&self) -> bool {
        self.single_tunnel
    }

    /// Register a tunnel under its id.
    ///
    /// The occupancy checks (single-tunnel mode, at most one TCP tunnel) and
    /// the insert happen under one lock, so concurrent registrations cannot
    /// both pass a check and then both insert.
    pub fn register(&self, tunnel: Arc<Tunnel>) -> Result<(), RegistryError> {
        let _guard = self.register_lock.lock().expect("register lock poisoned");

        if self.single_tunnel && !self.tunnels.is_empty() {
            return Err(RegistryError::SingleTunnelOccupied);
        }

        if tunnel.kind() == TunnelKind::Tcp && self.has_tcp_tunnel() {
            return Err(RegistryError::TcpTunnelOccupied);
        }

        match self.tunnels.entry(tunnel.id().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::IdInUse(tunnel.id().to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                trace!(tunnel_id = tunnel.id(), "registered tunnel");
                slot.insert(tunnel);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, id: &str) -> Result<Arc<Tunnel>, RegistryError> {
        self.tunnels
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Resolve the tunnel for a public request. In single-tunnel mode the
    /// path prefix is ignored and the sole tunnel is selected.
    pub fn route(&self, id: &str) -> Result<Arc<Tunnel>, RegistryError> {
        if self.single_tunnel {
            return self
                .tunnels
                .iter()
                .next()
                .map(|entry| entry.value().clone())
                .ok_or_else(|| RegistryError::NotFound(id.to_string()));
        }
        self.lookup(id)
    }

    /// Remove a tunnel. Idempotent; returns whether the id was present.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.tunnels.remove(id).is_some();
        if removed {
            trace!(tunnel_id = id, "removed tunnel");
        }
        removed
    }

    /// Point-in-time list for the status page and the idle reaper
    pub fn snapshot(&self) -> Vec<TunnelSummary> {
        self.tunnels
            .iter()
            .map(|entry| entry.value().summary())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.tunnels.iter().map(|entry| entry.key().clone()).collect()
    }

    /// The sole TCP-kind tunnel, if one is connected
    pub fn tcp_tunnel(&self) -> Option<Arc<Tunnel>> {
        self.tunnels
            .iter()
            .find(|entry| entry.value().kind() == TunnelKind::Tcp)
            .map(|entry| entry.value().clone())
    }

    pub fn has_tcp_tunnel(&self) -> bool {
        self.tcp_tunnel().is_some()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::ControlSender;

    fn tunnel(id: &str, kind: TunnelKind) -> Arc<Tunnel> {
        // Nothing in these tests sends frames, so the receiver can be dropped
        let (sender, _rx) = ControlSender::channel(1);
        Tunnel::new(id, kind, sender)
    }

    #[test]
    fn test_register_lookup_remove() {
        let registry = TunnelRegistry::new(false);
        registry.register(tunnel("svc1", TunnelKind::Http)).unwrap();

        assert_eq!(registry.lookup("svc1").unwrap().id(), "svc1");
        assert_eq!(registry.len(), 1);

        assert!(registry.remove("svc1"));
        assert!(!registry.remove("svc1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_id() {
        let registry = TunnelRegistry::new(false);
        registry.register(tunnel("svc1", TunnelKind::Http)).unwrap();

        let result = registry.register(tunnel("svc1", TunnelKind::Http));
        assert!(matches!(result, Err(RegistryError::IdInUse(id)) if id == "svc1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_not_found() {
        let registry = TunnelRegistry::new(false);
        assert!(matches!(
            registry.lookup("nope"),
            Err(RegistryError::NotFound(id)) if id == "nope"
        ));
    }

    #[test]
    fn test_single_tunnel_occupied() {
        let registry = TunnelRegistry::new(true);
        registry.register(tunnel("only", TunnelKind::Http)).unwrap();

        let result = registry.register(tunnel("other", TunnelKind::Http));
        assert!(matches!(result, Err(RegistryError::SingleTunnelOccupied)));
    }

    #[test]
    fn test_single_tunnel_route_ignores_prefix() {
        let registry = TunnelRegistry::new(true);
        registry.register(tunnel("only", TunnelKind::Http)).unwrap();

        // Any id routes to the sole tunnel
        assert_eq!(registry.route("whatever").unwrap().id(), "only");
    }

    #[test]
    fn test_multi_tunnel_route_by_id() {
        let registry = TunnelRegistry::new(false);
        registry.register(tunnel("a", TunnelKind::Http)).unwrap();
        registry.register(tunnel("b", TunnelKind::Http)).unwrap();

        assert_eq!(registry.route("b").unwrap().id(), "b");
        assert!(registry.route("c").is_err());
    }

    #[test]
    fn test_tcp_tunnel_lookup() {
        let registry = TunnelRegistry::new(false);
        assert!(!registry.has_tcp_tunnel());

        registry.register(tunnel("web", TunnelKind::Http)).unwrap();
        assert!(!registry.has_tcp_tunnel());

        registry.register(tunnel("raw", TunnelKind::Tcp)).unwrap();
        assert!(registry.has_tcp_tunnel());
        assert_eq!(registry.tcp_tunnel().unwrap().id(), "raw");
    }

    #[test]
    fn test_snapshot() {
        let registry = TunnelRegistry::new(false);
        registry.register(tunnel("a", TunnelKind::Http)).unwrap();
        registry.register(tunnel("b", TunnelKind::Tcp)).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        let mut ids: Vec<_> = snapshot.iter().map(|s| s.id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_no_duplicate_ids_under_contention() {
        let registry = Arc::new(TunnelRegistry::new(false));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                registry
                    .register(tunnel("contended", TunnelKind::Http))
                    .is_ok()
            }));
        }
        let wins = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|registered| *registered)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_second_tcp_tunnel_rejected() {
        let registry = TunnelRegistry::new(false);
        registry.register(tunnel("raw", TunnelKind::Tcp)).unwrap();

        let result = registry.register(tunnel("raw2", TunnelKind::Tcp));
        assert!(matches!(result, Err(RegistryError::TcpTunnelOccupied)));

        // HTTP tunnels are unaffected by the TCP constraint
        registry.register(tunnel("web", TunnelKind::Http)).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_tcp_exclusivity_under_contention() {
        // Distinct ids, so only the TCP check can reject
        let registry = Arc::new(TunnelRegistry::new(false));
        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                registry
                    .register(tunnel(&format!("raw{}", i), TunnelKind::Tcp))
                    .is_ok()
            }));
        }
        let wins = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|registered| *registered)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.has_tcp_tunnel());
    }
}
