//! Per-tunnel session registry (§6 **[ADDED]**).
//!
//! One process hosts many tunnels; each tunnel owns exactly one [`Session`].
//! The manager is the thing the axum adapter asks for "the session for this
//! subdomain" or "the session this agent is attaching to" — it never touches
//! stream state itself, matching the teacher's split between a connection
//! registry (`dashmap`-backed) and the per-connection logic living elsewhere.

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::Config;
use crate::registry::TunnelRegistry;
use crate::session::Session;

/// Maps a tunnel's public id to its live [`Session`], creating one lazily on
/// first agent attach (§3: "created on first agent attach") and dropping it
/// only when the caller explicitly deletes the tunnel (§3: "destroyed only
/// when the tunnel is deleted from the registry").
pub struct SessionManager {
    config: Config,
    registry: Arc<dyn TunnelRegistry>,
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionManager {
    pub fn new(config: Config, registry: Arc<dyn TunnelRegistry>) -> Self {
        Self {
            config,
            registry,
            sessions: DashMap::new(),
        }
    }

    /// Look up the session for an already-known tunnel id, if one exists.
    pub fn get(&self, tunnel_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(tunnel_id).map(|entry| Arc::clone(&entry))
    }

    /// Get the session for `tunnel_id`, creating it if this is the first
    /// attach the process has seen for it.
    pub fn get_or_create(&self, tunnel_id: &str) -> Arc<Session> {
        if let Some(session) = self.get(tunnel_id) {
            return session;
        }
        let session = Session::new(tunnel_id, self.config.clone(), Arc::clone(&self.registry));
        self.sessions
            .entry(tunnel_id.to_string())
            .or_insert_with(|| session)
            .clone()
    }

    /// Delete a tunnel's session entirely (§1: "no persistence of in-flight
    /// requests across session destruction"). Dropping the `Arc` here tears
    /// down the session once its agent and relay tasks finish unwinding.
    pub fn remove(&self, tunnel_id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(tunnel_id).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NullRegistry;

    fn manager() -> SessionManager {
        SessionManager::new(Config::for_test(), Arc::new(NullRegistry))
    }

    #[test]
    fn get_or_create_returns_the_same_session_on_repeat_lookups() {
        let mgr = manager();
        let a = mgr.get_or_create("t_1");
        let b = mgr.get_or_create("t_1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn distinct_tunnel_ids_get_distinct_sessions() {
        let mgr = manager();
        let a = mgr.get_or_create("t_1");
        let b = mgr.get_or_create("t_2");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn remove_drops_the_entry() {
        let mgr = manager();
        mgr.get_or_create("t_1");
        assert!(mgr.remove("t_1").is_some());
        assert!(mgr.get("t_1").is_none());
        assert!(mgr.is_empty());
    }
}
