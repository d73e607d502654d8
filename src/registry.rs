//! Registry and front-door interfaces (§6 **[ADDED]**).
//!
//! The tunnel registry database and the hostname-routing front door are
//! explicitly out of scope (§1 Out of scope) — they are external
//! collaborators reached only through this trait, mirroring how the
//! teacher's remote-config client is injected into its server context
//! rather than constructed inline.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct TunnelRecord {
    pub public_id: String,
    pub subdomain: String,
    pub owner_id: String,
    pub status: TunnelStatus,
}

/// The core's only view of the registry database (§6: `findTunnelBySubdomain`,
/// `markTunnelStatus`).
#[async_trait]
pub trait TunnelRegistry: Send + Sync {
    async fn find_by_subdomain(&self, subdomain: &str) -> Option<TunnelRecord>;
    async fn mark_status(&self, public_id: &str, status: TunnelStatus, at: SystemTime);
}

/// No-op registry for tests and standalone runs: every lookup misses, every
/// status update is dropped.
#[derive(Debug, Default)]
pub struct NullRegistry;

#[async_trait]
impl TunnelRegistry for NullRegistry {
    async fn find_by_subdomain(&self, _subdomain: &str) -> Option<TunnelRecord> {
        None
    }

    async fn mark_status(&self, _public_id: &str, _status: TunnelStatus, _at: SystemTime) {}
}

/// Fixed in-memory table, for the demo binary and integration tests that
/// need a lookup to actually succeed.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    records: RwLock<HashMap<String, TunnelRecord>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: TunnelRecord) {
        self.records
            .write()
            .insert(record.subdomain.clone(), record);
    }
}

#[async_trait]
impl TunnelRegistry for StaticRegistry {
    async fn find_by_subdomain(&self, subdomain: &str) -> Option<TunnelRecord> {
        self.records.read().get(subdomain).cloned()
    }

    async fn mark_status(&self, public_id: &str, status: TunnelStatus, _at: SystemTime) {
        let mut records = self.records.write();
        if let Some(record) = records.values_mut().find(|r| r.public_id == public_id) {
            record.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_registry_round_trips_a_lookup() {
        let registry = StaticRegistry::new();
        registry.insert(TunnelRecord {
            public_id: "t_1".into(),
            subdomain: "crimson-otter".into(),
            owner_id: "u_1".into(),
            status: TunnelStatus::Offline,
        });
        let found = registry.find_by_subdomain("crimson-otter").await.unwrap();
        assert_eq!(found.public_id, "t_1");

        registry
            .mark_status("t_1", TunnelStatus::Online, SystemTime::now())
            .await;
        let found = registry.find_by_subdomain("crimson-otter").await.unwrap();
        assert_eq!(found.status, TunnelStatus::Online);
    }

    #[tokio::test]
    async fn null_registry_always_misses() {
        let registry = NullRegistry;
        assert!(registry.find_by_subdomain("anything").await.is_none());
    }
}
