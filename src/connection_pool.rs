//! Process-wide registry mapping session id to live Connection.
//!
//! Per the note on global singletons: this is constructed once with an
//! explicit `init`-style constructor and its handle (an `Arc`) is passed
//! into the components that need it, rather than read from module scope.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::colab::Tier;
use crate::connection::Connection;
use crate::error::Error;

/// Exclusive owner of live Connections, keyed by Session Record id.
pub struct ConnectionPool {
    connections: DashMap<String, Arc<Connection>>,
    tier: RwLock<Option<Tier>>,
}

impl ConnectionPool {
    /// Construct an empty pool with no detected tier yet.
    pub fn init() -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            tier: RwLock::new(None),
        })
    }

    /// Look up the live Connection for a session, if any.
    pub fn get(&self, session_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(session_id).map(|entry| entry.clone())
    }

    /// Register a live Connection for a session, replacing any prior entry.
    pub fn put(&self, session_id: impl Into<String>, connection: Arc<Connection>) {
        self.connections.insert(session_id.into(), connection);
    }

    /// Remove and shut down the Connection for a session, if any.
    pub async fn remove(&self, session_id: &str) -> Result<(), Error> {
        if let Some((_, connection)) = self.connections.remove(session_id) {
            connection.shutdown(false).await?;
        }
        Ok(())
    }

    /// Number of live connections currently held.
    pub fn size(&self) -> usize {
        self.connections.len()
    }

    /// The detected subscription tier, if authentication has completed.
    pub async fn tier(&self) -> Option<Tier> {
        *self.tier.read().await
    }

    /// Set the detected subscription tier after authentication.
    pub async fn set_tier(&self, tier: Tier) {
        *self.tier.write().await = Some(tier);
    }

    /// Shut down every live connection. Used on process exit.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.connections.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            let _ = self.remove(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_tier_independently_of_connections() {
        let pool = ConnectionPool::init();
        assert!(pool.tier().await.is_none());
        pool.set_tier(Tier::Pro).await;
        assert_eq!(pool.tier().await, Some(Tier::Pro));
        assert_eq!(pool.size(), 0);
    }
}
