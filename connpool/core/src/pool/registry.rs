//! Manager Registry
//!
//! Tracks live connection managers so they can all be shut down together,
//! for example when the host process exits. Entries are weak: the registry
//! never keeps a manager alive, and managers unregister themselves when
//! shut down.

use std::sync::{Arc, Weak};

use dashmap::DashMap;

use super::ConnectionManager;
use crate::connection::ManagerId;

/// Registry of live connection managers
#[derive(Default)]
pub struct ManagerRegistry {
    managers: DashMap<ManagerId, Weak<dyn ConnectionManager>>,
}

impl ManagerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a manager
    pub fn register(&self, manager: &Arc<dyn ConnectionManager>) {
        let id = manager.id();
        self.managers.insert(id, Arc::downgrade(manager));
        tracing::info!(manager_id = %id, "Connection manager registered");
    }

    /// Unregister a manager
    ///
    /// Returns `true` if it was registered.
    pub fn unregister(&self, id: ManagerId) -> bool {
        let removed = self.managers.remove(&id).is_some();
        if removed {
            tracing::info!(manager_id = %id, "Connection manager unregistered");
        }
        removed
    }

    /// Whether a manager is registered and still alive
    #[must_use]
    pub fn contains(&self, id: ManagerId) -> bool {
        self.managers
            .get(&id)
            .is_some_and(|entry| entry.strong_count() > 0)
    }

    /// Number of registered managers that are still alive
    #[must_use]
    pub fn count(&self) -> usize {
        self.managers
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// Shut down every registered manager
    ///
    /// Returns the number of managers shut down.
    pub fn shutdown_all(&self) -> usize {
        // Collect first: shutdown unregisters, which needs the map unlocked
        let live: Vec<Arc<dyn ConnectionManager>> = self
            .managers
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        self.managers.retain(|_, manager| manager.strong_count() > 0);

        for manager in &live {
            manager.shutdown();
            self.managers.remove(&manager.id());
        }
        tracing::info!(count = live.len(), "Shut down all connection managers");
        live.len()
    }
}

impl std::fmt::Debug for ManagerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerRegistry")
            .field("managers", &self.managers.len())
            .finish()
    }
}
