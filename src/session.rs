//! The live endpoint table.
//!
//! One `SessionCache` is created by the composition root and shared by
//! reference between the convergence manager and the API handlers.  It is
//! the manager's own endpoint table, not a mirror of it, so the two cannot
//! diverge.  Read-modify-write sequences that span an adapter call hold the
//! guard returned by [`SessionCache::lock`] for their whole duration.

use std::collections::HashMap;

use tokio::sync::{Mutex, MutexGuard};

use crate::types::Endpoint;

pub type EndpointTable = HashMap<String, Endpoint>;

#[derive(Default)]
pub struct SessionCache {
    endpoints: Mutex<EndpointTable>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access to the table. Released when the guard drops,
    /// including on early returns and cancelled futures.
    pub async fn lock(&self) -> MutexGuard<'_, EndpointTable> {
        self.endpoints.lock().await
    }

    pub async fn get(&self, container_id: &str) -> Option<Endpoint> {
        self.endpoints.lock().await.get(container_id).cloned()
    }

    #[allow(dead_code)]
    pub async fn set(&self, endpoint: Endpoint) -> Option<Endpoint> {
        self.endpoints
            .lock()
            .await
            .insert(endpoint.container_id.clone(), endpoint)
    }

    #[allow(dead_code)]
    pub async fn delete(&self, container_id: &str) -> Option<Endpoint> {
        self.endpoints.lock().await.remove(container_id)
    }

    /// Endpoints sorted by container id.
    pub async fn list(&self) -> Vec<Endpoint> {
        let mut all: Vec<_> = self.endpoints.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        all
    }

    pub async fn snapshot(&self) -> EndpointTable {
        self.endpoints.lock().await.clone()
    }
}
