//! In-process coordinator
//!
//! Local hashmaps, no cross-process effect. The default for single-node
//! deployments and the workhorse of the test suite.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::{Coordinator, NodeIdentity, node_is_active, spawn_heartbeat};
use crate::Result;
use crate::model::{ClusterNodeState, ClusterSessionRecord, ServerStatusEntry};

pub struct MemoryCoordinator {
    identity: NodeIdentity,
    nodes: std::sync::Arc<RwLock<HashMap<String, ClusterNodeState>>>,
    sessions: RwLock<HashMap<String, ClusterSessionRecord>>,
    servers: std::sync::Arc<RwLock<Vec<ServerStatusEntry>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl MemoryCoordinator {
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            nodes: Default::default(),
            sessions: Default::default(),
            servers: Default::default(),
            cancel: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl Coordinator for MemoryCoordinator {
    async fn initialize(&self) -> Result<()> {
        let state = self.identity.fresh_state(self.servers.read().clone());
        self.nodes.write().insert(state.node_id.clone(), state);

        let cancel = CancellationToken::new();
        let nodes = self.nodes.clone();
        let servers = self.servers.clone();
        let identity = self.identity.clone();
        spawn_heartbeat(self.identity.heartbeat_interval, cancel.clone(), move || {
            let nodes = nodes.clone();
            let servers = servers.clone();
            let identity = identity.clone();
            async move {
                let state = identity.fresh_state(servers.read().clone());
                nodes.write().insert(state.node_id.clone(), state);
                Ok(())
            }
        });
        *self.cancel.lock() = Some(cancel);

        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        self.nodes.write().remove(&self.identity.node_id);
        Ok(())
    }

    async fn register_local_servers(&self, servers: Vec<ServerStatusEntry>) -> Result<()> {
        *self.servers.write() = servers.clone();
        let state = self.identity.fresh_state(servers);
        self.nodes.write().insert(state.node_id.clone(), state);
        Ok(())
    }

    async fn record_session(
        &self,
        record: &ClusterSessionRecord,
        _ttl: Option<Duration>,
    ) -> Result<()> {
        self.sessions
            .write()
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ClusterSessionRecord>> {
        Ok(self.sessions.read().get(session_id).cloned())
    }

    async fn clear_session(&self, session_id: &str) -> Result<()> {
        self.sessions.write().remove(session_id);
        Ok(())
    }

    async fn get_active_nodes(&self) -> Result<Vec<ClusterNodeState>> {
        Ok(self
            .nodes
            .read()
            .values()
            .filter(|n| node_is_active(n, self.identity.offline_after_ms))
            .cloned()
            .collect())
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<ClusterNodeState>> {
        Ok(self.nodes.read().get(node_id).cloned())
    }

    fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    fn session_ttl(&self) -> Option<Duration> {
        self.identity.session_ttl
    }
}
