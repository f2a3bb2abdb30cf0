//! Redis-backed coordinator
//!
//! Nodes live in a `{prefix}:nodes` hash keyed by node id; session bindings
//! live at `{prefix}:session:{id}`, with an EX TTL when configured. One
//! connection manager per process, created lazily on first use and shared
//! with the heartbeat task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use super::{Coordinator, NodeIdentity, node_is_active, spawn_heartbeat};
use crate::model::{ClusterNodeState, ClusterSessionRecord, ServerStatusEntry};
use crate::{HubError, Result};

struct RedisInner {
    identity: NodeIdentity,
    url: String,
    prefix: String,
    connection: OnceCell<ConnectionManager>,
    servers: Mutex<Vec<ServerStatusEntry>>,
}

impl RedisInner {
    fn nodes_key(&self) -> String {
        format!("{}:nodes", self.prefix)
    }

    fn session_key(&self, session_id: &str) -> String {
        format!("{}:session:{}", self.prefix, session_id)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let client = redis::Client::open(self.url.as_str())
                    .map_err(|e| HubError::cluster(format!("invalid redis url: {}", e)))?;
                client
                    .get_connection_manager()
                    .await
                    .map_err(|e| HubError::cluster(format!("redis connect failed: {}", e)))
            })
            .await?;
        Ok(manager.clone())
    }

    async fn upsert_self(&self) -> Result<()> {
        let state = self.identity.fresh_state(self.servers.lock().clone());
        let payload = serde_json::to_string(&state)?;
        let mut conn = self.connection().await?;
        let _: () = conn
            .hset(self.nodes_key(), &state.node_id, payload)
            .await
            .map_err(|e| HubError::cluster(format!("node upsert failed: {}", e)))?;
        Ok(())
    }
}

pub struct RedisCoordinator {
    inner: Arc<RedisInner>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl RedisCoordinator {
    pub fn new(identity: NodeIdentity, url: String, prefix: String) -> Self {
        Self {
            inner: Arc::new(RedisInner {
                identity,
                url,
                prefix,
                connection: OnceCell::new(),
                servers: Mutex::new(Vec::new()),
            }),
            cancel: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl Coordinator for RedisCoordinator {
    async fn initialize(&self) -> Result<()> {
        self.inner.upsert_self().await?;

        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        spawn_heartbeat(
            self.inner.identity.heartbeat_interval,
            cancel.clone(),
            move || {
                let inner = inner.clone();
                async move { inner.upsert_self().await }
            },
        );
        *self.cancel.lock() = Some(cancel);

        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        let mut conn = self.inner.connection().await?;
        let _: () = conn
            .hdel(self.inner.nodes_key(), &self.inner.identity.node_id)
            .await
            .map_err(|e| HubError::cluster(format!("node removal failed: {}", e)))?;
        Ok(())
    }

    async fn register_local_servers(&self, servers: Vec<ServerStatusEntry>) -> Result<()> {
        *self.inner.servers.lock() = servers;
        self.inner.upsert_self().await
    }

    async fn record_session(
        &self,
        record: &ClusterSessionRecord,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let key = self.inner.session_key(&record.session_id);
        let mut conn = self.inner.connection().await?;
        let result: std::result::Result<(), redis::RedisError> = match ttl {
            Some(ttl) => conn.set_ex(key, payload, ttl.as_secs()).await,
            None => conn.set(key, payload).await,
        };
        result.map_err(|e| HubError::cluster(format!("session record failed: {}", e)))
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ClusterSessionRecord>> {
        let mut conn = self.inner.connection().await?;
        let payload: Option<String> = conn
            .get(self.inner.session_key(session_id))
            .await
            .map_err(|e| HubError::cluster(format!("session lookup failed: {}", e)))?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn clear_session(&self, session_id: &str) -> Result<()> {
        let mut conn = self.inner.connection().await?;
        let _: () = conn
            .del(self.inner.session_key(session_id))
            .await
            .map_err(|e| HubError::cluster(format!("session clear failed: {}", e)))?;
        Ok(())
    }

    async fn get_active_nodes(&self) -> Result<Vec<ClusterNodeState>> {
        let mut conn = self.inner.connection().await?;
        let entries: HashMap<String, String> = conn
            .hgetall(self.inner.nodes_key())
            .await
            .map_err(|e| HubError::cluster(format!("node listing failed: {}", e)))?;

        let mut nodes = Vec::new();
        for (node_id, payload) in entries {
            match serde_json::from_str::<ClusterNodeState>(&payload) {
                Ok(node) if node_is_active(&node, self.inner.identity.offline_after_ms) => {
                    nodes.push(node)
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(node = %node_id, "unreadable cluster node record: {}", e);
                }
            }
        }
        Ok(nodes)
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<ClusterNodeState>> {
        let mut conn = self.inner.connection().await?;
        let payload: Option<String> = conn
            .hget(self.inner.nodes_key(), node_id)
            .await
            .map_err(|e| HubError::cluster(format!("node lookup failed: {}", e)))?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    fn node_id(&self) -> &str {
        &self.inner.identity.node_id
    }

    fn session_ttl(&self) -> Option<Duration> {
        self.inner.identity.session_ttl
    }
}
