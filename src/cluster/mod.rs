//! Cluster coordination
//!
//! Node membership and session → node affinity behind one `Coordinator`
//! contract, with a process-local adapter and a Redis adapter selected by
//! configuration. Records are best-effort: heartbeat failures log and retry
//! on the next tick, and nothing here is transactional.

mod memory;
mod redis;

pub use memory::MemoryCoordinator;
pub use redis::RedisCoordinator;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, CoordinatorConfig, CoordinatorKind};
use crate::model::{ClusterNodeState, ClusterSessionRecord, ServerStatusEntry};
use crate::{HubError, Result};

/// Node membership + sticky-session store
#[async_trait::async_trait]
pub trait Coordinator: Send + Sync {
    /// Upsert the local node and start heart-beating
    async fn initialize(&self) -> Result<()>;

    /// Stop heart-beating and release adapter resources
    async fn shutdown(&self) -> Result<()>;

    /// Publish the local upstream statuses with the membership record
    async fn register_local_servers(&self, servers: Vec<ServerStatusEntry>) -> Result<()>;

    /// Bind a session to this node (best effort, optional TTL)
    async fn record_session(
        &self,
        record: &ClusterSessionRecord,
        ttl: Option<Duration>,
    ) -> Result<()>;

    async fn get_session(&self, session_id: &str) -> Result<Option<ClusterSessionRecord>>;

    async fn clear_session(&self, session_id: &str) -> Result<()>;

    /// Nodes whose heartbeat is fresh enough
    async fn get_active_nodes(&self) -> Result<Vec<ClusterNodeState>>;

    async fn get_node(&self, node_id: &str) -> Result<Option<ClusterNodeState>>;

    async fn get_node_base_url(&self, node_id: &str) -> Result<Option<String>> {
        Ok(self.get_node(node_id).await?.map(|n| n.base_url))
    }

    fn node_id(&self) -> &str;

    fn session_ttl(&self) -> Option<Duration>;
}

/// Identity of the local node, shared by both adapters
#[derive(Debug, Clone)]
pub(crate) struct NodeIdentity {
    pub node_id: String,
    pub base_url: String,
    pub offline_after_ms: i64,
    pub heartbeat_interval: Duration,
    pub session_ttl: Option<Duration>,
}

impl NodeIdentity {
    fn from_config(settings: &CoordinatorConfig, fallback_base_url: &str) -> Self {
        Self {
            node_id: settings
                .node_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| fallback_base_url.to_string()),
            offline_after_ms: settings.offline_after_ms,
            heartbeat_interval: Duration::from_secs(
                settings.heartbeat_interval.max(1),
            ),
            session_ttl: settings.session_ttl_seconds.map(Duration::from_secs),
        }
    }

    pub(crate) fn fresh_state(&self, servers: Vec<ServerStatusEntry>) -> ClusterNodeState {
        ClusterNodeState {
            node_id: self.node_id.clone(),
            base_url: self.base_url.clone(),
            servers,
            last_heartbeat: Utc::now().timestamp_millis(),
            metadata: serde_json::Value::Null,
        }
    }
}

pub(crate) fn node_is_active(node: &ClusterNodeState, offline_after_ms: i64) -> bool {
    Utc::now().timestamp_millis() - node.last_heartbeat <= offline_after_ms
}

/// Build the configured coordinator. Returns None when clustering is off.
pub fn coordinator_from_config(config: &Config) -> Result<Option<Arc<dyn Coordinator>>> {
    let Some(settings) = &config.coordinator else {
        return Ok(None);
    };

    let identity = NodeIdentity::from_config(settings, &config.public_base_url());

    let coordinator: Arc<dyn Coordinator> = match settings.kind {
        CoordinatorKind::Memory => Arc::new(MemoryCoordinator::new(identity)),
        CoordinatorKind::Redis => {
            let url = settings
                .redis_url
                .clone()
                .ok_or_else(|| HubError::config("coordinator.redisUrl is required"))?;
            Arc::new(RedisCoordinator::new(identity, url, settings.prefix.clone()))
        }
    };

    Ok(Some(coordinator))
}

/// Refresh the local heartbeat until the token is cancelled. Failures are
/// logged and the next tick retries.
pub(crate) fn spawn_heartbeat<F, Fut>(
    interval: Duration,
    cancel: CancellationToken,
    beat: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = beat().await {
                        tracing::warn!("cluster heartbeat failed: {}", e);
                    }
                }
            }
        }
    })
}

/// Build a session record bound to the given node
pub fn session_record(
    node_id: &str,
    session_id: &str,
    group: Option<String>,
    user: Option<String>,
) -> ClusterSessionRecord {
    let now = Utc::now();
    ClusterSessionRecord {
        session_id: session_id.to_string(),
        node_id: node_id.to_string(),
        group,
        user,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
pub(crate) fn test_identity(node_id: &str) -> NodeIdentity {
    NodeIdentity {
        node_id: node_id.to_string(),
        base_url: format!("http://{}.cluster.test:3000", node_id),
        offline_after_ms: crate::constants::DEFAULT_OFFLINE_AFTER_MS,
        heartbeat_interval: Duration::from_secs(10),
        session_ttl: None,
    }
}
