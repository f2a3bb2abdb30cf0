//! Downstream session table
//!
//! One entry per connected MCP client, bound to its routing scope at creation
//! and owned by this node for its lifetime. SSE sessions carry an outbound
//! channel the response stream drains; streamable-HTTP sessions get one when
//! the client opens its GET stream. Session affinity is mirrored into the
//! cluster coordinator, best effort.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cluster::{Coordinator, session_record};
use crate::protocol::notification;
use crate::upstream::ToolChangeListener;
use crate::constants;

/// One downstream client's logical connection
pub struct DownstreamSession {
    pub id: String,
    pub group: String,
    pub user: Option<String>,
    pub created_at: DateTime<Utc>,
    outbound: Mutex<Option<mpsc::Sender<Value>>>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
}

impl DownstreamSession {
    /// Queue a frame for the client's event stream. False when the session
    /// has no open stream or the client stopped reading.
    pub fn push(&self, frame: Value) -> bool {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.try_send(frame).is_ok(),
            None => false,
        }
    }

    fn attach(&self, tx: mpsc::Sender<Value>) {
        *self.outbound.lock() = Some(tx);
    }

    fn teardown(&self) {
        *self.outbound.lock() = None;
        if let Some(task) = self.ping_task.lock().take() {
            task.abort();
        }
    }
}

/// Process-wide session map
pub struct SessionTable {
    sessions: DashMap<String, Arc<DownstreamSession>>,
    coordinator: Option<Arc<dyn Coordinator>>,
}

impl SessionTable {
    pub fn new(coordinator: Option<Arc<dyn Coordinator>>) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            coordinator,
        })
    }

    async fn record(&self, session: &DownstreamSession) {
        if let Some(coordinator) = &self.coordinator {
            let record = session_record(
                coordinator.node_id(),
                &session.id,
                (!session.group.is_empty()).then(|| session.group.clone()),
                session.user.clone(),
            );
            if let Err(e) = coordinator
                .record_session(&record, coordinator.session_ttl())
                .await
            {
                tracing::warn!(session = %session.id, "failed to record session binding: {}", e);
            }
        }
    }

    /// Create a streamable-HTTP session (no stream until the client GETs)
    pub async fn create(&self, group: &str, user: Option<String>) -> Arc<DownstreamSession> {
        let session = Arc::new(DownstreamSession {
            id: uuid::Uuid::new_v4().to_string(),
            group: group.to_string(),
            user,
            created_at: Utc::now(),
            outbound: Mutex::new(None),
            ping_task: Mutex::new(None),
        });
        self.record(&session).await;
        self.sessions.insert(session.id.clone(), session.clone());
        session
    }

    /// Create an SSE session: outbound channel attached immediately, plus a
    /// keep-alive ping that cancels itself on the first failed send.
    pub async fn create_sse(
        &self,
        group: &str,
        user: Option<String>,
    ) -> (Arc<DownstreamSession>, mpsc::Receiver<Value>) {
        let session = self.create(group, user).await;
        let rx = self.open_stream(&session);

        let ping_target = session.clone();
        let ping = tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(constants::SESSION_PING_SECS);
            loop {
                tokio::time::sleep(interval).await;
                if !ping_target.push(notification("ping", None)) {
                    break;
                }
            }
        });
        *session.ping_task.lock() = Some(ping);

        (session, rx)
    }

    /// Attach (or replace) the outbound stream of an existing session
    pub fn open_stream(&self, session: &Arc<DownstreamSession>) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(64);
        session.attach(tx);
        rx
    }

    pub fn get(&self, id: &str) -> Option<Arc<DownstreamSession>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop a session and clear its cluster binding
    pub async fn remove(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            session.teardown();
            tracing::debug!(session = %id, "session closed");
        }
        if let Some(coordinator) = &self.coordinator {
            if let Err(e) = coordinator.clear_session(id).await {
                tracing::debug!(session = %id, "failed to clear session binding: {}", e);
            }
        }
    }

    /// Best-effort fan-out to every session with an open stream; individual
    /// failures are logged and do not abort the loop
    pub fn broadcast(&self, frame: Value) {
        for entry in self.sessions.iter() {
            if !entry.value().push(frame.clone()) {
                tracing::debug!(session = %entry.key(), "skipping notification, no open stream");
            }
        }
    }

    /// Close everything (process shutdown)
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.remove(&id).await;
        }
    }
}

impl ToolChangeListener for SessionTable {
    fn on_tool_list_changed(&self) {
        self.broadcast(notification("notifications/tools/list_changed", None));
    }
}
