//! Upstream registry
//!
//! Owns the runtime record of every configured upstream: status machine,
//! transport handle, published tool/prompt catalog, keep-alive timer, and the
//! per-upstream OAuth provider. All catalog names are prefixed with
//! `{upstream}{separator}` on publication, which makes them globally unique
//! by construction.

pub(crate) mod openapi;
pub(crate) mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rmcp::model::{Prompt, Tool};
use serde::Serialize;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::config::{Config, DataConfig};
use crate::dispatch::smart::{IndexedTool, ToolSearch};
use crate::model::{
    PendingAuthorization, ServerStatusEntry, UpstreamConfig, UpstreamKind, UpstreamOptions,
    UpstreamStatus,
};
use crate::oauth::{CredentialScope, OAuthStateSink, UpstreamOAuth};
use crate::storage::SettingsRepository;
use crate::{HubError, Result, constants};

use transport::{ConnectContext, UpstreamTransport};

/// Downstream fan-out hook for `tools/list_changed`. Implemented by the
/// session table; kept as a trait so the registry never depends on the HTTP
/// layer.
pub trait ToolChangeListener: Send + Sync {
    fn on_tool_list_changed(&self);
}

/// Read-model of one upstream, what the admin surface and /health report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamInfo {
    pub name: String,
    pub status: UpstreamStatus,
    pub enabled: bool,
    pub tool_count: usize,
    pub prompt_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<PendingAuthorization>,
}

/// What the dispatcher works from: a consistent clone of the published state
#[derive(Clone)]
pub(crate) struct UpstreamSnapshot {
    pub name: String,
    pub enabled: bool,
    pub status: UpstreamStatus,
    pub on_demand: bool,
    pub kind: UpstreamKind,
    pub owner: Option<String>,
    pub tools: Vec<Tool>,
    pub prompts: Vec<Prompt>,
    pub options: UpstreamOptions,
}

impl UpstreamSnapshot {
    /// Reachable for dispatch: live, or connectable just-in-time
    pub fn callable(&self) -> bool {
        self.enabled && (self.status == UpstreamStatus::Connected || self.on_demand)
    }
}

struct UpstreamEntry {
    config: UpstreamConfig,
    status: UpstreamStatus,
    tools: Vec<Tool>,
    prompts: Vec<Prompt>,
    last_error: Option<String>,
    transport: Option<Arc<UpstreamTransport>>,
    keepalive: Option<JoinHandle<()>>,
    oauth: Option<Arc<UpstreamOAuth>>,
    pending: Option<PendingAuthorization>,
    catalog_loaded: bool,
}

impl UpstreamEntry {
    fn new(config: UpstreamConfig) -> Self {
        Self {
            config,
            status: UpstreamStatus::Disconnected,
            tools: Vec::new(),
            prompts: Vec::new(),
            last_error: None,
            transport: None,
            keepalive: None,
            oauth: None,
            pending: None,
            catalog_loaded: false,
        }
    }
}

/// Process-wide owner of upstream runtime records
pub struct UpstreamRegistry {
    entries: RwLock<HashMap<String, UpstreamEntry>>,
    separator: String,
    data: DataConfig,
    init_timeout: Duration,
    settings: Arc<dyn SettingsRepository>,
    search: Arc<dyn ToolSearch>,
    listener: RwLock<Option<Arc<dyn ToolChangeListener>>>,
    events_tx: UnboundedSender<String>,
}

impl UpstreamRegistry {
    /// Build the registry from configuration and start the tool-change event
    /// loop. Upstreams are registered but not yet connected; call
    /// `register_all(None)` to dial them.
    pub fn new(
        config: &Config,
        settings: Arc<dyn SettingsRepository>,
        search: Arc<dyn ToolSearch>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();

        let mut entries = HashMap::new();
        for (name, upstream) in &config.mcp_servers {
            let mut upstream = upstream.clone();
            upstream.name = name.clone();
            entries.insert(name.clone(), UpstreamEntry::new(upstream));
        }

        let registry = Arc::new(Self {
            entries: RwLock::new(entries),
            separator: config.name_separator.clone(),
            data: config.data.clone(),
            init_timeout: Duration::from_millis(config.init_timeout),
            settings,
            search,
            listener: RwLock::new(None),
            events_tx,
        });

        registry.clone().spawn_event_loop(events_rx);
        registry
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Downstream notification hook; set once by the HTTP layer
    pub fn set_listener(&self, listener: Arc<dyn ToolChangeListener>) {
        *self.listener.write() = Some(listener);
    }

    fn notify_tool_changed(&self) {
        if let Some(listener) = self.listener.read().clone() {
            listener.on_tool_list_changed();
        }
    }

    /// Initialize one or all upstreams. Idempotent: without a name, already
    /// connected upstreams are left untouched; with a name, that upstream is
    /// torn down and redialed even when connected.
    pub async fn register_all(&self, server: Option<&str>) -> Result<()> {
        let names: Vec<String> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|(name, entry)| match server {
                    Some(target) => name.as_str() == target,
                    None => entry.status != UpstreamStatus::Connected,
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        if let Some(target) = server
            && names.is_empty()
        {
            return Err(HubError::not_found("upstream", target));
        }

        for name in names {
            if server.is_some() {
                self.teardown(&name).await;
            }
            if let Err(e) = self.connect_one(&name).await {
                tracing::warn!(server = %name, "failed to initialize upstream: {}", e);
            }
        }

        self.notify_tool_changed();
        Ok(())
    }

    /// Dial one upstream per the configured kind and publish its catalog
    async fn connect_one(&self, name: &str) -> Result<()> {
        let config = {
            let mut entries = self.entries.write();
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| HubError::not_found("upstream", name))?;

            if !entry.config.enabled {
                entry.status = UpstreamStatus::Disconnected;
                entry.last_error = None;
                tracing::debug!(server = %name, "upstream disabled, skipping");
                return Ok(());
            }

            entry.status = UpstreamStatus::Connecting;
            entry.last_error = None;
            entry.pending = None;
            entry.config.clone()
        };

        let oauth = self.oauth_provider(&config).await?;

        let connect_result = transport::connect(ConnectContext {
            config: &config,
            data: &self.data,
            oauth: oauth.as_ref(),
            init_timeout: self.init_timeout,
            events: Some(self.events_tx.clone()),
        })
        .await;

        let transport = match connect_result {
            Ok(transport) => transport,
            Err(e) => {
                return self.record_connect_failure(name, &config, oauth.as_ref(), e).await;
            }
        };

        // query both catalogs in parallel, per-upstream options applied
        let (tools_result, prompts_result) = tokio::join!(
            transport.list_tools(&config.options),
            transport.list_prompts(&config.options)
        );

        let raw_tools = match tools_result {
            Ok(tools) => tools,
            Err(e) => {
                let _ = transport.close().await;
                return self.record_connect_failure(name, &config, oauth.as_ref(), e).await;
            }
        };
        // prompts are optional on most servers; a refusal is not a failure
        let raw_prompts = match prompts_result {
            Ok(prompts) => prompts,
            Err(e) => {
                tracing::debug!(server = %name, "upstream does not serve prompts: {}", e);
                Vec::new()
            }
        };

        let tools = publish_tools(&config, &self.separator, raw_tools);
        let prompts = publish_prompts(&config, &self.separator, raw_prompts);
        self.search
            .index(name, &indexed_tools(&config, &self.separator, &tools))
            .await;

        if config.is_on_demand() {
            // the catalog is the persistent artifact; the connection is not
            let _ = transport.close().await;
            let mut entries = self.entries.write();
            if let Some(entry) = entries.get_mut(name) {
                entry.status = UpstreamStatus::Disconnected;
                entry.tools = tools;
                entry.prompts = prompts;
                entry.catalog_loaded = true;
                entry.last_error = None;
            }
            tracing::info!(server = %name, "on-demand upstream cataloged");
            return Ok(());
        }

        let transport = Arc::new(transport);
        let keepalive = (config.kind() == UpstreamKind::Sse).then(|| {
            let interval = Duration::from_secs(
                config
                    .keep_alive_interval
                    .unwrap_or(constants::DEFAULT_KEEP_ALIVE_SECS),
            );
            self.spawn_keepalive(name, transport.clone(), interval)
        });

        {
            let mut entries = self.entries.write();
            if let Some(entry) = entries.get_mut(name) {
                if let Some(old) = entry.keepalive.take() {
                    old.abort();
                }
                entry.status = UpstreamStatus::Connected;
                entry.transport = Some(transport);
                entry.keepalive = keepalive;
                entry.tools = tools;
                entry.prompts = prompts;
                entry.catalog_loaded = true;
                entry.last_error = None;
                tracing::info!(
                    server = %name,
                    tools = entry.tools.len(),
                    prompts = entry.prompts.len(),
                    "upstream connected"
                );
            }
        }

        Ok(())
    }

    /// Classify a connect failure: authorization errors park the upstream in
    /// oauth_required with a pending authorization, everything else records
    /// disconnected with the error text.
    async fn record_connect_failure(
        &self,
        name: &str,
        config: &UpstreamConfig,
        oauth: Option<&Arc<UpstreamOAuth>>,
        error: HubError,
    ) -> Result<()> {
        if let Some(oauth) = oauth
            && matches!(config.kind(), UpstreamKind::Sse | UpstreamKind::StreamableHttp)
        {
            let challenge = match config.url.as_deref() {
                Some(url) => transport::probe_challenge(url).await.unwrap_or(None),
                None => None,
            };
            let needs_auth = challenge.is_some() || oauth.tokens().is_none();
            if needs_auth {
                if let Err(e) = oauth.prepare_endpoints(challenge.as_deref()).await {
                    tracing::warn!(server = %name, "oauth discovery failed: {}", e);
                } else {
                    let auth_error = oauth.begin_authorization(self.as_sink()).await;
                    if matches!(auth_error, HubError::AuthorizationRequired { .. }) {
                        return Err(auth_error);
                    }
                    tracing::warn!(server = %name, "failed to start authorization: {}", auth_error);
                }
            }
        }

        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(name) {
            entry.status = UpstreamStatus::Disconnected;
            entry.last_error = Some(error.to_string());
        }
        tracing::warn!(server = %name, "upstream connect failed: {}", error);
        Err(error)
    }

    fn as_sink(&self) -> &dyn OAuthStateSink {
        self
    }

    async fn oauth_provider(&self, config: &UpstreamConfig) -> Result<Option<Arc<UpstreamOAuth>>> {
        let Some(oauth_config) = &config.oauth else {
            return Ok(None);
        };
        if let Some(existing) = self.entries.read().get(&config.name).and_then(|e| e.oauth.clone())
        {
            return Ok(Some(existing));
        }
        let provider = Arc::new(
            UpstreamOAuth::load(&config.name, oauth_config.clone(), self.settings.clone()).await?,
        );
        if let Some(entry) = self.entries.write().get_mut(&config.name) {
            entry.oauth = Some(provider.clone());
        }
        Ok(Some(provider))
    }

    fn spawn_keepalive(
        &self,
        name: &str,
        transport: Arc<UpstreamTransport>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let server = name.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = transport.ping().await {
                    // logged, never fatal; reconnection is an operator action
                    tracing::warn!(server = %server, "keep-alive ping failed: {}", e);
                }
            }
        })
    }

    fn spawn_event_loop(self: Arc<Self>, mut events_rx: UnboundedReceiver<String>) {
        tokio::spawn(async move {
            while let Some(server) = events_rx.recv().await {
                tracing::debug!(server = %server, "upstream reported tool list change");
                if let Err(e) = self.refresh_catalog(&server).await {
                    tracing::warn!(server = %server, "failed to refresh catalog: {}", e);
                }
                self.notify_tool_changed();
            }
        });
    }

    /// Re-list one connected upstream's tools and republish
    async fn refresh_catalog(&self, name: &str) -> Result<()> {
        let (transport, config) = {
            let entries = self.entries.read();
            let entry = entries
                .get(name)
                .ok_or_else(|| HubError::not_found("upstream", name))?;
            match &entry.transport {
                Some(transport) => (transport.clone(), entry.config.clone()),
                None => return Ok(()),
            }
        };

        let raw_tools = transport.list_tools(&config.options).await?;
        let tools = publish_tools(&config, &self.separator, raw_tools);
        self.search
            .index(name, &indexed_tools(&config, &self.separator, &tools))
            .await;

        if let Some(entry) = self.entries.write().get_mut(name) {
            entry.tools = tools;
        }
        Ok(())
    }

    async fn teardown(&self, name: &str) {
        let (transport, keepalive) = {
            let mut entries = self.entries.write();
            match entries.get_mut(name) {
                Some(entry) => {
                    entry.status = UpstreamStatus::Disconnected;
                    (entry.transport.take(), entry.keepalive.take())
                }
                None => (None, None),
            }
        };
        if let Some(keepalive) = keepalive {
            keepalive.abort();
        }
        if let Some(transport) = transport
            && let Err(e) = transport.close().await
        {
            tracing::debug!(server = %name, "transport close: {}", e);
        }
    }

    /// Close and redial one upstream, refreshing its catalog. Used by the
    /// dispatcher's bounded retry path.
    pub async fn restart(&self, name: &str) -> Result<()> {
        tracing::info!(server = %name, "rebuilding upstream transport");
        self.teardown(name).await;
        self.connect_one(name).await
    }

    /// Remove an upstream entirely
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.teardown(name).await;
        let removed = self.entries.write().remove(name);
        if removed.is_none() {
            return Err(HubError::not_found("upstream", name));
        }
        self.search.remove(name).await;
        self.notify_tool_changed();
        Ok(())
    }

    /// Deliver an authorization code for an upstream in oauth_required and
    /// bring it back online
    pub async fn complete_authorization(&self, name: &str, code: &str) -> Result<()> {
        let oauth = self
            .entries
            .read()
            .get(name)
            .and_then(|e| e.oauth.clone())
            .ok_or_else(|| HubError::oauth(format!("upstream '{}' has no OAuth provider", name)))?;
        oauth.complete_authorization(code).await?;
        self.register_all(Some(name)).await
    }

    /// Drop a credential subset; flips the upstream back to oauth_required
    /// when tokens or client were cleared
    pub async fn invalidate_oauth(&self, name: &str, scope: CredentialScope) -> Result<()> {
        let oauth = self
            .entries
            .read()
            .get(name)
            .and_then(|e| e.oauth.clone())
            .ok_or_else(|| HubError::oauth(format!("upstream '{}' has no OAuth provider", name)))?;
        let needs_reauth = oauth.invalidate_credentials(scope).await?;
        if needs_reauth
            && let Some(entry) = self.entries.write().get_mut(name)
        {
            entry.status = UpstreamStatus::OauthRequired;
        }
        Ok(())
    }

    pub(crate) fn transport(&self, name: &str) -> Option<Arc<UpstreamTransport>> {
        self.entries.read().get(name).and_then(|e| e.transport.clone())
    }

    /// Dial an on-demand upstream for the duration of one call; the caller
    /// must close it, success or failure
    pub(crate) async fn jit_connect(&self, name: &str) -> Result<UpstreamTransport> {
        let config = self
            .entries
            .read()
            .get(name)
            .map(|e| e.config.clone())
            .ok_or_else(|| HubError::not_found("upstream", name))?;
        let oauth = self.oauth_provider(&config).await?;

        transport::connect(ConnectContext {
            config: &config,
            data: &self.data,
            oauth: oauth.as_ref(),
            init_timeout: self.init_timeout,
            events: None,
        })
        .await
    }

    /// Catalog snapshots for dispatch, enabled upstreams first
    pub(crate) fn snapshots(&self) -> Vec<UpstreamSnapshot> {
        let entries = self.entries.read();
        let mut snapshots: Vec<UpstreamSnapshot> = entries
            .values()
            .map(|entry| UpstreamSnapshot {
                name: entry.config.name.clone(),
                enabled: entry.config.enabled,
                status: entry.status,
                on_demand: entry.config.is_on_demand(),
                kind: entry.config.kind(),
                owner: entry.config.owner.clone(),
                tools: entry.tools.clone(),
                prompts: entry.prompts.clone(),
                options: entry.config.options.clone(),
            })
            .collect();
        snapshots.sort_by(|a, b| b.enabled.cmp(&a.enabled).then(a.name.cmp(&b.name)));
        snapshots
    }

    /// Operator-facing state dump
    pub fn infos(&self) -> Vec<UpstreamInfo> {
        let entries = self.entries.read();
        let mut infos: Vec<UpstreamInfo> = entries
            .values()
            .map(|entry| UpstreamInfo {
                name: entry.config.name.clone(),
                status: entry.status,
                enabled: entry.config.enabled,
                tool_count: entry.tools.len(),
                prompt_count: entry.prompts.len(),
                last_error: entry.last_error.clone(),
                oauth: entry.pending.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Health predicate: every enabled upstream is connected (on-demand ones
    /// count once their catalog is loaded)
    pub fn healthy(&self) -> bool {
        self.entries.read().values().all(|entry| {
            if !entry.config.enabled {
                return true;
            }
            if entry.config.is_on_demand() {
                return entry.catalog_loaded && entry.last_error.is_none();
            }
            entry.status == UpstreamStatus::Connected
        })
    }

    /// Per-upstream status entries published with the cluster heartbeat
    pub fn status_entries(&self) -> Vec<ServerStatusEntry> {
        self.entries
            .read()
            .values()
            .map(|entry| ServerStatusEntry {
                name: entry.config.name.clone(),
                status: entry.status,
            })
            .collect()
    }

    /// Close every transport and cancel every timer
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.entries.read().keys().cloned().collect();
        for name in names {
            self.teardown(&name).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_test_upstream(
        &self,
        config: UpstreamConfig,
        status: UpstreamStatus,
        tools: Vec<Tool>,
        prompts: Vec<Prompt>,
    ) {
        let name = config.name.clone();
        let published_tools = publish_tools(&config, &self.separator, tools);
        let published_prompts = publish_prompts(&config, &self.separator, prompts);
        let mut entry = UpstreamEntry::new(config);
        entry.status = status;
        entry.tools = published_tools;
        entry.prompts = published_prompts;
        entry.catalog_loaded = true;
        self.entries.write().insert(name, entry);
    }

    #[cfg(test)]
    pub(crate) fn install_test_transport(&self, name: &str, transport: UpstreamTransport) {
        if let Some(entry) = self.entries.write().get_mut(name) {
            entry.transport = Some(Arc::new(transport));
        }
    }
}

impl OAuthStateSink for UpstreamRegistry {
    fn on_authorization_required(&self, server: &str, pending: &PendingAuthorization) {
        if let Some(entry) = self.entries.write().get_mut(server) {
            entry.status = UpstreamStatus::OauthRequired;
            entry.pending = Some(pending.clone());
        }
        tracing::info!(
            server = %server,
            url = %pending.authorization_url,
            "upstream requires authorization"
        );
    }
}

/// Apply the per-tool visibility map and the name prefix to a raw catalog.
/// Disabled tools never reach the published set; description overrides are
/// baked in here so every read path sees them.
fn publish_tools(config: &UpstreamConfig, separator: &str, raw: Vec<Tool>) -> Vec<Tool> {
    raw.into_iter()
        .filter(|tool| {
            config
                .tools
                .get(tool.name.as_ref())
                .map(|o| o.is_enabled())
                .unwrap_or(true)
        })
        .map(|mut tool| {
            if let Some(replacement) = config
                .tools
                .get(tool.name.as_ref())
                .and_then(|o| o.description_override.clone())
            {
                tool.description = Some(replacement.into());
            }
            tool.name = format!("{}{}{}", config.name, separator, tool.name).into();
            tool.input_schema = sanitize_schema(tool.input_schema);
            tool
        })
        .collect()
}

fn publish_prompts(config: &UpstreamConfig, separator: &str, raw: Vec<Prompt>) -> Vec<Prompt> {
    raw.into_iter()
        .filter(|prompt| {
            config
                .prompts
                .get(prompt.name.as_str())
                .map(|o| o.is_enabled())
                .unwrap_or(true)
        })
        .map(|mut prompt| {
            if let Some(replacement) = config
                .prompts
                .get(prompt.name.as_str())
                .and_then(|o| o.description_override.clone())
            {
                prompt.description = Some(replacement);
            }
            prompt.name = format!("{}{}{}", config.name, separator, prompt.name);
            prompt
        })
        .collect()
}

/// Upstream SDKs love stamping `$schema`; strip it so the unified catalog is
/// uniform
fn sanitize_schema(
    schema: Arc<serde_json::Map<String, serde_json::Value>>,
) -> Arc<serde_json::Map<String, serde_json::Value>> {
    if !schema.contains_key("$schema") {
        return schema;
    }
    let mut cleaned = (*schema).clone();
    cleaned.remove("$schema");
    Arc::new(cleaned)
}

fn indexed_tools(config: &UpstreamConfig, separator: &str, published: &[Tool]) -> Vec<IndexedTool> {
    let prefix = format!("{}{}", config.name, separator);
    published
        .iter()
        .map(|tool| IndexedTool {
            name: tool
                .name
                .strip_prefix(&prefix)
                .unwrap_or(tool.name.as_ref())
                .to_string(),
            description: tool
                .description
                .as_ref()
                .map(|d| d.to_string())
                .unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod registry_test {
    include!("registry_test.rs");
}
