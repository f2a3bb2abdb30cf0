//! Core data model
//!
//! Upstream descriptors, routing groups, per-upstream OAuth state, and the
//! cluster records exchanged between nodes. All wire-facing structs use
//! camelCase field names.

use std::collections::HashMap;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// UPSTREAMS
// ============================================================================

/// Wire protocol spoken by an upstream server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpstreamKind {
    #[serde(rename = "stdio")]
    Stdio,
    #[serde(rename = "sse")]
    Sse,
    #[serde(rename = "streamable-http", alias = "streamableHttp", alias = "http")]
    StreamableHttp,
    #[serde(rename = "openapi")]
    OpenApi,
}

/// Whether the hub keeps a long-lived connection or dials per call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionMode {
    #[default]
    #[serde(rename = "persistent")]
    Persistent,
    #[serde(rename = "on-demand", alias = "onDemand")]
    OnDemand,
}

/// Per-request behavior for upstream calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamOptions {
    /// Per-request timeout in milliseconds
    #[serde(default = "default_call_timeout")]
    pub timeout: u64,

    /// Restart the timeout clock whenever the upstream reports progress
    #[serde(default)]
    pub reset_timeout_on_progress: bool,

    /// Hard ceiling in milliseconds, regardless of progress
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total_timeout: Option<u64>,
}

fn default_call_timeout() -> u64 {
    crate::constants::DEFAULT_CALL_TIMEOUT_MS
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        Self {
            timeout: default_call_timeout(),
            reset_timeout_on_progress: false,
            max_total_timeout: None,
        }
    }
}

/// Per-tool (or per-prompt) visibility override
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOverride {
    /// Setting this to false removes the tool from the published catalog
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Replaces the upstream-provided description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description_override: Option<String>,
}

impl ToolOverride {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// OAuth configuration block on an upstream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamOAuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    /// Candidate redirect URIs; the first one is the fallback callback
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uris: Option<Vec<String>>,

    /// Base URL the canonical `/oauth/callback` is derived from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Register a client dynamically (RFC 7591) when no clientId is configured
    #[serde(default)]
    pub dynamic_registration: bool,

    /// Extra client metadata merged into the registration request;
    /// a `scope` entry here wins the scope-selection priority
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Immutable-per-version descriptor of one upstream server.
///
/// The unique name is the key of the `mcpServers` map in the configuration;
/// the registry stamps it into the struct after load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// Stamped from the config map key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Transport kind; inferred from the other fields when omitted
    #[serde(rename = "type", alias = "kind", skip_serializing_if = "Option::is_none")]
    pub kind: Option<UpstreamKind>,

    /// Endpoint URL (sse, streamable-http) or document URL (openapi)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Extra request headers; values undergo env expansion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,

    /// Command to execute (stdio)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,

    /// Inline OpenAPI document (openapi kind); fetched from `url` when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Owning user; owner-scoped upstreams are visible only on that
    /// user's routes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Keep-alive ping interval in seconds (SSE transports)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive_interval: Option<u64>,

    #[serde(default)]
    pub options: UpstreamOptions,

    /// Per-tool visibility map
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tools: HashMap<String, ToolOverride>,

    /// Per-prompt visibility map
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub prompts: HashMap<String, ToolOverride>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<UpstreamOAuthConfig>,

    #[serde(default)]
    pub connection_mode: ConnectionMode,

    /// Downstream request headers forwarded verbatim on OpenAPI calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passthrough_headers: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

impl UpstreamConfig {
    /// Effective transport kind: the explicit field, else inferred from the
    /// connection parameters
    pub fn kind(&self) -> UpstreamKind {
        if let Some(kind) = self.kind {
            return kind;
        }
        if self.command.is_some() {
            UpstreamKind::Stdio
        } else if self.schema.is_some() {
            UpstreamKind::OpenApi
        } else {
            UpstreamKind::StreamableHttp
        }
    }

    pub fn is_on_demand(&self) -> bool {
        self.connection_mode == ConnectionMode::OnDemand
    }

    /// Validate the connection parameters for the effective kind
    pub fn validate(&self) -> crate::Result<()> {
        match self.kind() {
            UpstreamKind::Stdio => {
                if self.command.as_deref().unwrap_or("").is_empty() {
                    return Err(crate::HubError::config(format!(
                        "upstream '{}': stdio requires a command",
                        self.name
                    )));
                }
            }
            UpstreamKind::Sse | UpstreamKind::StreamableHttp => {
                if self.url.as_deref().unwrap_or("").is_empty() {
                    return Err(crate::HubError::config(format!(
                        "upstream '{}': {:?} requires a url",
                        self.name,
                        self.kind()
                    )));
                }
            }
            UpstreamKind::OpenApi => {
                if self.schema.is_none() && self.url.as_deref().unwrap_or("").is_empty() {
                    return Err(crate::HubError::config(format!(
                        "upstream '{}': openapi requires a schema or a url",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Runtime status of an upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamStatus {
    Disconnected,
    Connecting,
    Connected,
    OauthRequired,
}

impl std::fmt::Display for UpstreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpstreamStatus::Disconnected => "disconnected",
            UpstreamStatus::Connecting => "connecting",
            UpstreamStatus::Connected => "connected",
            UpstreamStatus::OauthRequired => "oauth_required",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// GROUPS
// ============================================================================

/// Which tools of a group member are exposed
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ToolSelection {
    #[default]
    All,
    Named(Vec<String>),
}

impl Serialize for ToolSelection {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            ToolSelection::All => serializer.serialize_str("all"),
            ToolSelection::Named(names) => names.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ToolSelection {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) if s == "all" => Ok(ToolSelection::All),
            Value::String(s) => Err(Error::custom(format!(
                "invalid tools selection '{}': expected \"all\" or a list of tool names",
                s
            ))),
            Value::Array(items) => {
                let names = items
                    .into_iter()
                    .map(|v| {
                        v.as_str().map(str::to_string).ok_or_else(|| {
                            Error::custom("tool names in a group member must be strings")
                        })
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(ToolSelection::Named(names))
            }
            _ => Err(Error::custom(
                "tools selection must be \"all\" or a list of tool names",
            )),
        }
    }
}

impl ToolSelection {
    pub fn allows(&self, tool: &str) -> bool {
        match self {
            ToolSelection::All => true,
            ToolSelection::Named(names) => names.iter().any(|n| n == tool),
        }
    }
}

/// One membership entry inside a group: either a bare upstream name
/// (implicitly "all tools") or `{name, tools}`
#[derive(Debug, Clone, Serialize)]
pub struct GroupMember {
    pub name: String,
    #[serde(default)]
    pub tools: ToolSelection,
}

impl<'de> Deserialize<'de> for GroupMember {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        #[derive(Deserialize)]
        struct Full {
            name: String,
            #[serde(default)]
            tools: ToolSelection,
        }

        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(name) => Ok(GroupMember {
                name,
                tools: ToolSelection::All,
            }),
            Value::Object(_) => {
                let full: Full = serde_json::from_value(value)
                    .map_err(|e| Error::custom(format!("invalid group member: {}", e)))?;
                Ok(GroupMember {
                    name: full.name,
                    tools: full.tools,
                })
            }
            _ => Err(Error::custom(
                "group member must be an upstream name or {name, tools}",
            )),
        }
    }
}

/// A named subset of upstreams used as a routing/visibility scope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub servers: Vec<GroupMember>,
}

impl GroupConfig {
    pub fn member(&self, upstream: &str) -> Option<&GroupMember> {
        self.servers.iter().find(|m| m.name == upstream)
    }
}

// ============================================================================
// OAUTH STATE
// ============================================================================

/// An authorization attempt waiting for its code to come back through the
/// administrative surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAuthorization {
    pub authorization_url: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
}

/// Dynamic-registration bookkeeping
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicRegistration {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Persisted OAuth state for one upstream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Unix seconds; a cached client is reused until this passes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Unix seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_authorization: Option<PendingAuthorization>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_registration: Option<DynamicRegistration>,
}

// ============================================================================
// CLUSTER
// ============================================================================

/// Per-upstream status published with the node heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusEntry {
    pub name: String,
    pub status: UpstreamStatus,
}

/// A node's self-published membership record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNodeState {
    pub node_id: String,
    pub base_url: String,
    #[serde(default)]
    pub servers: Vec<ServerStatusEntry>,
    /// Milliseconds since the Unix epoch
    pub last_heartbeat: i64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Best-effort session → node binding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSessionRecord {
    pub session_id: String,
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// PER-CALL CONTEXT
// ============================================================================

/// Explicit per-call context threaded from the HTTP layer down through
/// dispatch. Replaces the module-scope "current request" holder of the
/// original design; one node can serve many sessions concurrently without
/// them trampling each other's headers.
#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    /// Routing scope; "" is the global route
    pub group: String,
    /// Authenticated path user, when the session is user-scoped
    pub user: Option<String>,
    /// Downstream request headers, consumed by OpenAPI passthrough
    pub headers: HeaderMap,
}

impl RequestScope {
    pub fn new(group: impl Into<String>, user: Option<String>) -> Self {
        Self {
            group: group.into(),
            user,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_member_accepts_bare_names_and_objects() {
        let g: GroupConfig = serde_json::from_value(serde_json::json!({
            "name": "ops",
            "servers": ["time", {"name": "files", "tools": ["read", "write"]}, {"name": "web", "tools": "all"}]
        }))
        .unwrap();

        assert_eq!(g.servers.len(), 3);
        assert_eq!(g.servers[0].name, "time");
        assert_eq!(g.servers[0].tools, ToolSelection::All);
        assert!(g.servers[1].tools.allows("read"));
        assert!(!g.servers[1].tools.allows("delete"));
        assert!(g.servers[2].tools.allows("anything"));
    }

    #[test]
    fn upstream_kind_inference() {
        let stdio: UpstreamConfig = serde_json::from_value(serde_json::json!({
            "command": "npx",
            "args": ["-y", "@modelcontextprotocol/server-time"]
        }))
        .unwrap();
        assert_eq!(stdio.kind(), UpstreamKind::Stdio);

        let http: UpstreamConfig = serde_json::from_value(serde_json::json!({
            "url": "https://mcp.example.com/mcp"
        }))
        .unwrap();
        assert_eq!(http.kind(), UpstreamKind::StreamableHttp);

        let sse: UpstreamConfig = serde_json::from_value(serde_json::json!({
            "type": "sse",
            "url": "https://mcp.example.com/sse"
        }))
        .unwrap();
        assert_eq!(sse.kind(), UpstreamKind::Sse);
    }

    #[test]
    fn openapi_without_url_or_schema_is_a_config_error() {
        let mut cfg = UpstreamConfig {
            name: "petstore".into(),
            kind: Some(UpstreamKind::OpenApi),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        cfg.schema = Some(serde_json::json!({"openapi": "3.0.0", "paths": {}}));
        assert!(cfg.validate().is_ok());
    }
}
