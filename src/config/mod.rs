//! Configuration management
//!
//! Loads the hub configuration from mcphub.config.json (or .yaml), expands
//! environment placeholders in every string field, and validates the result.
//!
//! Two views exist over a loaded config: the raw document, and a per-user
//! filtered projection (`for_user`). Security-relevant checks (the bearer
//! key above all) MUST read the raw view; an unauthenticated caller still has
//! to be measured against the real policy, not a filtered one.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{GroupConfig, UpstreamConfig};
use crate::secrets::SecretsProvider;
use crate::{HubError, Result, constants};

/// Complete hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path prefix all MCP endpoints are mounted under ("" for root)
    #[serde(default)]
    pub base_path: String,

    /// Externally reachable base URL, used in RFC 6750 challenges and as the
    /// OAuth callback base. Defaults to http://{host}:{port}.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,

    /// Character(s) between an upstream name and a tool name in the unified
    /// namespace. Changing this requires reconnecting all upstreams.
    #[serde(default = "default_separator")]
    pub name_separator: String,

    /// Upstream connect + initialize timeout in milliseconds
    #[serde(default = "default_init_timeout")]
    pub init_timeout: u64,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Configured upstream servers, keyed by unique name
    #[serde(default)]
    pub mcp_servers: HashMap<String, UpstreamConfig>,

    /// Routing/visibility groups
    #[serde(default)]
    pub groups: Vec<GroupConfig>,

    /// Cluster coordination; absent means single-node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorConfig>,

    /// Data directories handed to spawned upstream processes
    #[serde(default)]
    pub data: DataConfig,

    /// Logging configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfig>,
}

/// Route-shape policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    /// When false, requests without a group in the path are rejected with 403
    #[serde(default = "default_true")]
    pub enable_global_route: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enable_global_route: true,
        }
    }
}

/// Bearer-key enforcement on the transport endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default)]
    pub enable_bearer_auth: bool,

    #[serde(default)]
    pub bearer_auth_key: String,
}

/// Cluster adapter selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorKind {
    #[default]
    Memory,
    Redis,
}

/// Cluster coordination settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorConfig {
    #[serde(rename = "type", default)]
    pub kind: CoordinatorKind,

    /// Redis connection string (redis kind)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,

    /// Key prefix for nodes and session records
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Heartbeat refresh interval in seconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval: u64,

    /// A node whose heartbeat is older than this many milliseconds is
    /// filtered from the active set
    #[serde(default = "default_offline_after")]
    pub offline_after_ms: i64,

    /// This node's advertised base URL; peers forward sticky sessions here.
    /// Defaults to the public base URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Stable node id; generated per-process when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// TTL applied to session records (seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_ttl_seconds: Option<u64>,
}

fn default_prefix() -> String {
    "mcphub".to_string()
}

fn default_heartbeat() -> u64 {
    constants::DEFAULT_HEARTBEAT_SECS
}

fn default_offline_after() -> i64 {
    constants::DEFAULT_OFFLINE_AFTER_MS
}

/// Data-directory layout and package mirrors for spawned subprocesses
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConfig {
    /// Root directory; env MCPHUB_DATA_ROOT wins, then this, then ~/.mcphub
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,

    /// npm registry mirror for npx-launched upstreams
    #[serde(skip_serializing_if = "Option::is_none")]
    pub npm_registry: Option<String>,

    /// Python package index for uvx-launched upstreams
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python_index_url: Option<String>,
}

impl DataConfig {
    /// Resolve the effective data root
    pub fn data_root(&self) -> String {
        std::env::var(constants::ENV_DATA_ROOT)
            .ok()
            .or_else(|| self.root.clone())
            .unwrap_or_else(|| constants::default_data_root().to_string())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    constants::DEFAULT_HTTP_PORT
}

fn default_separator() -> String {
    constants::DEFAULT_NAME_SEPARATOR.to_string()
}

fn default_init_timeout() -> u64 {
    constants::DEFAULT_INIT_TIMEOUT_MS
}

impl Default for Config {
    fn default() -> Self {
        // serde defaults are the single source of truth
        serde_json::from_value(Value::Object(Default::default())).expect("default config")
    }
}

impl Config {
    /// Load configuration from the default file name in the current directory
    pub async fn load(provider: &Arc<dyn SecretsProvider>) -> Result<Self> {
        Self::load_from_path(constants::CONFIG_FILE_NAME, provider).await
    }

    /// Load configuration from a specific path.
    ///
    /// Supports JSON and YAML by extension. Every string in the document is
    /// env-expanded before deserialization, then process-level env overrides
    /// (MCPHUB_PORT, MCPHUB_BASE_PATH, MCPHUB_INIT_TIMEOUT) are applied and
    /// the result validated.
    pub async fn load_from_path<P: AsRef<Path>>(
        path: P,
        provider: &Arc<dyn SecretsProvider>,
    ) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let mut config = Self::default();
            config.apply_env_overrides();
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;

        let raw: Value = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| HubError::config(format!("Failed to parse YAML config: {}", e)))?,
            _ => serde_json::from_str(&content)
                .map_err(|e| HubError::config(format!("Failed to parse JSON config: {}", e)))?,
        };

        let expanded = crate::secrets::expand_tree(&raw, provider).await?;

        let mut config: Config = serde_json::from_value(expanded)
            .map_err(|e| HubError::config(format!("Invalid config: {}", e)))?;

        // the map key is the primary key; stamp it into each descriptor
        for (name, upstream) in config.mcp_servers.iter_mut() {
            upstream.name = name.clone();
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a specific path (JSON or YAML by extension)
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        if let Some(parent) = path_ref.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = match path_ref.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)
                .map_err(|e| HubError::config(format!("Failed to serialize to YAML: {}", e)))?,
            _ => serde_json::to_string_pretty(self)?,
        };

        std::fs::write(path_ref, content)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var(constants::ENV_PORT)
            && let Ok(port) = port.parse::<u16>()
        {
            self.port = port;
        }
        if let Ok(base_path) = std::env::var(constants::ENV_BASE_PATH) {
            self.base_path = base_path;
        }
        if let Ok(secs) = std::env::var(constants::ENV_INIT_TIMEOUT)
            && let Ok(secs) = secs.parse::<u64>()
        {
            self.init_timeout = secs * 1000;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(HubError::config("port must be nonzero (1-65535)"));
        }
        if self.host.is_empty() {
            return Err(HubError::config("host cannot be empty"));
        }
        if !self.base_path.is_empty() && !self.base_path.starts_with('/') {
            return Err(HubError::config("basePath must start with '/'"));
        }
        if self.name_separator.is_empty() {
            return Err(HubError::config("nameSeparator cannot be empty"));
        }
        if self.auth.enable_bearer_auth && self.auth.bearer_auth_key.is_empty() {
            return Err(HubError::config(
                "bearerAuthKey is required when enableBearerAuth is set",
            ));
        }

        for upstream in self.mcp_servers.values() {
            upstream.validate()?;
        }

        let mut seen = std::collections::HashSet::new();
        for group in &self.groups {
            if !seen.insert(group.name.as_str()) {
                return Err(HubError::config(format!(
                    "duplicate group name '{}'",
                    group.name
                )));
            }
            for member in &group.servers {
                if !self.mcp_servers.contains_key(&member.name) {
                    return Err(HubError::config(format!(
                        "group '{}' references unknown upstream '{}'",
                        group.name, member.name
                    )));
                }
            }
        }

        if let Some(coordinator) = &self.coordinator
            && coordinator.kind == CoordinatorKind::Redis
            && coordinator.redis_url.as_deref().unwrap_or("").is_empty()
        {
            return Err(HubError::config(
                "coordinator.redisUrl is required for the redis coordinator",
            ));
        }

        Ok(())
    }

    /// Externally reachable base URL
    pub fn public_base_url(&self) -> String {
        self.public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }

    /// The RFC 9728 protected-resource metadata URL advertised in challenges
    pub fn resource_metadata_url(&self) -> String {
        format!(
            "{}/.well-known/oauth-protected-resource{}",
            self.public_base_url(),
            self.base_path
        )
    }

    /// Look up a group by name
    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// A projection of this config visible to one user: shared upstreams plus
    /// the ones they own.
    ///
    /// This view is for presentation only. Anything security-relevant (the
    /// bearer key check in particular) must read the unfiltered config.
    pub fn for_user(&self, user: &str) -> Config {
        let mut filtered = self.clone();
        filtered
            .mcp_servers
            .retain(|_, cfg| cfg.owner.is_none() || cfg.owner.as_deref() == Some(user));
        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::EnvSecretsProvider;

    fn provider() -> Arc<dyn SecretsProvider> {
        Arc::new(EnvSecretsProvider::new())
    }

    #[tokio::test]
    async fn load_missing_file_yields_defaults() {
        let config = Config::load_from_path("/nonexistent/mcphub.config.json", &provider())
            .await
            .unwrap();
        assert_eq!(config.port, constants::DEFAULT_HTTP_PORT);
        assert_eq!(config.name_separator, "-");
        assert!(config.routing.enable_global_route);
        assert!(config.mcp_servers.is_empty());
    }

    #[tokio::test]
    async fn load_expands_env_and_stamps_names() {
        unsafe {
            std::env::set_var("HUB_CFG_TEST_TOKEN", "s3cret");
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcphub.config.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "mcpServers": {
                    "weather": {
                        "url": "https://weather.example.com/mcp",
                        "headers": {"authorization": "Bearer ${HUB_CFG_TEST_TOKEN}"}
                    }
                }
            })
            .to_string(),
        )
        .unwrap();

        let config = Config::load_from_path(&path, &provider()).await.unwrap();
        let weather = &config.mcp_servers["weather"];
        assert_eq!(weather.name, "weather");
        assert_eq!(
            weather.headers.as_ref().unwrap()["authorization"],
            "Bearer s3cret"
        );

        unsafe {
            std::env::remove_var("HUB_CFG_TEST_TOKEN");
        }
    }

    #[tokio::test]
    async fn group_referencing_unknown_upstream_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcphub.config.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "groups": [{"name": "ops", "servers": ["ghost"]}]
            })
            .to_string(),
        )
        .unwrap();

        let err = Config::load_from_path(&path, &provider()).await.unwrap_err();
        assert!(err.to_string().contains("unknown upstream"));
    }

    #[test]
    fn bearer_auth_requires_a_key() {
        let mut config = Config::default();
        config.auth.enable_bearer_auth = true;
        assert!(config.validate().is_err());

        config.auth.bearer_auth_key = "k".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn for_user_hides_foreign_owned_upstreams() {
        let mut config = Config::default();
        config.mcp_servers.insert(
            "shared".into(),
            UpstreamConfig {
                name: "shared".into(),
                url: Some("https://a/mcp".into()),
                ..Default::default()
            },
        );
        config.mcp_servers.insert(
            "mine".into(),
            UpstreamConfig {
                name: "mine".into(),
                url: Some("https://b/mcp".into()),
                owner: Some("alice".into()),
                ..Default::default()
            },
        );

        let view = config.for_user("bob");
        assert!(view.mcp_servers.contains_key("shared"));
        assert!(!view.mcp_servers.contains_key("mine"));

        // the raw view still carries everything
        assert_eq!(config.mcp_servers.len(), 2);
    }

    #[test]
    fn resource_metadata_url_includes_base_path() {
        let mut config = Config::default();
        config.base_path = "/hub".into();
        config.public_base_url = Some("https://hub.example.com".into());
        assert_eq!(
            config.resource_metadata_url(),
            "https://hub.example.com/.well-known/oauth-protected-resource/hub"
        );
    }
}
