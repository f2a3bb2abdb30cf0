//! Error types for the hub
//!
//! One error tree for the whole crate, built with thiserror. Infrastructure
//! failures (transport, timeout, cluster proxy) are surfaced to callers;
//! policy failures (authentication, not-found) become structured HTTP or MCP
//! errors at the edge; lifecycle failures (config, authorization-required)
//! persist in the upstream status so operators can see them.

use std::time::Duration;

use thiserror::Error;

/// Main error type for hub operations
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authorization required for upstream '{server}'")]
    AuthorizationRequired {
        server: String,
        authorization_url: Option<String>,
    },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("{entity} not found: {name}")]
    NotFound { entity: &'static str, name: String },

    #[error("Timed out after {after:?}: {what}")]
    Timeout { what: String, after: Duration },

    #[error("Cluster proxy error: {0}")]
    ClusterProxy(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Convenient result type for hub operations
pub type Result<T> = std::result::Result<T, HubError>;

impl HubError {
    /// Create a config error
    #[inline]
    pub fn config<S: Into<String>>(msg: S) -> Self {
        HubError::Config(msg.into())
    }

    /// Create a transport error
    #[inline]
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        HubError::Transport(msg.into())
    }

    /// Create an authentication error
    #[inline]
    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        HubError::Authentication(msg.into())
    }

    /// Create a not found error
    #[inline]
    pub fn not_found(entity: &'static str, name: impl Into<String>) -> Self {
        HubError::NotFound {
            entity,
            name: name.into(),
        }
    }

    /// Create a timeout error
    #[inline]
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        HubError::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Create a cluster proxy error
    #[inline]
    pub fn cluster<S: Into<String>>(msg: S) -> Self {
        HubError::ClusterProxy(msg.into())
    }

    /// Create a storage error
    #[inline]
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        HubError::Storage(msg.into())
    }

    /// Create an OAuth error
    #[inline]
    pub fn oauth<S: Into<String>>(msg: S) -> Self {
        HubError::OAuth(msg.into())
    }

    /// Create an MCP protocol error
    #[inline]
    pub fn mcp<S: Into<String>>(msg: S) -> Self {
        HubError::Mcp(msg.into())
    }

    /// True when a failed upstream call may be retried once after a
    /// transport rebuild (the narrow HTTP-40x-on-POST pattern)
    pub fn is_retryable_post(&self) -> bool {
        match self {
            HubError::Transport(msg) | HubError::Mcp(msg) => {
                msg.starts_with(crate::constants::RETRYABLE_POST_ERROR_PREFIX)
            }
            _ => false,
        }
    }

    /// Add context to an error
    pub fn context<C: std::fmt::Display>(self, context: C) -> Self {
        match self {
            Self::Config(msg) => Self::Config(format!("{}: {}", context, msg)),
            Self::Transport(msg) => Self::Transport(format!("{}: {}", context, msg)),
            Self::Authentication(msg) => Self::Authentication(format!("{}: {}", context, msg)),
            Self::Storage(msg) => Self::Storage(format!("{}: {}", context, msg)),
            Self::OAuth(msg) => Self::OAuth(format!("{}: {}", context, msg)),
            Self::Mcp(msg) => Self::Mcp(format!("{}: {}", context, msg)),
            Self::ClusterProxy(msg) => Self::ClusterProxy(format!("{}: {}", context, msg)),
            other => Self::Mcp(format!("{}: {}", context, other)),
        }
    }
}
