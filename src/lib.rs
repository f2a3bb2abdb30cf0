//! mcphub - MCP hub
//!
//! Aggregates many upstream Model-Context-Protocol tool servers behind a
//! single MCP-compatible endpoint: one unified tool/prompt namespace, with
//! requests transparently multiplexed to the right upstream.
//!
//! # Architecture
//!
//! - Upstream transports (stdio subprocess, SSE, streamable HTTP,
//!   OpenAPI-as-MCP) behind one adapter type
//! - A registry owning upstream lifecycle, catalogs, and keep-alive
//! - A per-upstream OAuth 2.0 client with dynamic registration and PKCE
//! - A downstream session layer speaking MCP over SSE and streamable HTTP
//! - A dispatcher applying group and per-tool visibility, with a `$smart`
//!   discovery surface
//! - Optional clustering with sticky sessions over a memory or Redis
//!   coordinator

// Core modules
pub mod constants;
pub mod error;
pub mod model;
pub mod protocol;

// Infrastructure
pub mod config;
pub mod secrets;
pub mod storage;

// The multiplexing engine
pub mod cluster;
pub mod dispatch;
pub mod oauth;
pub mod upstream;

// Interface layers
pub mod cli;
pub mod http;

// Re-exports for convenience
pub use config::Config;
pub use error::{HubError, Result};
pub use model::{RequestScope, UpstreamConfig, UpstreamStatus};

/// Initialize logging for the application
pub fn init_logging() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "mcphub=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
