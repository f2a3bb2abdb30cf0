//! Constants used throughout the hub
//!
//! Configuration defaults, environment variable names, and the data-directory
//! layout handed to spawned upstream processes.

use once_cell::sync::Lazy;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Default data root (~/.mcphub)
pub fn default_data_root() -> &'static str {
    static DATA_ROOT: Lazy<String> = Lazy::new(|| {
        if let Some(home) = dirs::home_dir() {
            home.join(".mcphub").to_string_lossy().to_string()
        } else {
            // Fallback to current directory if home can't be determined
            ".mcphub".to_string()
        }
    });
    &DATA_ROOT
}

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "mcphub.config.json";

/// Settings document file name (inside the data root)
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 3000;

/// Separator between an upstream name and a tool/prompt name in the
/// unified namespace
pub const DEFAULT_NAME_SEPARATOR: &str = "-";

/// Default per-request timeout for upstream calls (milliseconds)
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 60_000;

/// Default timeout for upstream connect + initialize (milliseconds)
pub const DEFAULT_INIT_TIMEOUT_MS: u64 = 60_000;

/// Default keep-alive interval for SSE upstreams (seconds)
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// Keep-alive interval for downstream SSE sessions (seconds)
pub const SESSION_PING_SECS: u64 = 30;

/// Cluster heartbeat interval (seconds)
pub const DEFAULT_HEARTBEAT_SECS: u64 = 10;

/// A node is considered offline once its heartbeat is older than this
pub const DEFAULT_OFFLINE_AFTER_MS: i64 = 45_000;

/// Session id header for streamable HTTP
pub const HEADER_SESSION_ID: &str = "mcp-session-id";

/// Protocol version advertised to downstream clients
pub const PROTOCOL_VERSION: &str = "2025-03-26";

// ============================================================================
// ENVIRONMENT VARIABLES
// ============================================================================

/// Environment variable: data root override
pub const ENV_DATA_ROOT: &str = "MCPHUB_DATA_ROOT";

/// Environment variable: npm cache directory override
pub const ENV_NPM_CACHE: &str = "MCPHUB_NPM_CACHE";

/// Environment variable: npm global prefix override
pub const ENV_NPM_GLOBAL: &str = "MCPHUB_NPM_GLOBAL";

/// Environment variable: uv cache directory override
pub const ENV_UV_CACHE: &str = "MCPHUB_UV_CACHE";

/// Environment variable: uv tools directory override
pub const ENV_UV_TOOLS: &str = "MCPHUB_UV_TOOLS";

/// Environment variable: upstream initialize timeout (seconds)
pub const ENV_INIT_TIMEOUT: &str = "MCPHUB_INIT_TIMEOUT";

/// Environment variable: HTTP port override
pub const ENV_PORT: &str = "MCPHUB_PORT";

/// Environment variable: base path override
pub const ENV_BASE_PATH: &str = "MCPHUB_BASE_PATH";

/// Environment variable: settings repository backend (file | memory)
pub const ENV_SETTINGS_BACKEND: &str = "MCPHUB_SETTINGS_BACKEND";

// ============================================================================
// SMART ROUTING
// ============================================================================

/// Routing scope that exposes only the tool-discovery meta tools
pub const SMART_SCOPE: &str = "$smart";

/// Synthetic tool: vector search over the catalog
pub const SMART_TOOL_SEARCH: &str = "search_tools";

/// Synthetic tool: dynamic dispatch by tool name
pub const SMART_TOOL_CALL: &str = "call_tool";

/// An upstream POST failure matching this prefix is retried exactly once
/// after a transport rebuild
pub const RETRYABLE_POST_ERROR_PREFIX: &str = "Error POSTing to endpoint (HTTP 40";
