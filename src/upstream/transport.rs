//! Upstream transport adapters
//!
//! One tagged type behind which the registry treats every upstream the same:
//! stdio child processes, SSE, and streamable-HTTP all run real MCP clients
//! from the official SDK; OpenAPI upstreams translate a schema into synthetic
//! tools and speak plain HTTP. Connecting, listing, calling, and the
//! keep-alive probe all funnel through here.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rmcp::model::{
    CallToolRequestParam, ClientInfo, GetPromptRequestParam, Implementation, Prompt,
    ProgressNotificationParam, Tool,
};
use rmcp::service::{NotificationContext, RunningService};
use rmcp::{ClientHandler, RoleClient, ServiceExt};
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::DataConfig;
use crate::model::{RequestScope, UpstreamConfig, UpstreamKind, UpstreamOptions};
use crate::oauth::UpstreamOAuth;
use crate::upstream::openapi::OpenApiClient;
use crate::{HubError, Result, constants};

pub(crate) type McpClient = RunningService<RoleClient, HubClientHandler>;

/// Client-side handler for one upstream connection.
///
/// Forwards `tools/list_changed` notifications to the registry and timestamps
/// progress so `resetTimeoutOnProgress` has something to look at.
#[derive(Clone)]
pub(crate) struct HubClientHandler {
    info: ClientInfo,
    server: String,
    events: Option<UnboundedSender<String>>,
    activity: Arc<Mutex<Instant>>,
}

impl HubClientHandler {
    fn new(server: &str, events: Option<UnboundedSender<String>>) -> Self {
        let mut info = ClientInfo::default();
        info.client_info = Implementation {
            name: "mcphub".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        };
        Self {
            info,
            server: server.to_string(),
            events,
            activity: Arc::new(Mutex::new(Instant::now())),
        }
    }
}

impl ClientHandler for HubClientHandler {
    fn get_info(&self) -> ClientInfo {
        self.info.clone()
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        if let Some(events) = &self.events
            && events.send(self.server.clone()).is_err()
        {
            tracing::debug!(server = %self.server, "registry stopped listening for tool changes");
        }
    }

    async fn on_progress(
        &self,
        _params: ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        *self.activity.lock() = Instant::now();
    }
}

/// A live MCP client plus the activity clock its handler feeds.
///
/// Requests go through the cloned `Peer`; the owning service sits behind a
/// mutex so `close` can take it out and cancel it while other holders of the
/// same `Arc<UpstreamTransport>` finish their in-flight calls.
pub(crate) struct McpConnection {
    peer: rmcp::service::Peer<RoleClient>,
    service: tokio::sync::Mutex<Option<McpClient>>,
    activity: Arc<Mutex<Instant>>,
}

impl McpConnection {
    fn new(client: McpClient, activity: Arc<Mutex<Instant>>) -> Self {
        Self {
            peer: client.peer().clone(),
            service: tokio::sync::Mutex::new(Some(client)),
            activity,
        }
    }
}

/// The transport handle held by the registry (or a JIT on-demand call)
pub(crate) enum UpstreamTransport {
    Mcp(McpConnection),
    OpenApi(Box<OpenApiClient>),
    #[cfg(test)]
    Failing(FailingTransport),
}

/// Test double: every call fails with a fixed message, counting invocations
#[cfg(test)]
pub(crate) struct FailingTransport {
    pub message: String,
    pub calls: Arc<std::sync::atomic::AtomicUsize>,
}

impl UpstreamTransport {
    pub(crate) async fn list_tools(&self, opts: &UpstreamOptions) -> Result<Vec<Tool>> {
        match self {
            UpstreamTransport::Mcp(conn) => {
                let result = with_options(
                    "tools/list",
                    opts,
                    Some(&conn.activity),
                    conn.peer.list_tools(None),
                )
                .await?;
                Ok(result.tools)
            }
            UpstreamTransport::OpenApi(client) => Ok(client.tools()),
            #[cfg(test)]
            UpstreamTransport::Failing(f) => Err(f.fail()),
        }
    }

    pub(crate) async fn list_prompts(&self, opts: &UpstreamOptions) -> Result<Vec<Prompt>> {
        match self {
            UpstreamTransport::Mcp(conn) => {
                let result = with_options(
                    "prompts/list",
                    opts,
                    Some(&conn.activity),
                    conn.peer.list_prompts(None),
                )
                .await?;
                Ok(result.prompts)
            }
            UpstreamTransport::OpenApi(_) => Ok(Vec::new()),
            #[cfg(test)]
            UpstreamTransport::Failing(f) => Err(f.fail()),
        }
    }

    pub(crate) async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
        opts: &UpstreamOptions,
    ) -> Result<Value> {
        match self {
            UpstreamTransport::Mcp(conn) => {
                let result = with_options(
                    "prompts/get",
                    opts,
                    Some(&conn.activity),
                    conn.peer.get_prompt(GetPromptRequestParam {
                        name: name.to_string(),
                        arguments,
                    }),
                )
                .await?;
                Ok(serde_json::to_value(result)?)
            }
            UpstreamTransport::OpenApi(_) => Err(HubError::not_found("prompt", name)),
            #[cfg(test)]
            UpstreamTransport::Failing(f) => Err(f.fail()),
        }
    }

    /// Call one tool and return the upstream's raw MCP result
    pub(crate) async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
        opts: &UpstreamOptions,
        scope: &RequestScope,
    ) -> Result<Value> {
        match self {
            UpstreamTransport::Mcp(conn) => {
                let result = with_options(
                    "tools/call",
                    opts,
                    Some(&conn.activity),
                    conn.peer.call_tool(CallToolRequestParam {
                        name: name.to_string().into(),
                        arguments,
                    }),
                )
                .await?;
                Ok(serde_json::to_value(result)?)
            }
            UpstreamTransport::OpenApi(client) => client.call_tool(name, arguments, scope).await,
            #[cfg(test)]
            UpstreamTransport::Failing(f) => Err(f.fail()),
        }
    }

    /// Liveness probe for keep-alive. `tools/list` doubles as the probe; the
    /// client role has no dedicated ping RPC.
    pub(crate) async fn ping(&self) -> Result<()> {
        let opts = UpstreamOptions {
            timeout: 10_000,
            ..Default::default()
        };
        self.list_tools(&opts).await.map(|_| ())
    }

    /// Tear the connection down; for stdio this reaps the child process.
    /// Safe to call while other holders still have calls in flight.
    pub(crate) async fn close(&self) -> Result<()> {
        match self {
            UpstreamTransport::Mcp(conn) => {
                let Some(service) = conn.service.lock().await.take() else {
                    return Ok(());
                };
                service
                    .cancel()
                    .await
                    .map(|_| ())
                    .map_err(|e| HubError::transport(format!("close failed: {}", e)))
            }
            UpstreamTransport::OpenApi(_) => Ok(()),
            #[cfg(test)]
            UpstreamTransport::Failing(_) => Ok(()),
        }
    }
}

#[cfg(test)]
impl FailingTransport {
    fn fail(&self) -> HubError {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        HubError::transport(self.message.clone())
    }
}

/// Everything `connect` needs to dial one upstream
pub(crate) struct ConnectContext<'a> {
    pub config: &'a UpstreamConfig,
    pub data: &'a DataConfig,
    pub oauth: Option<&'a Arc<UpstreamOAuth>>,
    pub init_timeout: Duration,
    pub events: Option<UnboundedSender<String>>,
}

/// Dial an upstream per its configured kind
pub(crate) async fn connect(ctx: ConnectContext<'_>) -> Result<UpstreamTransport> {
    let name = ctx.config.name.as_str();
    match ctx.config.kind() {
        UpstreamKind::Stdio => connect_stdio(&ctx, name).await,
        UpstreamKind::Sse => connect_sse(&ctx, name).await,
        UpstreamKind::StreamableHttp => connect_streamable(&ctx, name).await,
        UpstreamKind::OpenApi => {
            let client = OpenApiClient::initialize(ctx.config).await?;
            Ok(UpstreamTransport::OpenApi(Box::new(client)))
        }
    }
}

async fn connect_stdio(ctx: &ConnectContext<'_>, name: &str) -> Result<UpstreamTransport> {
    let command_str = ctx
        .config
        .command
        .as_deref()
        .ok_or_else(|| HubError::config(format!("upstream '{}': stdio requires a command", name)))?;

    tracing::debug!(server = %name, command = %command_str, "starting stdio transport");

    let mut command = Command::new(command_str);
    if let Some(args) = &ctx.config.args {
        command.args(args);
    }
    for (key, value) in stdio_environment(ctx.config.env.as_ref(), ctx.data) {
        command.env(key, value);
    }
    if let Some(dir) = server_workdir(name, command_str, ctx.data) {
        let _ = std::fs::create_dir_all(&dir);
        command.current_dir(dir);
    }
    command.kill_on_drop(true);

    let (transport, stderr) = TokioChildProcess::builder(command)
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            HubError::transport(format!("failed to spawn '{}' for {}: {}", command_str, name, e))
        })?;

    // pipe the child's stderr into our log, prefixed with the upstream name
    if let Some(stderr) = stderr {
        let server = name.to_string();
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => tracing::info!(target: "upstream_stderr", "[{}] {}", server, line),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(server = %server, "failed to read upstream stderr: {}", e);
                        break;
                    }
                }
            }
        });
    }

    let handler = HubClientHandler::new(name, ctx.events.clone());
    let activity = handler.activity.clone();
    let client = tokio::time::timeout(ctx.init_timeout, handler.serve(transport))
        .await
        .map_err(|_| HubError::timeout(format!("initialize {}", name), ctx.init_timeout))?
        .map_err(|e| HubError::transport(format!("initialize {} failed: {}", name, e)))?;

    Ok(UpstreamTransport::Mcp(McpConnection::new(client, activity)))
}

async fn connect_sse(ctx: &ConnectContext<'_>, name: &str) -> Result<UpstreamTransport> {
    let url = require_url(ctx.config, name)?;
    tracing::debug!(server = %name, url = %url, "starting sse transport");

    let client = http_client(ctx).await?;
    let transport = SseClientTransport::start_with_client(
        client,
        SseClientConfig {
            sse_endpoint: url.into(),
            ..Default::default()
        },
    )
    .await
    .map_err(|e| HubError::transport(format!("sse connect to {} failed: {}", name, e)))?;

    let handler = HubClientHandler::new(name, ctx.events.clone());
    let activity = handler.activity.clone();
    let client = tokio::time::timeout(ctx.init_timeout, handler.serve(transport))
        .await
        .map_err(|_| HubError::timeout(format!("initialize {}", name), ctx.init_timeout))?
        .map_err(|e| HubError::transport(format!("initialize {} failed: {}", name, e)))?;

    Ok(UpstreamTransport::Mcp(McpConnection::new(client, activity)))
}

async fn connect_streamable(ctx: &ConnectContext<'_>, name: &str) -> Result<UpstreamTransport> {
    let url = require_url(ctx.config, name)?;
    tracing::debug!(server = %name, url = %url, "starting streamable http transport");

    let client = http_client(ctx).await?;
    let transport = StreamableHttpClientTransport::with_client(
        client,
        StreamableHttpClientTransportConfig::with_uri(url),
    );

    let handler = HubClientHandler::new(name, ctx.events.clone());
    let activity = handler.activity.clone();
    let client = tokio::time::timeout(ctx.init_timeout, handler.serve(transport))
        .await
        .map_err(|_| HubError::timeout(format!("initialize {}", name), ctx.init_timeout))?
        .map_err(|e| HubError::transport(format!("initialize {} failed: {}", name, e)))?;

    Ok(UpstreamTransport::Mcp(McpConnection::new(client, activity)))
}

fn require_url(config: &UpstreamConfig, name: &str) -> Result<String> {
    config
        .url
        .clone()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| HubError::config(format!("upstream '{}' requires a url", name)))
}

/// Build the reqwest client used by the http transports: configured headers
/// (already env-expanded at load) plus the OAuth bearer, when one exists.
async fn http_client(ctx: &ConnectContext<'_>) -> Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Some(configured) = &ctx.config.headers {
        for (k, v) in configured {
            let header_name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| HubError::config(format!("invalid header name '{}': {}", k, e)))?;
            let header_value = reqwest::header::HeaderValue::from_str(v)
                .map_err(|e| HubError::config(format!("invalid header value for '{}': {}", k, e)))?;
            headers.insert(header_name, header_value);
        }
    }
    if let Some(oauth) = ctx.oauth {
        for (k, v) in oauth.auth_headers().await? {
            let header_name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| HubError::oauth(format!("invalid auth header: {}", e)))?;
            let header_value = reqwest::header::HeaderValue::from_str(&v)
                .map_err(|e| HubError::oauth(format!("invalid auth header value: {}", e)))?;
            headers.insert(header_name, header_value);
        }
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .map_err(|e| HubError::transport(format!("http client build failed: {}", e)))
}

/// Probe an endpoint for a 401 challenge; returns the WWW-Authenticate value
pub(crate) async fn probe_challenge(url: &str) -> Result<Option<String>> {
    let response = reqwest::Client::new().get(url).send().await?;
    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        return Ok(response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string));
    }
    Ok(None)
}

/// The environment handed to a spawned upstream: caches and install dirs
/// derived from the hub data root, PATH additions, configured package
/// mirrors, then the upstream's own env on top.
pub(crate) fn stdio_environment(
    extra: Option<&HashMap<String, String>>,
    data: &DataConfig,
) -> HashMap<String, String> {
    let root = data.data_root();
    let npm_cache = std::env::var(constants::ENV_NPM_CACHE)
        .unwrap_or_else(|_| format!("{}/npm-cache", root));
    let npm_global = std::env::var(constants::ENV_NPM_GLOBAL)
        .unwrap_or_else(|_| format!("{}/npm-global", root));
    let uv_cache =
        std::env::var(constants::ENV_UV_CACHE).unwrap_or_else(|_| format!("{}/uv/cache", root));
    let uv_tools =
        std::env::var(constants::ENV_UV_TOOLS).unwrap_or_else(|_| format!("{}/uv/tools", root));

    let mut env: HashMap<String, String> = HashMap::new();

    let inherited_path = std::env::var("PATH").unwrap_or_default();
    env.insert(
        "PATH".to_string(),
        format!("{}/bin:{}/bin:{}", npm_global, uv_tools, inherited_path),
    );

    env.insert("npm_config_cache".to_string(), npm_cache);
    env.insert("npm_config_prefix".to_string(), npm_global);
    env.insert("UV_CACHE_DIR".to_string(), uv_cache);
    env.insert("UV_TOOL_DIR".to_string(), uv_tools);

    if let Some(registry) = &data.npm_registry {
        env.insert("NPM_CONFIG_REGISTRY".to_string(), registry.clone());
    }
    if let Some(index) = &data.python_index_url {
        env.insert("UV_INDEX_URL".to_string(), index.clone());
        env.insert("PIP_INDEX_URL".to_string(), index.clone());
    }

    if let Some(extra) = extra {
        for (k, v) in extra {
            env.insert(k.clone(), v.clone());
        }
    }

    env
}

/// Per-upstream working directory for package-runner launched servers
fn server_workdir(name: &str, command: &str, data: &DataConfig) -> Option<String> {
    let root = data.data_root();
    let runner = std::path::Path::new(command)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(command);
    match runner {
        "npx" | "npm" | "node" => Some(format!("{}/servers/npm/{}", root, name)),
        "uvx" | "uv" | "python" | "python3" => Some(format!("{}/servers/python/{}", root, name)),
        _ => None,
    }
}

fn map_service_error(what: &str, e: rmcp::ServiceError) -> HubError {
    match e {
        rmcp::ServiceError::McpError(e) => HubError::mcp(e.to_string()),
        rmcp::ServiceError::Timeout { timeout } => HubError::timeout(what, timeout),
        rmcp::ServiceError::TransportSend(e) => HubError::transport(e.to_string()),
        other => HubError::mcp(other.to_string()),
    }
}

/// Drive an upstream call under the configured timeout policy.
///
/// The base timeout restarts from the last observed progress notification
/// when `resetTimeoutOnProgress` is set; `maxTotalTimeout` is a hard ceiling
/// either way.
pub(crate) async fn with_options<T, F>(
    what: &str,
    opts: &UpstreamOptions,
    activity: Option<&Arc<Mutex<Instant>>>,
    fut: F,
) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, rmcp::ServiceError>>,
{
    let base = Duration::from_millis(opts.timeout);
    let started = Instant::now();
    let ceiling = opts
        .max_total_timeout
        .map(|ms| started + Duration::from_millis(ms));

    let cap = |deadline: Instant| match ceiling {
        Some(ceiling) if deadline > ceiling => ceiling,
        _ => deadline,
    };

    tokio::pin!(fut);
    let mut deadline = cap(started + base);

    loop {
        tokio::select! {
            result = &mut fut => {
                return result.map_err(|e| map_service_error(what, e));
            }
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                if opts.reset_timeout_on_progress
                    && let Some(activity) = activity
                {
                    let extended = cap(*activity.lock() + base);
                    if extended > deadline {
                        deadline = extended;
                        continue;
                    }
                }
                return Err(HubError::timeout(what, started.elapsed()));
            }
        }
    }
}
