//! HTTP server
//!
//! Mounts the downstream MCP surfaces under the configured base path, the
//! health endpoint at root, and the RFC 9728 protected-resource metadata when
//! bearer auth is on. Route shapes:
//!
//! - `GET  {base}/[{user}/]sse[/{group}]`
//! - `POST {base}/[{user}/]messages?sessionId=…`
//! - `POST/GET/DELETE {base}/[{user}/]mcp[/{group}]`
//! - `GET  /health`
//! - `GET  /.well-known/oauth-protected-resource{base}`

pub mod auth;
pub mod mcp;
pub mod proxy;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cluster::{Coordinator, coordinator_from_config};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::dispatch::smart::LexicalToolSearch;
use crate::storage::settings_repository_from_env;
use crate::upstream::UpstreamRegistry;
use crate::{HubError, Result};

use auth::MaybeUser;
use proxy::ClientAddr;
use session::SessionTable;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<UpstreamRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<SessionTable>,
    pub coordinator: Option<Arc<dyn Coordinator>>,
}

/// Start the hub: connect upstreams, join the cluster, serve until SIGINT.
pub async fn start_server(config: Config) -> Result<()> {
    let config = Arc::new(config);

    let settings = settings_repository_from_env(&config.data.data_root());

    // snapshot the configured topology into the settings document; OAuth
    // state accumulates under the same roof
    {
        let mut document = settings.load().await.unwrap_or_default();
        document.mcp_servers = config.mcp_servers.clone();
        document.groups = config.groups.clone();
        if let Err(e) = settings.save(&document).await {
            tracing::warn!("failed to persist settings document: {}", e);
        }
    }

    let search = Arc::new(LexicalToolSearch::new());
    let registry = UpstreamRegistry::new(&config, settings, search.clone());

    if let Err(e) = registry.register_all(None).await {
        tracing::warn!("initial upstream registration: {}", e);
    }

    let coordinator = coordinator_from_config(&config)?;
    if let Some(coordinator) = &coordinator {
        coordinator.initialize().await?;
        coordinator
            .register_local_servers(registry.status_entries())
            .await?;
        tracing::info!(node = %coordinator.node_id(), "joined cluster");
    }

    let sessions = SessionTable::new(coordinator.clone());
    registry.set_listener(sessions.clone());

    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), config.clone(), search));

    let state = AppState {
        config: config.clone(),
        registry: registry.clone(),
        dispatcher,
        sessions: sessions.clone(),
        coordinator: coordinator.clone(),
    };

    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| HubError::config(format!("Invalid address: {}", e)))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("hub listening on http://{}{}", addr, config.base_path);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .map_err(|e| HubError::config(format!("Server error: {}", e)))?;

    // orderly teardown: sessions first so cluster records clear, then
    // transports, then cluster membership
    sessions.shutdown().await;
    registry.shutdown().await;
    if let Some(coordinator) = &coordinator {
        coordinator.shutdown().await?;
    }

    Ok(())
}

/// Assemble the full router for one AppState
pub fn build_router(state: AppState) -> Router {
    let transport_routes = Router::new()
        // legacy SSE; the two-segment group form carries `$smart/{group}`
        .route("/sse", get(sse_root))
        .route("/sse/{group}", get(sse_group))
        .route("/sse/{group}/{sub}", get(sse_subgroup))
        .route("/{user}/sse", get(sse_user))
        .route("/{user}/sse/{group}", get(sse_user_group))
        // SSE companion endpoint
        .route("/messages", post(messages_root))
        .route("/{user}/messages", post(messages_user))
        // streamable HTTP
        .route("/mcp", any(mcp_root))
        .route("/mcp/{group}", any(mcp_group))
        .route("/mcp/{group}/{sub}", any(mcp_subgroup))
        .route("/{user}/mcp", any(mcp_user))
        .route("/{user}/mcp/{group}", any(mcp_user_group))
        .route("/{user}/mcp/{group}/{sub}", any(mcp_user_subgroup))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::bearer_guard,
        ));

    let base_path = state.config.base_path.clone();
    let mut app = if base_path.is_empty() {
        Router::new().merge(transport_routes)
    } else {
        Router::new().nest(&base_path, transport_routes)
    };

    app = app.route("/health", get(health));

    if state.config.auth.enable_bearer_auth {
        app = app.route(
            &format!("/.well-known/oauth-protected-resource{}", base_path),
            get(resource_metadata),
        );
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// ROOT ENDPOINTS
// ============================================================================

/// 200 when every enabled upstream is connected, 503 otherwise
async fn health(State(state): State<AppState>) -> Response {
    let healthy = state.registry.healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "servers": state.registry.infos(),
            "sessions": state.sessions.len(),
        })),
    )
        .into_response()
}

/// RFC 9728: the hub as an OAuth protected resource
async fn resource_metadata(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "resource": format!("{}{}", state.config.public_base_url(), state.config.base_path),
        "bearer_methods_supported": ["header"],
    }))
}

// ============================================================================
// ROUTE WRAPPERS
// ============================================================================
// One wrapper per path shape; each funnels into the shared handlers in
// `mcp.rs` with an explicit (user, group) pair.

async fn sse_root(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
) -> Response {
    mcp::sse_endpoint(state, None, None, user).await
}

async fn sse_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
    MaybeUser(user): MaybeUser,
) -> Response {
    mcp::sse_endpoint(state, None, Some(group), user).await
}

async fn sse_subgroup(
    State(state): State<AppState>,
    Path((group, sub)): Path<(String, String)>,
    MaybeUser(user): MaybeUser,
) -> Response {
    mcp::sse_endpoint(
        state,
        None,
        Some(format!("{}/{}", group, sub)),
        user,
    )
    .await
}

async fn sse_user(
    State(state): State<AppState>,
    Path(path_user): Path<String>,
    MaybeUser(user): MaybeUser,
) -> Response {
    mcp::sse_endpoint(state, Some(path_user), None, user).await
}

async fn sse_user_group(
    State(state): State<AppState>,
    Path((path_user, group)): Path<(String, String)>,
    MaybeUser(user): MaybeUser,
) -> Response {
    mcp::sse_endpoint(state, Some(path_user), Some(group), user).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagesQuery {
    session_id: Option<String>,
}

#[allow(clippy::too_many_arguments)]
async fn messages_root(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    MaybeUser(user): MaybeUser,
    ClientAddr(client): ClientAddr,
    body: Bytes,
) -> Response {
    mcp::messages_endpoint(
        state,
        None,
        query.session_id,
        method,
        uri,
        headers,
        user,
        client,
        body,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn messages_user(
    State(state): State<AppState>,
    Path(path_user): Path<String>,
    Query(query): Query<MessagesQuery>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    MaybeUser(user): MaybeUser,
    ClientAddr(client): ClientAddr,
    body: Bytes,
) -> Response {
    mcp::messages_endpoint(
        state,
        Some(path_user),
        query.session_id,
        method,
        uri,
        headers,
        user,
        client,
        body,
    )
    .await
}

async fn mcp_root(
    State(state): State<AppState>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    MaybeUser(user): MaybeUser,
    ClientAddr(client): ClientAddr,
    body: Bytes,
) -> Response {
    mcp::mcp_endpoint(
        state,
        None,
        None,
        method,
        uri,
        headers,
        user,
        client,
        body,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn mcp_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    MaybeUser(user): MaybeUser,
    ClientAddr(client): ClientAddr,
    body: Bytes,
) -> Response {
    mcp::mcp_endpoint(
        state,
        None,
        Some(group),
        method,
        uri,
        headers,
        user,
        client,
        body,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn mcp_subgroup(
    State(state): State<AppState>,
    Path((group, sub)): Path<(String, String)>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    MaybeUser(user): MaybeUser,
    ClientAddr(client): ClientAddr,
    body: Bytes,
) -> Response {
    mcp::mcp_endpoint(
        state,
        None,
        Some(format!("{}/{}", group, sub)),
        method,
        uri,
        headers,
        user,
        client,
        body,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn mcp_user(
    State(state): State<AppState>,
    Path(path_user): Path<String>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    MaybeUser(user): MaybeUser,
    ClientAddr(client): ClientAddr,
    body: Bytes,
) -> Response {
    mcp::mcp_endpoint(
        state,
        Some(path_user),
        None,
        method,
        uri,
        headers,
        user,
        client,
        body,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn mcp_user_group(
    State(state): State<AppState>,
    Path((path_user, group)): Path<(String, String)>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    MaybeUser(user): MaybeUser,
    ClientAddr(client): ClientAddr,
    body: Bytes,
) -> Response {
    mcp::mcp_endpoint(
        state,
        Some(path_user),
        Some(group),
        method,
        uri,
        headers,
        user,
        client,
        body,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn mcp_user_subgroup(
    State(state): State<AppState>,
    Path((path_user, group, sub)): Path<(String, String, String)>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    MaybeUser(user): MaybeUser,
    ClientAddr(client): ClientAddr,
    body: Bytes,
) -> Response {
    mcp::mcp_endpoint(
        state,
        Some(path_user),
        Some(format!("{}/{}", group, sub)),
        method,
        uri,
        headers,
        user,
        client,
        body,
    )
    .await
}
