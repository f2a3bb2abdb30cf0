//! Downstream MCP endpoints
//!
//! Two parallel surfaces over one session table: legacy SSE (GET stream +
//! POST /messages companion) and streamable HTTP (single /mcp endpoint,
//! POST/GET/DELETE with an `mcp-session-id` header). Frames are JSON-RPC;
//! every request is resolved through the dispatcher with an explicit
//! per-call scope. Requests for sessions owned by another cluster node are
//! forwarded raw.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::Json;
use axum::body::Bytes;
use axum::extract::OriginalUri;
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use super::auth::{AuthenticatedUser, validate_route_scope};
use super::session::DownstreamSession;
use super::{AppState, proxy};
use crate::model::RequestScope;
use crate::protocol::{self, JsonRpcRequest, JsonRpcResponse};
use crate::{HubError, constants};

/// Removes the session when the response stream is dropped
struct SessionGuard {
    state: AppState,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let state = self.state.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            state.sessions.remove(&session_id).await;
        });
    }
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Forward the request to the owning node when the session is bound
/// elsewhere. None means: handle it here.
async fn proxied_elsewhere(
    state: &AppState,
    session_id: &str,
    method: Method,
    uri: &OriginalUri,
    headers: &HeaderMap,
    body: Bytes,
    client: Option<SocketAddr>,
) -> Option<Response> {
    let coordinator = state.coordinator.as_ref()?;
    let record = match coordinator.get_session(session_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(session = %session_id, "session lookup failed: {}", e);
            return None;
        }
    };
    if record.node_id == coordinator.node_id() {
        return None;
    }

    let base_url = match coordinator.get_node_base_url(&record.node_id).await {
        Ok(Some(url)) => url,
        _ => {
            return Some(
                json_error(
                    StatusCode::BAD_GATEWAY,
                    "session owner is no longer part of the cluster",
                ),
            );
        }
    };

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let local_host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}:{}", state.config.host, state.config.port));

    Some(proxy::forward(&base_url, method, &path_and_query, headers, body, &local_host, client).await)
}

// ============================================================================
// STREAMABLE HTTP
// ============================================================================

#[allow(clippy::too_many_arguments)]
pub(super) async fn mcp_endpoint(
    state: AppState,
    path_user: Option<String>,
    group: Option<String>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    authenticated: Option<AuthenticatedUser>,
    client: Option<SocketAddr>,
    body: Bytes,
) -> Response {
    let user = match validate_route_scope(
        &state.config,
        path_user.as_deref(),
        group.as_deref(),
        authenticated.as_ref(),
    ) {
        Ok(user) => user,
        Err(rejection) => return rejection,
    };

    let session_id = headers
        .get(constants::HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(session_id) = &session_id
        && let Some(proxied) = proxied_elsewhere(
            &state,
            session_id,
            method.clone(),
            &uri,
            &headers,
            body.clone(),
            client,
        )
        .await
    {
        return proxied;
    }

    match method {
        Method::POST => mcp_post(state, group, user, session_id, headers, body).await,
        Method::GET => mcp_get(state, session_id, headers).await,
        Method::DELETE => mcp_delete(state, session_id).await,
        _ => json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    }
}

async fn mcp_post(
    state: AppState,
    group: Option<String>,
    user: Option<String>,
    session_id: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let frame: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(frame) => frame,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(JsonRpcResponse::err(
                    Value::Null,
                    protocol::PARSE_ERROR,
                    format!("failed to deserialize request body: {}", e),
                )),
            )
                .into_response();
        }
    };

    if let Some(session_id) = session_id {
        let Some(session) = state.sessions.get(&session_id) else {
            return json_error(StatusCode::NOT_FOUND, "session not found");
        };
        return match handle_frame(&state, &session, frame, &headers).await {
            Some(response) => Json(response).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        };
    }

    // no session header: only an initialize may mint a session
    if frame.is_notification() || frame.method != "initialize" {
        return (
            StatusCode::BAD_REQUEST,
            Json(JsonRpcResponse::err(
                frame.id.unwrap_or(Value::Null),
                protocol::INVALID_REQUEST,
                "a session header is required for non-initialize requests",
            )),
        )
            .into_response();
    }

    let session = state
        .sessions
        .create(group.as_deref().unwrap_or(""), user)
        .await;
    tracing::debug!(session = %session.id, group = %session.group, "session created");

    let response = handle_frame(&state, &session, frame, &headers).await;
    let mut http_response = match response {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    if let Ok(value) = session.id.parse() {
        http_response
            .headers_mut()
            .insert(constants::HEADER_SESSION_ID, value);
    }
    http_response
}

async fn mcp_get(state: AppState, session_id: Option<String>, headers: HeaderMap) -> Response {
    let accepts_sse = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream") || accept.contains("*/*"));
    if !accepts_sse {
        return json_error(StatusCode::NOT_ACCEPTABLE, "client must accept text/event-stream");
    }

    let Some(session_id) = session_id else {
        return json_error(StatusCode::BAD_REQUEST, "session ID is required");
    };
    let Some(session) = state.sessions.get(&session_id) else {
        return json_error(StatusCode::NOT_FOUND, "session not found");
    };

    let rx = state.sessions.open_stream(&session);
    let stream = ReceiverStream::new(rx).map(|frame| {
        Ok::<Event, Infallible>(Event::default().event("message").data(frame.to_string()))
    });

    Sse::new(stream).into_response()
}

async fn mcp_delete(state: AppState, session_id: Option<String>) -> Response {
    let Some(session_id) = session_id else {
        return json_error(StatusCode::BAD_REQUEST, "session ID is required");
    };
    state.sessions.remove(&session_id).await;
    StatusCode::ACCEPTED.into_response()
}

// ============================================================================
// LEGACY SSE
// ============================================================================

pub(super) async fn sse_endpoint(
    state: AppState,
    path_user: Option<String>,
    group: Option<String>,
    authenticated: Option<AuthenticatedUser>,
) -> Response {
    let user = match validate_route_scope(
        &state.config,
        path_user.as_deref(),
        group.as_deref(),
        authenticated.as_ref(),
    ) {
        Ok(user) => user,
        Err(rejection) => return rejection,
    };

    let (session, rx) = state
        .sessions
        .create_sse(group.as_deref().unwrap_or(""), user)
        .await;
    tracing::debug!(session = %session.id, group = %session.group, "sse session created");

    let endpoint = messages_endpoint_path(
        &state.config.base_path,
        path_user.as_deref(),
        &session.id,
    );

    let guard = SessionGuard {
        state: state.clone(),
        session_id: session.id.clone(),
    };

    let first = futures::stream::once(async move {
        Ok::<Event, Infallible>(Event::default().event("endpoint").data(endpoint))
    });
    let frames = ReceiverStream::new(rx).map(move |frame| {
        // the guard rides along; dropping the stream closes the session
        let _keepalive = &guard;
        Ok::<Event, Infallible>(Event::default().event("message").data(frame.to_string()))
    });

    Sse::new(first.chain(frames)).into_response()
}

fn messages_endpoint_path(base_path: &str, path_user: Option<&str>, session_id: &str) -> String {
    match path_user {
        Some(user) => format!("{}/{}/messages?sessionId={}", base_path, user, session_id),
        None => format!("{}/messages?sessionId={}", base_path, session_id),
    }
}

pub(super) async fn messages_endpoint(
    state: AppState,
    path_user: Option<String>,
    session_id: Option<String>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    authenticated: Option<AuthenticatedUser>,
    client: Option<SocketAddr>,
    body: Bytes,
) -> Response {
    // scope was fixed when the SSE session was created; only the user rule
    // applies to the companion endpoint
    if let Err(rejection) = validate_route_scope(
        &state.config,
        path_user.as_deref(),
        Some(""),
        authenticated.as_ref(),
    ) {
        return rejection;
    }

    let Some(session_id) = session_id else {
        return json_error(StatusCode::BAD_REQUEST, "sessionId query parameter is required");
    };

    if let Some(proxied) = proxied_elsewhere(
        &state,
        &session_id,
        method,
        &uri,
        &headers,
        body.clone(),
        client,
    )
    .await
    {
        return proxied;
    }

    let Some(session) = state.sessions.get(&session_id) else {
        return json_error(StatusCode::NOT_FOUND, "session not found");
    };

    let frame: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(frame) => frame,
        Err(e) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                &format!("failed to deserialize request body: {}", e),
            );
        }
    };

    if let Some(response) = handle_frame(&state, &session, frame, &headers).await {
        let delivered = session.push(serde_json::to_value(&response).unwrap_or(Value::Null));
        if !delivered {
            tracing::debug!(session = %session.id, "response dropped, event stream closed");
        }
    }

    StatusCode::ACCEPTED.into_response()
}

// ============================================================================
// FRAME DISPATCH
// ============================================================================

/// Handle one JSON-RPC frame within a session. Notifications yield no
/// response.
async fn handle_frame(
    state: &AppState,
    session: &DownstreamSession,
    frame: JsonRpcRequest,
    headers: &HeaderMap,
) -> Option<JsonRpcResponse> {
    let Some(id) = frame.id.clone() else {
        tracing::trace!(method = %frame.method, "notification received");
        return None;
    };

    let scope = RequestScope {
        group: session.group.clone(),
        user: session.user.clone(),
        headers: headers.clone(),
    };

    let result: crate::Result<Value> = match frame.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": constants::PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": true },
                "prompts": {},
            },
            "serverInfo": {
                "name": "mcphub",
                "version": env!("CARGO_PKG_VERSION"),
            },
        })),
        "ping" => Ok(json!({})),
        "tools/list" => state
            .dispatcher
            .list_tools(&scope)
            .await
            .map(|tools| json!({ "tools": tools })),
        "tools/call" => match tool_call_params(&frame.params) {
            Ok((name, arguments)) => state.dispatcher.call_tool(&scope, &name, arguments).await,
            Err(e) => Err(e),
        },
        "prompts/list" => state
            .dispatcher
            .list_prompts(&scope)
            .await
            .map(|prompts| json!({ "prompts": prompts })),
        "prompts/get" => match tool_call_params(&frame.params) {
            Ok((name, arguments)) => state.dispatcher.get_prompt(&scope, &name, arguments).await,
            Err(e) => Err(e),
        },
        other => {
            return Some(JsonRpcResponse::err(
                id,
                protocol::METHOD_NOT_FOUND,
                format!("method '{}' is not supported", other),
            ));
        }
    };

    Some(match result {
        Ok(value) => JsonRpcResponse::ok(id, value),
        Err(e) => JsonRpcResponse::err(id, rpc_error_code(&e), e.to_string()),
    })
}

fn tool_call_params(
    params: &Value,
) -> crate::Result<(String, Option<serde_json::Map<String, Value>>)> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| HubError::mcp("params.name is required"))?;
    let arguments = params
        .get("arguments")
        .and_then(Value::as_object)
        .cloned();
    Ok((name.to_string(), arguments))
}

fn rpc_error_code(error: &HubError) -> i64 {
    match error {
        HubError::NotFound { .. } => protocol::INVALID_PARAMS,
        HubError::Mcp(_) => protocol::INVALID_PARAMS,
        _ => protocol::INTERNAL_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_endpoint_paths() {
        assert_eq!(
            messages_endpoint_path("", None, "abc"),
            "/messages?sessionId=abc"
        );
        assert_eq!(
            messages_endpoint_path("/hub", Some("alice"), "abc"),
            "/hub/alice/messages?sessionId=abc"
        );
    }

    #[test]
    fn error_codes_map_to_protocol() {
        assert_eq!(
            rpc_error_code(&HubError::not_found("tool", "x")),
            protocol::INVALID_PARAMS
        );
        assert_eq!(
            rpc_error_code(&HubError::transport("boom")),
            protocol::INTERNAL_ERROR
        );
    }
}
