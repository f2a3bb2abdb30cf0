//! Transport-edge authentication
//!
//! Bearer-key enforcement and user-scope path validation, applied before any
//! request reaches the session layer. The bearer key is always compared
//! against the UNFILTERED configuration: an unauthenticated caller must be
//! measured against the real policy, never a user-scoped projection.

use axum::Json;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use super::AppState;
use crate::config::Config;

/// Identity installed by the (external) user-authentication middleware
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub String);

/// Infallible extractor for the optional authenticated identity
pub struct MaybeUser(pub Option<AuthenticatedUser>);

impl<S> FromRequestParts<S> for MaybeUser
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let user = parts.extensions.get::<AuthenticatedUser>().cloned();
        async move { Ok(MaybeUser(user)) }
    }
}

/// RFC 6750 challenge response: WWW-Authenticate header plus a JSON body
/// mirroring the same fields
pub fn invalid_token_response(config: &Config, description: &str) -> Response {
    let resource_metadata = config.resource_metadata_url();
    let challenge = format!(
        "Bearer error=\"invalid_token\", error_description=\"{}\", resource_metadata=\"{}\"",
        description, resource_metadata
    );

    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "invalid_token",
            "error_description": description,
            "resource_metadata": resource_metadata,
        })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

pub fn forbidden_response(description: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({
            "error": "forbidden",
            "error_description": description,
        })),
    )
        .into_response()
}

/// Bearer-key middleware over the MCP transport endpoints
pub async fn bearer_guard(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    // raw view, deliberately: filtered configs are presentation-only
    let auth = &state.config.auth;
    if !auth.enable_bearer_auth {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(token) if token == auth.bearer_auth_key => next.run(request).await,
        Some(_) => invalid_token_response(&state.config, "the provided bearer key is not valid"),
        None => invalid_token_response(&state.config, "a bearer key is required"),
    }
}

/// Enforce the user-scope rules of a path:
/// - a `user` path segment requires an authenticated caller with exactly
///   that username (403 on mismatch, 401 with a challenge when anonymous);
/// - the global route may be disabled entirely.
///
/// Returns the effective user for the session scope.
pub fn validate_route_scope(
    config: &Config,
    path_user: Option<&str>,
    group: Option<&str>,
    authenticated: Option<&AuthenticatedUser>,
) -> Result<Option<String>, Response> {
    if group.is_none() && !config.routing.enable_global_route {
        return Err(forbidden_response("the global route is disabled"));
    }

    match path_user {
        None => Ok(None),
        Some(path_user) => match authenticated {
            None => Err(invalid_token_response(
                config,
                "user-scoped routes require authentication",
            )),
            Some(AuthenticatedUser(name)) if name == path_user => Ok(Some(name.clone())),
            Some(_) => Err(forbidden_response(
                "authenticated user does not match the route",
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut config = Config::default();
        config.public_base_url = Some("https://hub.example.com".into());
        config
    }

    fn header_of(response: &Response) -> String {
        response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn challenge_carries_rfc6750_fields() {
        let response = invalid_token_response(&config(), "a bearer key is required");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let challenge = header_of(&response);
        assert!(challenge.starts_with("Bearer error=\"invalid_token\""));
        assert!(challenge.contains(
            "resource_metadata=\"https://hub.example.com/.well-known/oauth-protected-resource\""
        ));
    }

    #[test]
    fn global_route_can_be_disabled() {
        let mut config = config();
        config.routing.enable_global_route = false;

        let err = validate_route_scope(&config, None, None, None).unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        // group routes stay open
        assert!(validate_route_scope(&config, None, Some("ops"), None).is_ok());
    }

    #[test]
    fn user_route_requires_matching_identity() {
        let config = config();

        // anonymous: 401 with a challenge
        let err = validate_route_scope(&config, Some("alice"), None, None).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        // wrong user: 403 forbidden
        let bob = AuthenticatedUser("bob".into());
        let err = validate_route_scope(&config, Some("alice"), None, Some(&bob)).unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        // exact match passes and scopes the session
        let alice = AuthenticatedUser("alice".into());
        let user = validate_route_scope(&config, Some("alice"), None, Some(&alice)).unwrap();
        assert_eq!(user.as_deref(), Some("alice"));
    }
}
