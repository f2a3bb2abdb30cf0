use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::model::UpstreamOAuthConfig;
use crate::storage::{MemorySettingsRepository, SettingsRepository};

struct RecordingSink {
    calls: AtomicUsize,
}

impl OAuthStateSink for RecordingSink {
    fn on_authorization_required(&self, _server: &str, pending: &PendingAuthorization) {
        assert!(!pending.authorization_url.is_empty());
        assert!(pending.code_verifier.is_some());
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

fn settings() -> Arc<dyn SettingsRepository> {
    Arc::new(MemorySettingsRepository::new())
}

async fn provider_with(config: UpstreamOAuthConfig) -> UpstreamOAuth {
    UpstreamOAuth::load("github", config, settings())
        .await
        .unwrap()
}

#[tokio::test]
async fn redirect_url_prefers_base_url_and_strips_server_param() {
    let p = provider_with(UpstreamOAuthConfig {
        base_url: Some("https://hub.example.com".into()),
        ..Default::default()
    })
    .await;
    assert_eq!(p.redirect_url(), "https://hub.example.com/oauth/callback");

    let p = provider_with(UpstreamOAuthConfig {
        redirect_uris: Some(vec![
            "https://cb.example.com/oauth/callback?server=github&keep=1".into(),
        ]),
        ..Default::default()
    })
    .await;
    let url = p.redirect_url();
    assert!(!url.contains("server="));
    assert!(url.contains("keep=1"));

    let p = provider_with(UpstreamOAuthConfig::default()).await;
    assert_eq!(p.redirect_url(), "http://localhost:3000/oauth/callback");
}

#[tokio::test]
async fn client_metadata_auth_method_follows_secret() {
    let with_secret = provider_with(UpstreamOAuthConfig {
        client_secret: Some("s".into()),
        ..Default::default()
    })
    .await;
    assert_eq!(
        with_secret.client_metadata()["token_endpoint_auth_method"],
        "client_secret_post"
    );

    let without = provider_with(UpstreamOAuthConfig::default()).await;
    let metadata = without.client_metadata();
    assert_eq!(metadata["token_endpoint_auth_method"], "none");
    assert_eq!(metadata["grant_types"][1], "refresh_token");
    assert_eq!(metadata["response_types"][0], "code");
}

#[tokio::test]
async fn scope_priority_metadata_then_detected_then_configured() {
    // explicit metadata scope wins
    let p = provider_with(UpstreamOAuthConfig {
        scopes: Some(vec!["configured".into()]),
        metadata: Some(json!({"scope": "meta:a meta:b"})),
        ..Default::default()
    })
    .await;
    assert_eq!(p.selected_scopes(), vec!["meta:a", "meta:b"]);

    // configured scopes when nothing else is known
    let p = provider_with(UpstreamOAuthConfig {
        scopes: Some(vec!["configured".into()]),
        ..Default::default()
    })
    .await;
    assert_eq!(p.selected_scopes(), vec!["configured"]);

    // the literal default
    let p = provider_with(UpstreamOAuthConfig::default()).await;
    assert_eq!(p.selected_scopes(), vec!["openid"]);
}

#[test]
fn bearer_challenge_parsing() {
    assert_eq!(
        parse_bearer_challenge(r#"Bearer resource="https://api.example.com/.well-known/oauth-protected-resource""#),
        Some("https://api.example.com/.well-known/oauth-protected-resource".to_string())
    );
    assert_eq!(
        parse_bearer_challenge(r#"Bearer error="invalid_token", resource="https://r""#),
        Some("https://r".to_string())
    );
    assert_eq!(parse_bearer_challenge("Basic realm=x"), None);
    assert_eq!(parse_bearer_challenge("Bearer realm=x"), None);
}

#[tokio::test]
async fn begin_authorization_stamps_pending_and_notifies_sink() {
    let p = provider_with(UpstreamOAuthConfig {
        client_id: Some("static-client".into()),
        authorization_endpoint: Some("https://issuer.example.com/authorize".into()),
        token_endpoint: Some("https://issuer.example.com/token".into()),
        scopes: Some(vec!["mcp".into()]),
        ..Default::default()
    })
    .await;

    let sink = RecordingSink {
        calls: AtomicUsize::new(0),
    };
    let err = p.begin_authorization(&sink).await;

    assert!(matches!(err, HubError::AuthorizationRequired { .. }));
    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);

    let pending = p.pending_authorization().expect("pending stamped");
    assert!(pending.authorization_url.contains("code_challenge="));
    assert!(pending.authorization_url.contains("state="));
    assert!(pending.code_verifier.is_some());
}

#[tokio::test]
async fn save_tokens_clears_pending_authorization() {
    let p = provider_with(UpstreamOAuthConfig {
        client_id: Some("static-client".into()),
        authorization_endpoint: Some("https://issuer.example.com/authorize".into()),
        token_endpoint: Some("https://issuer.example.com/token".into()),
        ..Default::default()
    })
    .await;

    let sink = RecordingSink {
        calls: AtomicUsize::new(0),
    };
    let _ = p.begin_authorization(&sink).await;
    assert!(p.pending_authorization().is_some());

    p.save_tokens("access", Some("refresh"), Some(3600))
        .await
        .unwrap();
    assert!(p.pending_authorization().is_none());
    let (access, refresh) = p.tokens().unwrap();
    assert_eq!(access, "access");
    assert_eq!(refresh.as_deref(), Some("refresh"));
}

#[tokio::test]
async fn invalidate_credentials_scopes() {
    let p = provider_with(UpstreamOAuthConfig {
        client_id: Some("c".into()),
        ..Default::default()
    })
    .await;
    p.save_client_information("registered", Some("secret"), None)
        .await
        .unwrap();
    p.save_tokens("access", None, None).await.unwrap();

    assert!(p.invalidate_credentials(CredentialScope::Tokens).await.unwrap());
    assert!(p.tokens().is_none());
    // client survives a token-only invalidation
    assert!(p.client_information().is_some());

    assert!(!p.invalidate_credentials(CredentialScope::Verifier).await.unwrap());

    assert!(p.invalidate_credentials(CredentialScope::All).await.unwrap());
    // falls back to the configured client id once the registered one is gone
    assert_eq!(p.client_information().unwrap().0, "c");
}

#[tokio::test]
async fn discovery_follows_challenge_to_issuer_metadata() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-protected-resource"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resource": server.uri(),
            "authorization_servers": [server.uri()],
            "scopes_supported": ["mcp:read", "mcp:write"],
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-authorization-server"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": server.uri(),
            "authorization_endpoint": format!("{}/authorize", server.uri()),
            "token_endpoint": format!("{}/token", server.uri()),
            "registration_endpoint": format!("{}/register", server.uri()),
        })))
        .mount(&server)
        .await;

    let p = provider_with(UpstreamOAuthConfig::default()).await;
    let challenge = format!(
        r#"Bearer resource="{}/.well-known/oauth-protected-resource""#,
        server.uri()
    );
    p.prepare_endpoints(Some(&challenge)).await.unwrap();

    // detected scopes now win over the "openid" default
    assert_eq!(p.selected_scopes(), vec!["mcp:read", "mcp:write"]);
}

#[tokio::test]
async fn dynamic_registration_persists_client() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/register"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "client_id": "dyn-123",
            "client_secret": "dyn-secret",
            "client_secret_expires_at": 0,
        })))
        .mount(&server)
        .await;

    let repo = settings();

    // seed the registration endpoint as discovery would
    {
        let mut state = OAuthState::default();
        state.registration_endpoint = Some(format!("{}/register", server.uri()));
        repo.put_oauth_state("github", &state).await.unwrap();
    }

    let p = UpstreamOAuth::load(
        "github",
        UpstreamOAuthConfig {
            dynamic_registration: true,
            ..Default::default()
        },
        repo.clone(),
    )
    .await
    .unwrap();

    let (id, secret) = p.ensure_client().await.unwrap();
    assert_eq!(id, "dyn-123");
    assert_eq!(secret.as_deref(), Some("dyn-secret"));

    // idempotent: the cached client is reused, no second registration
    let (id2, _) = p.ensure_client().await.unwrap();
    assert_eq!(id2, "dyn-123");

    let persisted = repo.get_oauth_state("github").await.unwrap().unwrap();
    assert_eq!(persisted.client_id.as_deref(), Some("dyn-123"));
}
