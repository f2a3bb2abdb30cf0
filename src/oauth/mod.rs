//! Per-upstream OAuth 2.0 client
//!
//! Implements the authorization-code + PKCE flow against upstream MCP servers,
//! with RFC 9728 protected-resource discovery, RFC 8414 issuer metadata, and
//! RFC 7591 dynamic client registration. State is persisted through the
//! settings repository; the registry stays the single owner of upstream
//! runtime records and learns about auth transitions through `OAuthStateSink`.
//!
//! This is a server-side flow: "redirecting to authorization" means stamping
//! a `pendingAuthorization` on the upstream and failing the connect attempt,
//! so the initialization loop records `oauth_required`. A separate
//! administrative surface later delivers the authorization code to
//! `complete_authorization`.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use chrono::Utc;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use crate::model::{OAuthState, PendingAuthorization, UpstreamOAuthConfig};
use crate::storage::SettingsRepository;
use crate::{HubError, Result};

/// Which credential subset `invalidate_credentials` clears
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialScope {
    All,
    Client,
    Tokens,
    Verifier,
}

/// How the registry learns that an upstream now needs authorization.
///
/// The provider never touches upstream runtime records directly; passing this
/// sink in breaks the provider ↔ registry reference cycle.
pub trait OAuthStateSink: Send + Sync {
    fn on_authorization_required(&self, server: &str, pending: &PendingAuthorization);
}

/// RFC 9728 protected-resource metadata (the fields we consume)
#[derive(Debug, Deserialize)]
struct ResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
    #[serde(default)]
    scopes_supported: Option<Vec<String>>,
}

/// RFC 8414 authorization-server metadata (the fields we consume)
#[derive(Debug, Deserialize)]
struct IssuerMetadata {
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    registration_endpoint: Option<String>,
}

/// RFC 7591 registration response (the fields we consume)
#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    client_secret_expires_at: Option<i64>,
}

/// Extract the `resource` URL out of a `WWW-Authenticate: Bearer` challenge
pub fn parse_bearer_challenge(www_authenticate: &str) -> Option<String> {
    let rest = www_authenticate.trim().strip_prefix("Bearer")?;
    for part in rest.split(',') {
        let part = part.trim();
        if let Some(value) = part
            .strip_prefix("resource=")
            .or_else(|| part.strip_prefix("resource_metadata="))
        {
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}

/// Deterministically derived, collision-free state parameter:
/// base64url({server, nonce})
fn derive_state(server: &str) -> String {
    let nonce: u64 = rand::random();
    let payload = json!({ "server": server, "nonce": format!("{nonce:016x}") });
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string())
}

/// Per-upstream OAuth client
pub struct UpstreamOAuth {
    server: String,
    config: UpstreamOAuthConfig,
    settings: Arc<dyn SettingsRepository>,
    http: reqwest::Client,
    state: RwLock<OAuthState>,
}

impl UpstreamOAuth {
    /// Load (or initialize) the provider for one upstream, seeding the cache
    /// from the persisted state and filling gaps from the config block.
    pub async fn load(
        server: &str,
        config: UpstreamOAuthConfig,
        settings: Arc<dyn SettingsRepository>,
    ) -> Result<Self> {
        // redirects are disabled so an authorization code can never be
        // intercepted through a rogue Location
        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| HubError::config(format!("Failed to build HTTP client: {}", e)))?;

        let mut state = settings.get_oauth_state(server).await?.unwrap_or_default();
        if state.authorization_endpoint.is_none() {
            state.authorization_endpoint = config.authorization_endpoint.clone();
        }
        if state.token_endpoint.is_none() {
            state.token_endpoint = config.token_endpoint.clone();
        }

        Ok(Self {
            server: server.to_string(),
            config,
            settings,
            http,
            state: RwLock::new(state),
        })
    }

    /// Canonical callback: `{configuredBaseUrl}/oauth/callback`, else the
    /// first configured redirect URI, else the localhost default. Any
    /// `server=` query parameter is stripped.
    pub fn redirect_url(&self) -> String {
        let raw = if let Some(base) = &self.config.base_url {
            format!("{}/oauth/callback", base.trim_end_matches('/'))
        } else if let Some(first) = self
            .config
            .redirect_uris
            .as_ref()
            .and_then(|uris| uris.first())
        {
            first.clone()
        } else {
            "http://localhost:3000/oauth/callback".to_string()
        };

        match Url::parse(&raw) {
            Ok(mut url) => {
                let kept: Vec<(String, String)> = url
                    .query_pairs()
                    .filter(|(k, _)| k != "server")
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                url.set_query(None);
                if !kept.is_empty() {
                    let mut qp = url.query_pairs_mut();
                    for (k, v) in &kept {
                        qp.append_pair(k, v);
                    }
                }
                url.to_string()
            }
            Err(_) => raw,
        }
    }

    /// RFC 7591 client metadata for this upstream
    pub fn client_metadata(&self) -> Value {
        let auth_method = if self.config.client_secret.is_some() {
            "client_secret_post"
        } else {
            "none"
        };

        let mut metadata = json!({
            "client_name": format!("mcphub ({})", self.server),
            "redirect_uris": [self.redirect_url()],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": auth_method,
        });

        if let Some(extra) = &self.config.metadata
            && let (Some(obj), Some(extra_obj)) = (metadata.as_object_mut(), extra.as_object())
        {
            for (k, v) in extra_obj {
                obj.insert(k.clone(), v.clone());
            }
        }

        metadata
    }

    /// Cached client credentials, falling back to the configured ones
    pub fn client_information(&self) -> Option<(String, Option<String>)> {
        let state = self.state.read();
        if let Some(id) = &state.client_id {
            return Some((id.clone(), state.client_secret.clone()));
        }
        self.config
            .client_id
            .clone()
            .map(|id| (id, self.config.client_secret.clone()))
    }

    /// The cached token bundle
    pub fn tokens(&self) -> Option<(String, Option<String>)> {
        let state = self.state.read();
        state
            .access_token
            .clone()
            .map(|access| (access, state.refresh_token.clone()))
    }

    /// The pending authorization attempt, if any
    pub fn pending_authorization(&self) -> Option<PendingAuthorization> {
        self.state.read().pending_authorization.clone()
    }

    async fn persist(&self, state: &OAuthState) -> Result<()> {
        self.settings.put_oauth_state(&self.server, state).await
    }

    /// Persist registered (or statically configured) client credentials
    pub async fn save_client_information(
        &self,
        client_id: &str,
        client_secret: Option<&str>,
        expires_at: Option<i64>,
    ) -> Result<()> {
        let snapshot = {
            let mut state = self.state.write();
            state.client_id = Some(client_id.to_string());
            state.client_secret = client_secret.map(str::to_string);
            state.client_secret_expires_at = expires_at;
            state.clone()
        };
        self.persist(&snapshot).await
    }

    /// Persist a token bundle. Completing a token exchange is what resolves a
    /// pending authorization, so the pending block is cleared here and only
    /// here.
    pub async fn save_tokens(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in_secs: Option<u64>,
    ) -> Result<()> {
        let snapshot = {
            let mut state = self.state.write();
            state.access_token = Some(access_token.to_string());
            if let Some(refresh) = refresh_token {
                state.refresh_token = Some(refresh.to_string());
            }
            state.expires_at = expires_in_secs.map(|s| Utc::now().timestamp() + s as i64);
            state.pending_authorization = None;
            state.clone()
        };
        self.persist(&snapshot).await
    }

    /// Persist the PKCE verifier of an in-flight authorization
    pub async fn save_code_verifier(&self, verifier: &str) -> Result<()> {
        let snapshot = {
            let mut state = self.state.write();
            if let Some(pending) = state.pending_authorization.as_mut() {
                pending.code_verifier = Some(verifier.to_string());
            }
            state.clone()
        };
        self.persist(&snapshot).await
    }

    /// Clear a credential subset. Returns true when the upstream must go
    /// back through authorization (tokens or client were dropped).
    pub async fn invalidate_credentials(&self, scope: CredentialScope) -> Result<bool> {
        let (snapshot, needs_reauth) = {
            let mut state = self.state.write();
            let needs_reauth = match scope {
                CredentialScope::All => {
                    state.client_id = None;
                    state.client_secret = None;
                    state.client_secret_expires_at = None;
                    state.access_token = None;
                    state.refresh_token = None;
                    state.expires_at = None;
                    state.pending_authorization = None;
                    true
                }
                CredentialScope::Client => {
                    state.client_id = None;
                    state.client_secret = None;
                    state.client_secret_expires_at = None;
                    true
                }
                CredentialScope::Tokens => {
                    state.access_token = None;
                    state.refresh_token = None;
                    state.expires_at = None;
                    true
                }
                CredentialScope::Verifier => {
                    if let Some(pending) = state.pending_authorization.as_mut() {
                        pending.code_verifier = None;
                    }
                    false
                }
            };
            (state.clone(), needs_reauth)
        };
        self.persist(&snapshot).await?;
        Ok(needs_reauth)
    }

    // ------------------------------------------------------------------
    // Discovery & registration
    // ------------------------------------------------------------------

    /// Run the discovery chain off a 401 challenge: fetch the protected
    /// resource metadata, take the first authorization server as issuer, and
    /// pull its endpoints. Falls back to configured endpoints when there is
    /// no challenge to follow.
    pub async fn prepare_endpoints(&self, www_authenticate: Option<&str>) -> Result<()> {
        if self.state.read().token_endpoint.is_some()
            && self.state.read().authorization_endpoint.is_some()
        {
            return Ok(());
        }

        let resource_url = www_authenticate.and_then(parse_bearer_challenge);
        let Some(resource_url) = resource_url else {
            return Err(HubError::oauth(format!(
                "upstream '{}' needs authorization but no endpoints are configured and no challenge was presented",
                self.server
            )));
        };

        let resource: ResourceMetadata = self
            .http
            .get(&resource_url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| HubError::oauth(format!("resource metadata fetch failed: {}", e)))?
            .json()
            .await?;

        let issuer = resource.authorization_servers.first().ok_or_else(|| {
            HubError::oauth(format!(
                "resource metadata at {} lists no authorization servers",
                resource_url
            ))
        })?;

        let metadata_url = format!(
            "{}/.well-known/oauth-authorization-server",
            issuer.trim_end_matches('/')
        );
        let issuer_meta: IssuerMetadata = self
            .http
            .get(&metadata_url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| HubError::oauth(format!("issuer metadata fetch failed: {}", e)))?
            .json()
            .await?;

        let snapshot = {
            let mut state = self.state.write();
            state.authorization_endpoint = Some(issuer_meta.authorization_endpoint);
            state.token_endpoint = Some(issuer_meta.token_endpoint);
            state.registration_endpoint = issuer_meta.registration_endpoint;
            // lazily learned once; feeds the scope-selection priority
            if state.scopes.is_none() {
                state.scopes = resource.scopes_supported;
            }
            state.clone()
        };
        self.persist(&snapshot).await
    }

    /// Make sure a client exists, registering one dynamically when allowed.
    /// A cached client is reused until `client_secret_expires_at` passes.
    pub async fn ensure_client(&self) -> Result<(String, Option<String>)> {
        if let Some((id, secret)) = self.client_information() {
            let expired = self
                .state
                .read()
                .client_secret_expires_at
                .is_some_and(|t| t != 0 && t <= Utc::now().timestamp());
            if !expired {
                return Ok((id, secret));
            }
        }

        let wants_registration = self.config.dynamic_registration || self.config.client_id.is_none();
        if !wants_registration {
            return Err(HubError::oauth(format!(
                "upstream '{}' has no usable client credentials",
                self.server
            )));
        }

        let registration_endpoint =
            self.state.read().registration_endpoint.clone().ok_or_else(|| {
                HubError::oauth(format!(
                    "upstream '{}': issuer does not advertise a registration endpoint",
                    self.server
                ))
            })?;

        let response: RegistrationResponse = self
            .http
            .post(&registration_endpoint)
            .json(&self.client_metadata())
            .send()
            .await?
            .error_for_status()
            .map_err(|e| HubError::oauth(format!("dynamic registration failed: {}", e)))?
            .json()
            .await?;

        self.save_client_information(
            &response.client_id,
            response.client_secret.as_deref(),
            response.client_secret_expires_at,
        )
        .await?;

        tracing::info!(
            server = %self.server,
            client_id = %response.client_id,
            "registered OAuth client dynamically"
        );

        Ok((response.client_id, response.client_secret))
    }

    /// Scope selection priority: explicit metadata `scope` >
    /// auto-detected `scopes_supported` > configured scopes > "openid"
    pub fn selected_scopes(&self) -> Vec<String> {
        if let Some(scope) = self
            .config
            .metadata
            .as_ref()
            .and_then(|m| m.get("scope"))
            .and_then(Value::as_str)
        {
            return scope.split_whitespace().map(str::to_string).collect();
        }
        if let Some(detected) = &self.state.read().scopes {
            if !detected.is_empty() {
                return detected.clone();
            }
        }
        if let Some(configured) = &self.config.scopes {
            if !configured.is_empty() {
                return configured.clone();
            }
        }
        vec!["openid".to_string()]
    }

    fn oauth_client(
        &self,
        client_id: String,
        client_secret: Option<String>,
    ) -> Result<
        BasicClient<
            oauth2::EndpointSet,
            oauth2::EndpointNotSet,
            oauth2::EndpointNotSet,
            oauth2::EndpointNotSet,
            oauth2::EndpointSet,
        >,
    > {
        let state = self.state.read();
        let auth_url = state
            .authorization_endpoint
            .clone()
            .ok_or_else(|| HubError::oauth("authorization endpoint unknown"))?;
        let token_url = state
            .token_endpoint
            .clone()
            .ok_or_else(|| HubError::oauth("token endpoint unknown"))?;
        drop(state);

        let base = BasicClient::new(ClientId::new(client_id));
        let base = match client_secret {
            Some(secret) => base.set_client_secret(ClientSecret::new(secret)),
            None => base,
        };

        Ok(base
            .set_auth_uri(
                AuthUrl::new(auth_url)
                    .map_err(|e| HubError::oauth(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(token_url)
                    .map_err(|e| HubError::oauth(format!("Invalid token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(self.redirect_url())
                    .map_err(|e| HubError::oauth(format!("Invalid redirect URI: {}", e)))?,
            ))
    }

    /// Start the authorization-code flow: build the PKCE authorization URL,
    /// stamp `pendingAuthorization`, tell the sink, and hand back the error
    /// that fails the current connect attempt.
    pub async fn begin_authorization(&self, sink: &dyn OAuthStateSink) -> HubError {
        match self.begin_authorization_inner().await {
            Ok(pending) => {
                sink.on_authorization_required(&self.server, &pending);
                HubError::AuthorizationRequired {
                    server: self.server.clone(),
                    authorization_url: Some(pending.authorization_url),
                }
            }
            Err(e) => e,
        }
    }

    async fn begin_authorization_inner(&self) -> Result<PendingAuthorization> {
        let (client_id, client_secret) = self.ensure_client().await?;
        let client = self.oauth_client(client_id, client_secret)?;

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let state_param = derive_state(&self.server);

        let scopes = self.selected_scopes();
        let (auth_url, _) = client
            .authorize_url(|| CsrfToken::new(state_param.clone()))
            .add_scopes(scopes.into_iter().map(Scope::new))
            .set_pkce_challenge(pkce_challenge)
            .url();

        let pending = PendingAuthorization {
            authorization_url: auth_url.to_string(),
            state: state_param,
            code_verifier: Some(pkce_verifier.secret().clone()),
        };

        let snapshot = {
            let mut state = self.state.write();
            state.pending_authorization = Some(pending.clone());
            state.clone()
        };
        self.persist(&snapshot).await?;

        Ok(pending)
    }

    /// Deliver the authorization code (called from the administrative
    /// surface) and exchange it for tokens.
    pub async fn complete_authorization(&self, code: &str) -> Result<()> {
        let pending = self
            .pending_authorization()
            .ok_or_else(|| HubError::oauth(format!("no pending authorization for '{}'", self.server)))?;
        let verifier = pending
            .code_verifier
            .ok_or_else(|| HubError::oauth("pending authorization lost its code verifier"))?;

        let (client_id, client_secret) = self.ensure_client().await?;
        let client = self.oauth_client(client_id, client_secret)?;

        let token = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(verifier))
            .request_async(&self.http)
            .await
            .map_err(|e| HubError::oauth(format!("Token exchange failed: {}", e)))?;

        self.save_tokens(
            token.access_token().secret(),
            token.refresh_token().map(|t| t.secret().as_str()),
            token.expires_in().map(|d| d.as_secs()),
        )
        .await
    }

    fn needs_refresh(&self) -> bool {
        let state = self.state.read();
        match state.expires_at {
            // 5-minute buffer before expiry
            Some(expires_at) => Utc::now().timestamp() + 300 >= expires_at,
            None => false,
        }
    }

    /// Refresh the access token when it is (nearly) expired
    pub async fn refresh_if_needed(&self) -> Result<()> {
        if !self.needs_refresh() {
            return Ok(());
        }
        let Some(refresh) = self.state.read().refresh_token.clone() else {
            return Ok(());
        };

        let (client_id, client_secret) = self.ensure_client().await?;
        let client = self.oauth_client(client_id, client_secret)?;

        let token = client
            .exchange_refresh_token(&RefreshToken::new(refresh))
            .request_async(&self.http)
            .await
            .map_err(|e| HubError::oauth(format!("Token refresh failed: {}", e)))?;

        tracing::info!(server = %self.server, "refreshed OAuth access token");

        self.save_tokens(
            token.access_token().secret(),
            token.refresh_token().map(|t| t.secret().as_str()),
            token.expires_in().map(|d| d.as_secs()),
        )
        .await
    }

    /// Current bearer token for outbound requests, refreshing first if needed
    pub async fn bearer_token(&self) -> Result<Option<String>> {
        self.refresh_if_needed().await?;
        Ok(self.state.read().access_token.clone())
    }

    /// Extra request headers for this upstream's transport
    pub async fn auth_headers(&self) -> Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        if let Some(token) = self.bearer_token().await? {
            headers.insert("authorization".to_string(), format!("Bearer {}", token));
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod oauth_test {
    include!("oauth_test.rs");
}
