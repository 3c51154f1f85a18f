//! Identity provider over the Identity Toolkit REST API.
//!
//! Sign-in goes through `accounts:signInWith*`; assertions (ID tokens) are
//! refreshed through the secure-token endpoint using the refresh credential.
//! The provider session (user + refresh credential) is persisted under its
//! own key so the user stays signed in across restarts, the same way the
//! provider's mobile SDK behaves. ID tokens are kept in memory only.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::{publish_user, IdentityAssertion, IdentityError, IdentityProvider, IdentityUser};
use crate::config::{join_url, IdentityConfig};
use crate::store::CredentialVault;

pub const IDENTITY_SESSION_KEY: &str = "identity_session";

/// Used when the provider omits `expiresIn`.
const DEFAULT_ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Refresh failures meaning the provider no longer has a user for us.
const SIGNED_OUT_CODES: [&str; 4] = [
    "TOKEN_EXPIRED",
    "USER_DISABLED",
    "USER_NOT_FOUND",
    "INVALID_REFRESH_TOKEN",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProviderSession {
    user: IdentityUser,
    refresh_token: String,
}

#[derive(Default)]
struct State {
    loaded: bool,
    session: Option<ProviderSession>,
    assertion: Option<IdentityAssertion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    local_id: String,
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone_number: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    provider_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerificationResponse {
    session_info: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

fn lifetime(expires_in: Option<&str>) -> Duration {
    let secs = expires_in
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(DEFAULT_ASSERTION_LIFETIME_SECS);
    Duration::seconds(secs)
}

/// The provider reports `CODE : detail`; only the code matters here.
fn error_code(message: &str) -> &str {
    message.split(':').next().unwrap_or(message).trim()
}

pub struct RestIdentityProvider {
    http: Client,
    config: IdentityConfig,
    vault: CredentialVault,
    state: Mutex<State>,
    changes: watch::Sender<Option<IdentityUser>>,
}

impl RestIdentityProvider {
    pub fn new(http: Client, config: IdentityConfig, vault: CredentialVault) -> Self {
        Self {
            http,
            config,
            vault,
            state: Mutex::new(State::default()),
            changes: watch::channel(None).0,
        }
    }

    async fn ensure_loaded(&self, state: &mut State) {
        if state.loaded {
            return;
        }
        state.loaded = true;
        match self.vault.load_json::<ProviderSession>(IDENTITY_SESSION_KEY).await {
            Ok(Some(session)) => {
                debug!(uid = %session.user.uid, "Identity session restored");
                publish_user(&self.changes, Some(session.user.clone()));
                state.session = Some(session);
            }
            Ok(None) => debug!("No stored identity session"),
            Err(e) => warn!(error = %e, "Failed to load identity session"),
        }
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T, IdentityError> {
        let response = self
            .http
            .post(url)
            .query(&[("key", self.config.api_key.as_str())])
            .json(body)
            .send()
            .await
            .map_err(|e| IdentityError::Network(e.to_string()))?;
        Self::parse(response).await
    }

    async fn parse<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, IdentityError> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| IdentityError::Network(e.to_string()))?;
        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| IdentityError::InvalidResponse(e.to_string()))
        } else {
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|env| env.error.message)
                .unwrap_or_else(|_| format!("Status {}", status));
            Err(IdentityError::Rejected(message))
        }
    }

    async fn establish(&self, response: SignInResponse) -> Result<IdentityUser, IdentityError> {
        let user = IdentityUser {
            uid: response.local_id,
            email: response.email,
            phone: response.phone_number,
            display_name: response.display_name,
            provider_id: response.provider_id,
        };
        let session = ProviderSession {
            user: user.clone(),
            refresh_token: response.refresh_token,
        };
        if let Err(e) = self.vault.store_json(IDENTITY_SESSION_KEY, &session).await {
            warn!(error = %e, "Failed to persist identity session");
        }

        let mut state = self.state.lock().await;
        state.loaded = true;
        state.session = Some(session);
        state.assertion = Some(IdentityAssertion {
            token: response.id_token,
            expires_at: Utc::now() + lifetime(response.expires_in.as_deref()),
        });
        drop(state);
        publish_user(&self.changes, Some(user.clone()));
        info!(uid = %user.uid, "Signed in with identity provider");
        Ok(user)
    }

    /// Sign in with email and password.
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<IdentityUser, IdentityError> {
        let url = join_url(&self.config.auth_base_url, "accounts:signInWithPassword");
        let body = json!({ "email": email, "password": password, "returnSecureToken": true });
        let mut response: SignInResponse = self.post_json(&url, &body).await?;
        response.provider_id.get_or_insert_with(|| "password".to_string());
        self.establish(response).await
    }

    /// Send a verification code by SMS. Returns the session info to pass to
    /// [`sign_in_with_phone`](Self::sign_in_with_phone).
    pub async fn start_phone_verification(
        &self,
        phone_number: &str,
        recaptcha_token: &str,
    ) -> Result<String, IdentityError> {
        let url = join_url(&self.config.auth_base_url, "accounts:sendVerificationCode");
        let body = json!({ "phoneNumber": phone_number, "recaptchaToken": recaptcha_token });
        let response: VerificationResponse = self.post_json(&url, &body).await?;
        Ok(response.session_info)
    }

    pub async fn sign_in_with_phone(
        &self,
        session_info: &str,
        code: &str,
    ) -> Result<IdentityUser, IdentityError> {
        let url = join_url(&self.config.auth_base_url, "accounts:signInWithPhoneNumber");
        let body = json!({ "sessionInfo": session_info, "code": code });
        let mut response: SignInResponse = self.post_json(&url, &body).await?;
        response.provider_id.get_or_insert_with(|| "phone".to_string());
        self.establish(response).await
    }

    /// Sign in with an ID token from a federated provider (`google.com`, `apple.com`).
    pub async fn sign_in_with_idp(
        &self,
        provider_id: &str,
        id_token: &str,
    ) -> Result<IdentityUser, IdentityError> {
        let url = join_url(&self.config.auth_base_url, "accounts:signInWithIdp");
        let body = json!({
            "postBody": format!("id_token={}&providerId={}", id_token, provider_id),
            "requestUri": "http://localhost",
            "returnSecureToken": true,
            "returnIdpCredential": true,
        });
        let mut response: SignInResponse = self.post_json(&url, &body).await?;
        response.provider_id.get_or_insert_with(|| provider_id.to_string());
        self.establish(response).await
    }

    async fn drop_session(&self, state: &mut State) {
        state.session = None;
        state.assertion = None;
        if let Err(e) = self.vault.remove(IDENTITY_SESSION_KEY).await {
            warn!(error = %e, "Failed to remove identity session");
        }
        publish_user(&self.changes, None);
    }
}

#[async_trait]
impl IdentityProvider for RestIdentityProvider {
    async fn current_user(&self) -> Option<IdentityUser> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        state.session.as_ref().map(|s| s.user.clone())
    }

    async fn assertion(&self, force_refresh: bool) -> Result<IdentityAssertion, IdentityError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;

        let refresh_token = match state.session.as_ref() {
            Some(session) => session.refresh_token.clone(),
            None => return Err(IdentityError::NoCurrentUser),
        };

        if !force_refresh {
            if let Some(assertion) = state.assertion.as_ref().filter(|a| a.is_fresh()) {
                return Ok(assertion.clone());
            }
        }

        debug!(force_refresh, "Refreshing identity assertion");
        let url = join_url(&self.config.token_base_url, "token");
        let result = self
            .http
            .post(&url)
            .query(&[("key", self.config.api_key.as_str())])
            .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token.as_str())])
            .send()
            .await
            .map_err(|e| IdentityError::Network(e.to_string()));

        let parsed = match result {
            Ok(response) => Self::parse::<RefreshResponse>(response).await,
            Err(e) => Err(e),
        };

        match parsed {
            Ok(refreshed) => {
                let assertion = IdentityAssertion {
                    token: refreshed.id_token,
                    expires_at: Utc::now() + lifetime(refreshed.expires_in.as_deref()),
                };
                if let Some(session) = state.session.as_mut() {
                    if session.refresh_token != refreshed.refresh_token {
                        session.refresh_token = refreshed.refresh_token;
                        if let Err(e) = self.vault.store_json(IDENTITY_SESSION_KEY, &*session).await {
                            warn!(error = %e, "Failed to persist rotated refresh credential");
                        }
                    }
                }
                state.assertion = Some(assertion.clone());
                Ok(assertion)
            }
            Err(IdentityError::Rejected(message))
                if SIGNED_OUT_CODES.contains(&error_code(&message)) =>
            {
                warn!(reason = %message, "Identity session revoked by provider");
                self.drop_session(&mut state).await;
                Err(IdentityError::NoCurrentUser)
            }
            Err(e) => Err(e),
        }
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        let mut state = self.state.lock().await;
        state.loaded = true;
        self.drop_session(&mut state).await;
        info!("Signed out of identity provider");
        Ok(())
    }

    fn watch_user(&self) -> watch::Receiver<Option<IdentityUser>> {
        self.changes.subscribe()
    }
}
