//! Backend session calls: exchange an identity assertion for a backend
//! token, refresh that token after an authorization failure, and log out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::context::AuthContext;
use super::state::AuthState;
use super::SessionError;
use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::http::{DedupCache, RequestQueue, TokenRefresher};
use crate::identity::IdentityAssertion;
use crate::store::{BackendToken, UserProfile};

/// Login-by-assertion endpoint.
const MINT_PATH: &str = "api/auth/login/firebase";

const LOGOUT_PATH: &str = "api/auth/logout";

/// Single-flight key for the token refresh.
const REFRESH_KEY: &str = "backend-token-refresh";

#[derive(Debug, Deserialize)]
struct MintEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<MintData>,
}

#[derive(Debug, Deserialize)]
struct MintData {
    token: Option<String>,
    user: Option<Value>,
}

/// Client for the backend's session endpoints.
///
/// Clone is cheap; clones share the refresh single-flight and its counter.
#[derive(Clone)]
pub struct BackendSessionClient {
    http: Client,
    config: Arc<ClientConfig>,
    queue: RequestQueue,
    context: AuthContext,
    refresh: DedupCache<Option<BackendToken>>,
    refresh_runs: Arc<AtomicUsize>,
}

impl BackendSessionClient {
    pub fn new(
        http: Client,
        config: Arc<ClientConfig>,
        queue: RequestQueue,
        context: AuthContext,
    ) -> Self {
        Self {
            http,
            config,
            queue,
            context,
            refresh: DedupCache::new(),
            refresh_runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Exchange an identity assertion for a backend token.
    ///
    /// Nothing is persisted here; the caller decides what to do with the
    /// token.
    pub async fn mint_backend_token(
        &self,
        assertion: &IdentityAssertion,
    ) -> Result<BackendToken, SessionError> {
        let http = self.http.clone();
        let url = self.config.api_url(MINT_PATH);
        let body = json!({ "idToken": assertion.token });

        let (status, text) = self
            .queue
            .enqueue(move || async move {
                let response = http
                    .post(&url)
                    .header(header::ACCEPT, "application/json")
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| ApiError::from_transport(&e))?;
                let status = response.status();
                let text = response.text().await.map_err(|e| ApiError::from_transport(&e))?;
                Ok((status, text))
            })
            .await?;

        if !status.is_success() {
            let err = ApiError::from_status(status, &text);
            warn!(status = status.as_u16(), error = %err, "Backend token mint failed");
            return Err(match err {
                ApiError::Unauthorized | ApiError::AccessDenied(_) => {
                    SessionError::MintRejected(err.user_message())
                }
                other => SessionError::Api(other),
            });
        }

        let envelope: MintEnvelope = serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse login response: {}", e))
        })?;
        if !envelope.success {
            return Err(SessionError::MintRejected(
                envelope.message.unwrap_or_else(|| "Login failed".to_string()),
            ));
        }

        let data = envelope
            .data
            .ok_or_else(|| ApiError::InvalidResponse("Login response has no data".to_string()))?;
        let token = data
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::InvalidResponse("Login response has no token".to_string()))?;
        let profile = data
            .user
            .as_ref()
            .and_then(UserProfile::from_backend_user)
            .ok_or_else(|| ApiError::InvalidResponse("Login response has no user".to_string()))?;

        debug!(user_id = %profile.id, "Backend token minted");
        Ok(BackendToken { token, profile })
    }

    /// Tell the backend the token is no longer in use. Best-effort: failures
    /// are logged and never returned.
    pub async fn logout(&self, token: &str) {
        let http = self.http.clone();
        let url = self.config.api_url(LOGOUT_PATH);
        let token = token.to_string();

        let result = self
            .queue
            .enqueue(move || async move {
                let response = http
                    .post(&url)
                    .header(header::ACCEPT, "application/json")
                    .bearer_auth(token)
                    .send()
                    .await
                    .map_err(|e| ApiError::from_transport(&e))?;
                let status = response.status();
                if status.is_success() {
                    Ok(())
                } else {
                    let body = response.text().await.unwrap_or_default();
                    Err(ApiError::from_status(status, &body))
                }
            })
            .await;

        match result {
            Ok(()) => debug!("Backend logout acknowledged"),
            Err(e) => warn!(error = %e, "Backend logout failed, continuing"),
        }
    }

    /// Replace the backend token using a fresh identity assertion.
    ///
    /// Concurrent callers share one execution. On any failure the whole
    /// login is cleared and `None` is returned.
    pub async fn refresh_backend_token(&self) -> Option<BackendToken> {
        let client = self.clone();
        self.refresh
            .dedup(REFRESH_KEY, move || async move { Ok(client.run_refresh().await) })
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Token refresh did not complete");
                None
            })
    }

    /// Number of refresh executions (not callers) so far
    pub fn refresh_count(&self) -> usize {
        self.refresh_runs.load(Ordering::SeqCst)
    }

    async fn run_refresh(&self) -> Option<BackendToken> {
        self.refresh_runs.fetch_add(1, Ordering::SeqCst);
        let epoch = self.context.epoch();
        let cell = &self.context.cell;
        if matches!(cell.state(), AuthState::Authenticated | AuthState::Restoring) {
            cell.transition(AuthState::ReauthPending);
        }

        if self.context.identity.current_user().await.is_none() {
            warn!("No identity session, cannot refresh backend token");
            self.abandon(epoch, "identity session absent").await;
            return None;
        }

        let assertion = match self.context.identity.assertion(true).await {
            Ok(assertion) => assertion,
            Err(e) => {
                warn!(error = %e, "Identity assertion refresh failed");
                self.abandon(epoch, "identity assertion unavailable").await;
                return None;
            }
        };

        let token = match self.mint_backend_token(&assertion).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Backend token refresh failed");
                self.abandon(epoch, "backend token refresh failed").await;
                return None;
            }
        };

        if self.context.cleared_since(epoch) {
            info!("Session cleared while refreshing, discarding new token");
            return None;
        }
        if let Err(e) = self.context.vault.store_backend_token(&token).await {
            warn!(error = %e, "Failed to persist refreshed token");
            self.abandon(epoch, "refreshed token not persisted").await;
            return None;
        }
        if self.context.cleared_since(epoch) {
            // The clear may have run before the write landed
            info!("Session cleared while storing refreshed token, removing it");
            if let Err(e) = self.context.vault.clear_auth().await {
                warn!(error = %e, "Failed to remove refreshed token");
            }
            return None;
        }

        cell.update(|session| {
            if session.auth_state.is_authenticated() {
                session.email = session.email.take().or_else(|| token.profile.email.clone());
                session.phone = session.phone.take().or_else(|| token.profile.phone.clone());
                session.display_name = token
                    .profile
                    .display_name
                    .clone()
                    .or_else(|| session.display_name.take());
            }
        });
        if cell.state() == AuthState::ReauthPending {
            cell.transition(AuthState::Authenticated);
            self.context.save_record().await;
        }
        info!(user_id = %token.profile.id, "Backend token refreshed");
        Some(token)
    }
}

impl BackendSessionClient {
    /// Clear the login after a failed refresh, unless it was already
    /// cleared while the refresh ran.
    async fn abandon(&self, epoch: u64, reason: &str) {
        if self.context.cleared_since(epoch) {
            debug!(reason, "Session already cleared, nothing to undo");
            return;
        }
        self.context.cascade_clear(reason).await;
    }
}

#[async_trait]
impl TokenRefresher for BackendSessionClient {
    async fn refresh_backend_token(&self) -> Option<BackendToken> {
        BackendSessionClient::refresh_backend_token(self).await
    }
}
