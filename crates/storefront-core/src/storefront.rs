//! The service the app talks to.
//!
//! Wires the credential store, identity provider, request pipeline and
//! session manager together. Built explicitly and disposed explicitly:
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use storefront_core::{ClientConfig, Storefront};
//!
//! let storefront = Storefront::builder(ClientConfig::load()?).build()?;
//! storefront.initialize_session().await;
//! # storefront.dispose();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::config::{ClientConfig, CredentialBackend};
use crate::error::ApiError;
use crate::http::{ApiClient, ApiResponse, RequestDescriptor, RequestQueue};
use crate::identity::{IdentityProvider, IdentityUser, LoginMethod, RestIdentityProvider};
use crate::session::{
    AuthContext, AuthState, BackendSessionClient, Session, SessionError, SessionListener,
    SessionManager, Subscription,
};
use crate::store::{
    CredentialStore, CredentialVault, FileCredentialStore, KeyringCredentialStore,
};

pub struct StorefrontBuilder {
    config: ClientConfig,
    store: Option<Arc<dyn CredentialStore>>,
    identity: Option<Arc<dyn IdentityProvider>>,
    http: Option<Client>,
}

impl StorefrontBuilder {
    /// Use this store instead of the credential file.
    pub fn store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this identity provider instead of the REST adapter.
    pub fn identity_provider(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn http_client(mut self, http: Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn build(self) -> Result<Storefront> {
        let config = Arc::new(self.config);
        let http = match self.http {
            Some(http) => http,
            None => Client::builder()
                .timeout(config.request_timeout())
                .build()
                .context("Failed to build HTTP client")?,
        };

        let store: Arc<dyn CredentialStore> = match self.store {
            Some(store) => store,
            None => match config.credential_backend {
                CredentialBackend::File => Arc::new(FileCredentialStore::new(
                    config.credentials_path()?,
                )) as Arc<dyn CredentialStore>,
                CredentialBackend::Keyring => {
                    Arc::new(KeyringCredentialStore::new()) as Arc<dyn CredentialStore>
                }
            },
        };
        let vault = CredentialVault::new(store);

        let (identity, rest_identity) = match self.identity {
            Some(identity) => (identity, None),
            None => {
                let rest = Arc::new(RestIdentityProvider::new(
                    http.clone(),
                    config.identity.clone(),
                    vault.clone(),
                ));
                (rest.clone() as Arc<dyn IdentityProvider>, Some(rest))
            }
        };

        let queue = RequestQueue::new(config.max_requests_per_second, config.drain_retry_delay());
        let context = AuthContext::new(vault.clone(), identity.clone());
        let backend =
            BackendSessionClient::new(http.clone(), config.clone(), queue.clone(), context.clone());
        let api = ApiClient::new(
            http,
            config.clone(),
            queue.clone(),
            vault.clone(),
            Arc::new(backend.clone()),
        );
        let sessions = SessionManager::new(context, backend, api.clone());

        Ok(Storefront {
            config,
            vault,
            identity,
            rest_identity,
            queue,
            api,
            sessions,
        })
    }
}

pub struct Storefront {
    config: Arc<ClientConfig>,
    vault: CredentialVault,
    identity: Arc<dyn IdentityProvider>,
    rest_identity: Option<Arc<RestIdentityProvider>>,
    queue: RequestQueue,
    api: ApiClient,
    sessions: SessionManager,
}

impl Storefront {
    pub fn builder(config: ClientConfig) -> StorefrontBuilder {
        StorefrontBuilder {
            config,
            store: None,
            identity: None,
            http: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Restore the previous session. Safe to call more than once.
    pub async fn initialize_session(&self) -> AuthState {
        self.sessions.initialize().await
    }

    pub fn session_state(&self) -> Session {
        self.sessions.session()
    }

    pub fn is_authenticated(&self) -> bool {
        self.sessions.is_authenticated()
    }

    pub async fn is_session_valid(&self) -> bool {
        self.sessions.is_session_valid().await
    }

    pub async fn refresh_session(&self) -> AuthState {
        self.sessions.refresh_session().await
    }

    pub async fn create_session(
        &self,
        user: &IdentityUser,
        method: LoginMethod,
    ) -> Result<Session, SessionError> {
        self.sessions.create_session(user, method).await
    }

    pub async fn update_last_activity(&self) {
        self.sessions.update_last_activity().await
    }

    pub async fn logout(&self) {
        self.sessions.logout().await
    }

    /// Mint a backend token for the identity provider's current user if it
    /// lacks one.
    pub async fn sync_backend_auth(&self) -> bool {
        self.sessions.sync_backend_auth().await
    }

    pub async fn transfer_guest_data(&self) -> bool {
        self.sessions.transfer_guest_data().await
    }

    pub async fn request(&self, descriptor: RequestDescriptor) -> Result<ApiResponse, ApiError> {
        self.api.request(descriptor).await
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<T, ApiError> {
        self.api.request_json(descriptor).await
    }

    pub fn add_session_listener(&self, listener: SessionListener) -> Subscription {
        self.sessions.add_listener(listener)
    }

    pub async fn set_admin_token(&self, token: &str) -> Result<(), SessionError> {
        self.sessions.set_admin_token(token).await
    }

    pub fn identity(&self) -> Arc<dyn IdentityProvider> {
        Arc::clone(&self.identity)
    }

    /// Sign-in entry points of the REST identity adapter. `None` when a
    /// different identity provider was injected.
    pub fn sign_in(&self) -> Option<&RestIdentityProvider> {
        self.rest_identity.as_deref()
    }

    pub async fn guest_session_id(&self) -> Result<String> {
        self.vault.guest_session_id().await
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Stop accepting requests and stop following the identity provider.
    /// Requests already queued still complete.
    pub fn dispose(&self) {
        self.sessions.dispose();
        self.queue.dispose();
        info!("Storefront disposed");
    }
}
