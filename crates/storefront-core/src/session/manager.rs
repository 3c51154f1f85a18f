//! The login state machine exposed to the app.
//!
//! ```text
//! UNINITIALIZED ──initialize──▶ RESTORING ──▶ AUTHENTICATED ◀──▶ REAUTH_PENDING
//!                                   │               │                  │
//!                                   └──────────▶ LOGGED_OUT ◀──────────┘
//! ```
//!
//! Restoring checks the stored session flag, the stored backend token, the
//! identity provider's session and finally the backend itself. The backend
//! check goes through the request pipeline, so a rejected token is refreshed
//! inline before the verdict is taken.
//!
//! After restoring, the manager follows the identity provider: a user
//! signing in there gets a session here, and a user disappearing there has
//! their session validated and, if it no longer holds, cleared.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{watch, Mutex as AsyncMutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::BackendSessionClient;
use super::context::AuthContext;
use super::state::{
    reconcile, AuthState, AuthorityView, BackendVerdict, Session, SessionListener, Subscription,
};
use super::SessionError;
use crate::error::ApiError;
use crate::http::{ApiClient, RequestDescriptor};
use crate::identity::{IdentityError, IdentityUser, LoginMethod};
use crate::store::BackendToken;

/// Endpoint used to confirm the backend still accepts the token.
const PROFILE_PATH: &str = "api/profile";

const CART_TRANSFER_PATH: &str = "api/cart/transfer";
const WISHLIST_TRANSFER_PATH: &str = "api/wishlist/transfer";

/// Attempts `sync_backend_auth` makes before giving up.
const SYNC_ATTEMPTS: u32 = 3;

/// Wait before the second sync attempt; doubles after each failure.
const SYNC_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct SessionManager {
    context: AuthContext,
    backend: BackendSessionClient,
    api: ApiClient,
    restored: Arc<OnceCell<()>>,
    /// Serializes sign-ins so two mints for the same user cannot interleave
    login: Arc<AsyncMutex<()>>,
    watcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

fn new_session(user: &IdentityUser, method: LoginMethod, token: &BackendToken) -> Session {
    let now = Utc::now();
    Session {
        auth_state: AuthState::Authenticated,
        user_id: Some(user.uid.clone()),
        email: user.email.clone().or_else(|| token.profile.email.clone()),
        phone: user.phone.clone().or_else(|| token.profile.phone.clone()),
        display_name: user
            .display_name
            .clone()
            .or_else(|| token.profile.display_name.clone()),
        login_method: Some(method),
        session_start_time: Some(now),
        last_activity_time: Some(now),
    }
}

fn verdict_for(result: &Result<(), ApiError>) -> BackendVerdict {
    match result {
        Ok(()) => BackendVerdict::Accepted,
        Err(e) if e.is_auth_failure() => BackendVerdict::Rejected,
        Err(_) => BackendVerdict::Inconclusive,
    }
}

impl SessionManager {
    pub fn new(context: AuthContext, backend: BackendSessionClient, api: ApiClient) -> Self {
        Self {
            context,
            backend,
            api,
            restored: Arc::new(OnceCell::new()),
            login: Arc::new(AsyncMutex::new(())),
            watcher: Arc::new(Mutex::new(None)),
        }
    }

    /// Restore the session from storage, then start following the identity
    /// provider. Runs once; later calls wait for the first to finish and
    /// return the current state.
    pub async fn initialize(&self) -> AuthState {
        self.restored
            .get_or_init(|| async {
                // Subscribe first so changes made while restoring are not lost
                let changes = self.context.identity.watch_user();
                self.restore().await;
                self.watch_identity(changes);
            })
            .await;
        self.context.state()
    }

    fn watch_identity(&self, mut changes: watch::Receiver<Option<IdentityUser>>) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let user = changes.borrow_and_update().clone();
                manager.on_identity_changed(user).await;
            }
            debug!("Identity change feed closed");
        });

        let mut watcher = self.watcher.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = watcher.replace(handle) {
            previous.abort();
        }
    }

    /// React to a sign-in or sign-out reported by the identity provider.
    pub async fn on_identity_changed(&self, user: Option<IdentityUser>) {
        if matches!(self.state(), AuthState::Uninitialized | AuthState::Restoring) {
            debug!("Identity changed before restore finished, ignoring");
            return;
        }

        match user {
            Some(user) => self.adopt_identity(user).await,
            None if self.is_authenticated() => {
                info!("Identity provider signed out, validating session");
                if !self.is_session_valid().await {
                    debug!(state = ?self.state(), "Session did not survive identity sign-out");
                }
            }
            None => {}
        }
    }

    async fn adopt_identity(&self, user: IdentityUser) {
        let login = self.login.lock().await;
        let current = self.session();
        let same_user = current.user_id.as_deref() == Some(user.uid.as_str());
        if current.auth_state.is_authenticated() && same_user {
            drop(login);
            debug!(uid = %user.uid, "Session already exists for identity user");
            self.update_last_activity().await;
            if !self.has_backend_token().await {
                self.sync_backend_auth().await;
            }
            return;
        }

        info!(uid = %user.uid, "Identity provider signed in, creating session");
        let result = self.create_session_locked(&user, user.login_method()).await;
        drop(login);
        if let Err(e) = result {
            warn!(error = %e, uid = %user.uid, "No session for signed-in identity");
        }
    }

    async fn has_backend_token(&self) -> bool {
        self.context
            .vault
            .backend_token()
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read stored backend token");
                None
            })
            .is_some()
    }

    /// Stop following the identity provider.
    pub fn dispose(&self) {
        let mut watcher = self.watcher.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = watcher.take() {
            handle.abort();
        }
    }

    async fn restore(&self) {
        if !self.context.cell.transition(AuthState::Restoring) {
            debug!(state = ?self.context.state(), "Session already established, skipping restore");
            return;
        }

        let record = self.context.load_record().await;
        let token = self.context.vault.backend_token().await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read stored backend token");
            None
        });
        let identity_user = self.context.identity.current_user().await;

        let mut view = AuthorityView {
            session_flag: record.as_ref().is_some_and(|r| r.authenticated),
            backend_token: token.is_some(),
            identity_session: identity_user.is_some(),
            backend: BackendVerdict::Inconclusive,
        };
        debug!(
            session_flag = view.session_flag,
            backend_token = view.backend_token,
            identity_session = view.identity_session,
            "Restoring session"
        );

        if view.session_flag && view.backend_token && view.identity_session {
            if let Some(record) = record {
                self.context.cell.update(|session| {
                    *session = record.session;
                    session.last_activity_time = Some(Utc::now());
                });
            }
            view.backend = verdict_for(&self.check_backend().await);
        }

        match reconcile(self.context.state(), &view) {
            AuthState::LoggedOut => {
                if self.context.state() != AuthState::LoggedOut {
                    self.context.cascade_clear("session could not be restored").await;
                }
            }
            AuthState::Authenticated => {
                if self.context.state() != AuthState::Authenticated {
                    self.context.cell.transition(AuthState::Authenticated);
                }
                self.context.save_record().await;
                info!(
                    user_id = ?self.context.cell.snapshot().user_id,
                    offline = view.backend == BackendVerdict::Inconclusive,
                    "Session restored"
                );
            }
            other => debug!(state = ?other, "Restore left session unchanged"),
        }
    }

    async fn check_backend(&self) -> Result<(), ApiError> {
        self.api
            .request(RequestDescriptor::get(PROFILE_PATH).authenticated())
            .await
            .map(|_| ())
    }

    /// Snapshot of the current session
    pub fn session(&self) -> Session {
        self.context.cell.snapshot()
    }

    pub fn state(&self) -> AuthState {
        self.context.state()
    }

    /// Cached flag, no liveness check.
    pub fn is_authenticated(&self) -> bool {
        self.context.state().is_authenticated()
    }

    /// Confirm with both authorities that the session is still usable.
    ///
    /// Returns `true` only when the backend accepted the token (refreshing
    /// it if needed). A definitive rejection logs the user out; an
    /// unreachable backend returns `false` and leaves the session alone.
    pub async fn is_session_valid(&self) -> bool {
        if !self.is_authenticated() {
            return false;
        }

        let backend_token = self
            .context
            .vault
            .backend_token()
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read stored backend token");
                None
            })
            .is_some();
        let identity_session = self.context.identity.current_user().await.is_some();

        let mut view = AuthorityView {
            session_flag: true,
            backend_token,
            identity_session,
            backend: BackendVerdict::Inconclusive,
        };
        if backend_token && identity_session {
            let result = self.check_backend().await;
            if let Err(ref e) = result {
                debug!(error = %e, "Backend liveness check failed");
            }
            view.backend = verdict_for(&result);
        }

        let current = self.context.state();
        match reconcile(current, &view) {
            AuthState::LoggedOut => {
                if current != AuthState::LoggedOut {
                    self.context.cascade_clear("session no longer valid").await;
                }
                false
            }
            AuthState::Authenticated => view.backend == BackendVerdict::Accepted,
            _ => false,
        }
    }

    /// Sign the user in: mint a backend token for the identity provider's
    /// current assertion and persist the new session. The guest cart and
    /// wishlist are then moved to the user.
    ///
    /// `user` must be the identity provider's current user. On failure the
    /// login is cleared so the two authorities never disagree.
    pub async fn create_session(
        &self,
        user: &IdentityUser,
        method: LoginMethod,
    ) -> Result<Session, SessionError> {
        let _login = self.login.lock().await;
        let current = self.session();
        if current.auth_state == AuthState::Authenticated
            && current.user_id.as_deref() == Some(user.uid.as_str())
            && self.has_backend_token().await
        {
            // Already adopted from the identity provider's change feed
            debug!(uid = %user.uid, "Session already exists for user");
            return Ok(current);
        }
        self.create_session_locked(user, method).await
    }

    async fn create_session_locked(
        &self,
        user: &IdentityUser,
        method: LoginMethod,
    ) -> Result<Session, SessionError> {
        match self.establish(user, method).await {
            Ok(session) => {
                self.transfer_guest_data().await;
                Ok(session)
            }
            Err(e) => {
                warn!(error = %e, uid = %user.uid, "Session creation failed");
                self.context.cascade_clear("session creation failed").await;
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        user: &IdentityUser,
        method: LoginMethod,
    ) -> Result<Session, SessionError> {
        match self.context.identity.current_user().await {
            Some(current) if current.uid == user.uid => {}
            Some(current) => {
                warn!(requested = %user.uid, signed_in = %current.uid, "Identity user mismatch");
                return Err(SessionError::MintRejected(
                    "Signed-in account does not match, please sign in again".to_string(),
                ));
            }
            None => return Err(IdentityError::NoCurrentUser.into()),
        }

        let token = self.mint_and_store(false).await?;
        let session = new_session(user, method, &token);
        if !self.context.cell.replace(session.clone()) {
            // Only reachable while a restore is still running
            return Err(SessionError::MintRejected(
                "Session is being restored, try again".to_string(),
            ));
        }
        self.context.save_record().await;
        info!(uid = %user.uid, method = ?method, "Session created");
        Ok(session)
    }

    /// Mint and persist a backend token for the identity provider's current
    /// assertion. Nothing is persisted if the login is cleared meanwhile.
    async fn mint_and_store(&self, force_refresh: bool) -> Result<BackendToken, SessionError> {
        let epoch = self.context.epoch();
        let assertion = self.context.identity.assertion(force_refresh).await?;
        let token = self.backend.mint_backend_token(&assertion).await?;
        if self.context.cleared_since(epoch) {
            return Err(IdentityError::NoCurrentUser.into());
        }
        self.context.vault.store_backend_token(&token).await?;
        Ok(token)
    }

    /// Make sure the identity provider's current user also holds a backend
    /// token, minting one if needed. Transient failures are retried with
    /// backoff; nothing is cleared when it gives up.
    pub async fn sync_backend_auth(&self) -> bool {
        let _login = self.login.lock().await;
        let Some(user) = self.context.identity.current_user().await else {
            warn!("No identity user to sync");
            return false;
        };
        if self.has_backend_token().await {
            debug!("Backend already authenticated");
            return true;
        }

        let mut backoff = SYNC_INITIAL_BACKOFF;
        for attempt in 1..=SYNC_ATTEMPTS {
            match self.mint_and_store(true).await {
                Ok(token) => {
                    let current = self.session();
                    if current.auth_state.is_authenticated()
                        && current.user_id.as_deref() == Some(user.uid.as_str())
                    {
                        self.context
                            .cell
                            .update(|session| session.last_activity_time = Some(Utc::now()));
                    } else if !self
                        .context
                        .cell
                        .replace(new_session(&user, user.login_method(), &token))
                    {
                        warn!(state = ?self.state(), "Backend token stored but session not replaced");
                    }
                    self.context.save_record().await;
                    info!(uid = %user.uid, attempt, "Backend auth synchronized");
                    self.transfer_guest_data().await;
                    return true;
                }
                Err(e) if e.is_retryable() && attempt < SYNC_ATTEMPTS => {
                    warn!(error = %e, attempt, "Backend sync failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Backend sync failed");
                    return false;
                }
            }
        }
        false
    }

    /// Move the guest cart and wishlist to the signed-in user.
    ///
    /// Best-effort: failures are logged, and the guest session id is only
    /// forgotten once both transfers succeeded.
    pub async fn transfer_guest_data(&self) -> bool {
        let guest_id = match self.context.vault.stored_guest_session_id().await {
            Ok(Some(id)) => id,
            Ok(None) => return true,
            Err(e) => {
                warn!(error = %e, "Failed to read guest session id");
                return false;
            }
        };

        let body = json!({ "sessionId": &guest_id });
        let (cart, wishlist) = futures::join!(
            self.api.request(
                RequestDescriptor::post(CART_TRANSFER_PATH)
                    .json(body.clone())
                    .authenticated()
            ),
            self.api.request(
                RequestDescriptor::post(WISHLIST_TRANSFER_PATH)
                    .json(body)
                    .authenticated()
            ),
        );

        match (cart, wishlist) {
            (Ok(_), Ok(_)) => {
                if let Err(e) = self.context.vault.clear_guest_session().await {
                    warn!(error = %e, "Failed to clear guest session id");
                }
                info!(guest_session_id = %guest_id, "Guest cart and wishlist transferred");
                true
            }
            (cart, wishlist) => {
                warn!(
                    cart_error = ?cart.err(),
                    wishlist_error = ?wishlist.err(),
                    "Guest data transfer incomplete, keeping guest session"
                );
                false
            }
        }
    }

    pub async fn update_last_activity(&self) {
        if !self.is_authenticated() {
            return;
        }
        self.context
            .cell
            .update(|session| session.last_activity_time = Some(Utc::now()));
        self.context.save_record().await;
    }

    /// Clear the login locally without telling the backend.
    pub async fn clear_session(&self) {
        self.context.cascade_clear("session cleared").await;
    }

    /// Log out: notify the backend (best-effort), then clear everything.
    pub async fn logout(&self) {
        match self.context.vault.bearer().await {
            Ok(Some(token)) => self.backend.logout(&token).await,
            Ok(None) => debug!("No backend token to revoke"),
            Err(e) => warn!(error = %e, "Failed to read backend token for logout"),
        }
        self.context.cascade_clear("logout").await;
    }

    /// Re-validate when the app returns to the foreground.
    pub async fn refresh_session(&self) -> AuthState {
        if self.is_session_valid().await {
            self.update_last_activity().await;
        }
        self.context.state()
    }

    pub fn add_listener(&self, listener: SessionListener) -> Subscription {
        self.context.cell.subscribe(listener)
    }

    /// Store the token used for admin-scope requests.
    pub async fn set_admin_token(&self, token: &str) -> Result<(), SessionError> {
        self.context.vault.store_admin_token(token).await?;
        Ok(())
    }

    /// Number of backend token refresh executions so far
    pub fn refresh_count(&self) -> usize {
        self.backend.refresh_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::http::RequestQueue;
    use crate::identity::mocks::MockIdentityProvider;
    use crate::identity::IdentityProvider;
    use crate::store::vault::{AUTH_TOKEN_KEY, GUEST_SESSION_KEY};
    use crate::store::{CredentialStore, CredentialVault, MemoryCredentialStore};
    use reqwest::Client;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        manager: SessionManager,
        identity: Arc<MockIdentityProvider>,
        store: MemoryCredentialStore,
    }

    fn fixture(server: &MockServer, identity: MockIdentityProvider) -> Fixture {
        fixture_over(server, identity, MemoryCredentialStore::new())
    }

    /// A manager over an existing store, as after an app restart.
    fn fixture_over(
        server: &MockServer,
        identity: MockIdentityProvider,
        store: MemoryCredentialStore,
    ) -> Fixture {
        let config = Arc::new(ClientConfig {
            api_base_url: server.uri(),
            ..ClientConfig::default()
        });
        let vault = CredentialVault::new(Arc::new(store.clone()));
        let identity = Arc::new(identity);
        let context = AuthContext::new(vault.clone(), identity.clone());
        let queue = RequestQueue::new(config.max_requests_per_second, config.drain_retry_delay());
        let http = Client::new();
        let backend =
            BackendSessionClient::new(http.clone(), config.clone(), queue.clone(), context.clone());
        let api = ApiClient::new(http, config, queue, vault, Arc::new(backend.clone()));
        Fixture {
            manager: SessionManager::new(context, backend, api),
            identity,
            store,
        }
    }

    async fn mount_mint(server: &MockServer, token: &str) {
        Mock::given(method("POST"))
            .and(path("/api/auth/login/firebase"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "token": token, "user": { "_id": "u-1", "name": "Ada" } }
            })))
            .mount(server)
            .await;
    }

    fn ada() -> IdentityUser {
        MockIdentityProvider::user("uid-1", "ada@example.com")
    }

    /// Poll until the manager reaches `state`; identity changes are handled
    /// on a background task.
    async fn wait_for_state(manager: &SessionManager, state: AuthState) {
        for _ in 0..200 {
            if manager.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached {:?}, stuck in {:?}", state, manager.state());
    }

    async fn mount_transfer(server: &MockServer, endpoint: &str, guest_id: &str, status: u16) {
        Mock::given(method("POST"))
            .and(path(endpoint))
            .and(header("authorization", "Bearer jwt-1"))
            .and(body_json(json!({ "sessionId": guest_id })))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({ "success": true })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_fresh_install_initializes_logged_out() {
        let server = MockServer::start().await;
        let f = fixture(&server, MockIdentityProvider::new());
        assert_eq!(f.manager.initialize().await, AuthState::LoggedOut);
        assert!(!f.manager.is_authenticated());
        // Idempotent
        assert_eq!(f.manager.initialize().await, AuthState::LoggedOut);
    }

    #[tokio::test]
    async fn test_create_session_then_restore() {
        let server = MockServer::start().await;
        mount_mint(&server, "jwt-1").await;
        Mock::given(method("GET"))
            .and(path("/api/profile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "Ada"})))
            .mount(&server)
            .await;

        let identity = MockIdentityProvider::signed_in(ada());
        let f = fixture(&server, identity);
        f.manager.initialize().await;

        let session = f.manager.create_session(&ada(), LoginMethod::IdentityEmail).await.unwrap();
        assert_eq!(session.auth_state, AuthState::Authenticated);
        assert_eq!(session.user_id.as_deref(), Some("uid-1"));
        assert_eq!(session.display_name.as_deref(), Some("Ada"));
        assert!(f.manager.is_authenticated());

        // A new manager over the same store and identity restores the login
        let restarted = fixture_over(&server, MockIdentityProvider::signed_in(ada()), f.store.clone());
        assert_eq!(restarted.manager.initialize().await, AuthState::Authenticated);
        assert_eq!(
            restarted.manager.session().login_method,
            Some(LoginMethod::IdentityEmail)
        );
        assert_eq!(restarted.manager.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_create_session_failure_clears() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "message": "No account for this identity"
            })))
            .mount(&server)
            .await;

        let f = fixture(&server, MockIdentityProvider::signed_in(ada()));
        f.manager.initialize().await;
        let err = f.manager.create_session(&ada(), LoginMethod::IdentityEmail).await.unwrap_err();
        assert!(matches!(err, SessionError::MintRejected(_)));
        assert_eq!(f.manager.state(), AuthState::LoggedOut);
        assert!(f.identity.current_user().await.is_none());
    }

    #[tokio::test]
    async fn test_is_session_valid_when_logged_out_makes_no_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let f = fixture(&server, MockIdentityProvider::new());
        f.manager.initialize().await;
        assert!(!f.manager.is_session_valid().await);
    }

    #[tokio::test]
    async fn test_unreachable_backend_keeps_session() {
        let server = MockServer::start().await;
        mount_mint(&server, "jwt-1").await;
        Mock::given(method("GET"))
            .and(path("/api/profile"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let f = fixture(&server, MockIdentityProvider::signed_in(ada()));
        f.manager.initialize().await;
        f.manager.create_session(&ada(), LoginMethod::IdentityEmail).await.unwrap();

        assert!(!f.manager.is_session_valid().await);
        assert_eq!(f.manager.state(), AuthState::Authenticated);
        assert_eq!(f.manager.refresh_session().await, AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_identity_loss_logs_out_on_validation() {
        let server = MockServer::start().await;
        mount_mint(&server, "jwt-1").await;

        let f = fixture(&server, MockIdentityProvider::signed_in(ada()));
        f.manager.initialize().await;
        f.manager.create_session(&ada(), LoginMethod::IdentityPhone).await.unwrap();

        f.identity.set_user(None);
        assert!(!f.manager.is_session_valid().await);
        assert_eq!(f.manager.state(), AuthState::LoggedOut);
    }

    #[tokio::test]
    async fn test_update_last_activity_persists() {
        let server = MockServer::start().await;
        mount_mint(&server, "jwt-1").await;

        let f = fixture(&server, MockIdentityProvider::signed_in(ada()));
        f.manager.initialize().await;
        let created = f.manager.create_session(&ada(), LoginMethod::IdentityEmail).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        f.manager.update_last_activity().await;
        let after = f.manager.session();
        assert!(after.last_activity_time > created.last_activity_time);
        assert_eq!(after.session_start_time, created.session_start_time);
    }

    #[tokio::test]
    async fn test_create_session_rejects_other_identity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login/firebase"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let f = fixture(&server, MockIdentityProvider::signed_in(ada()));
        f.manager.initialize().await;
        let other = MockIdentityProvider::user("uid-2", "grace@example.com");
        let err = f.manager.create_session(&other, LoginMethod::IdentityEmail).await.unwrap_err();

        assert!(matches!(err, SessionError::MintRejected(_)));
        assert_eq!(f.manager.state(), AuthState::LoggedOut);
        assert!(!f.store.contains(AUTH_TOKEN_KEY));
    }

    #[tokio::test]
    async fn test_create_session_needs_identity_user() {
        let server = MockServer::start().await;
        let f = fixture(&server, MockIdentityProvider::new());
        f.manager.initialize().await;
        let err = f.manager.create_session(&ada(), LoginMethod::IdentityEmail).await.unwrap_err();
        assert!(matches!(err, SessionError::Identity(IdentityError::NoCurrentUser)));
    }

    #[tokio::test]
    async fn test_guest_data_moves_to_user_on_sign_in() {
        let server = MockServer::start().await;
        mount_mint(&server, "jwt-1").await;
        mount_transfer(&server, "/api/cart/transfer", "guest_1_abc", 200).await;
        mount_transfer(&server, "/api/wishlist/transfer", "guest_1_abc", 200).await;

        let f = fixture(&server, MockIdentityProvider::signed_in(ada()));
        f.store.set(GUEST_SESSION_KEY, "guest_1_abc".to_string()).await.unwrap();
        f.manager.create_session(&ada(), LoginMethod::IdentityEmail).await.unwrap();

        assert!(!f.store.contains(GUEST_SESSION_KEY));
    }

    #[tokio::test]
    async fn test_failed_guest_transfer_keeps_guest_id() {
        let server = MockServer::start().await;
        mount_mint(&server, "jwt-1").await;
        mount_transfer(&server, "/api/cart/transfer", "guest_1_abc", 500).await;
        mount_transfer(&server, "/api/wishlist/transfer", "guest_1_abc", 200).await;

        let f = fixture(&server, MockIdentityProvider::signed_in(ada()));
        f.store.set(GUEST_SESSION_KEY, "guest_1_abc".to_string()).await.unwrap();
        f.manager.create_session(&ada(), LoginMethod::IdentityEmail).await.unwrap();

        // The sign-in itself still succeeded
        assert!(f.manager.is_authenticated());
        assert_eq!(
            f.store.get(GUEST_SESSION_KEY).await.unwrap().as_deref(),
            Some("guest_1_abc")
        );
    }

    #[tokio::test]
    async fn test_identity_sign_in_creates_session() {
        let server = MockServer::start().await;
        mount_mint(&server, "jwt-1").await;

        let f = fixture(&server, MockIdentityProvider::new());
        assert_eq!(f.manager.initialize().await, AuthState::LoggedOut);

        f.identity.set_user(Some(ada()));
        wait_for_state(&f.manager, AuthState::Authenticated).await;
        assert_eq!(f.manager.session().user_id.as_deref(), Some("uid-1"));
        assert_eq!(f.manager.session().login_method, Some(LoginMethod::IdentityEmail));
        assert!(f.store.contains(AUTH_TOKEN_KEY));
        f.manager.dispose();
    }

    #[tokio::test]
    async fn test_explicit_sign_in_after_identity_change_mints_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login/firebase"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "token": "jwt-1", "user": { "_id": "u-1", "name": "Ada" } }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture(&server, MockIdentityProvider::new());
        f.manager.initialize().await;
        f.identity.set_user(Some(ada()));
        wait_for_state(&f.manager, AuthState::Authenticated).await;

        let session = f.manager.create_session(&ada(), LoginMethod::IdentityEmail).await.unwrap();
        assert_eq!(session.user_id.as_deref(), Some("uid-1"));
        f.manager.dispose();
    }

    #[tokio::test]
    async fn test_identity_sign_out_clears_session() {
        let server = MockServer::start().await;
        mount_mint(&server, "jwt-1").await;

        let f = fixture(&server, MockIdentityProvider::signed_in(ada()));
        f.manager.initialize().await;
        f.manager.create_session(&ada(), LoginMethod::IdentityEmail).await.unwrap();

        f.identity.set_user(None);
        wait_for_state(&f.manager, AuthState::LoggedOut).await;
        assert!(!f.store.contains(AUTH_TOKEN_KEY));
        f.manager.dispose();
    }

    #[tokio::test]
    async fn test_disposed_manager_ignores_identity_changes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let f = fixture(&server, MockIdentityProvider::new());
        f.manager.initialize().await;
        f.manager.dispose();

        f.identity.set_user(Some(ada()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.manager.state(), AuthState::LoggedOut);
    }

    #[tokio::test]
    async fn test_sync_backend_auth_mints_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login/firebase"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "token": "jwt-1", "user": { "_id": "u-1", "name": "Ada" } }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture(&server, MockIdentityProvider::signed_in(ada()));
        assert!(f.manager.sync_backend_auth().await);
        assert_eq!(f.manager.state(), AuthState::Authenticated);
        assert_eq!(f.manager.session().user_id.as_deref(), Some("uid-1"));
        assert_eq!(f.identity.forced_refreshes(), 1);

        // Already holding a token: nothing to do
        assert!(f.manager.sync_backend_auth().await);
    }

    #[tokio::test]
    async fn test_sync_backend_auth_retries_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login/firebase"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        mount_mint(&server, "jwt-1").await;

        let f = fixture(&server, MockIdentityProvider::signed_in(ada()));
        assert!(f.manager.sync_backend_auth().await);
        assert!(f.store.contains(AUTH_TOKEN_KEY));
    }

    #[tokio::test]
    async fn test_sync_backend_auth_gives_up_without_clearing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "message": "No account for this identity"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture(&server, MockIdentityProvider::signed_in(ada()));
        assert!(!f.manager.sync_backend_auth().await);
        // The identity session is left alone
        assert!(f.identity.current_user().await.is_some());
    }

    #[tokio::test]
    async fn test_sync_backend_auth_without_identity() {
        let server = MockServer::start().await;
        let f = fixture(&server, MockIdentityProvider::new());
        assert!(!f.manager.sync_backend_auth().await);
        assert_eq!(f.identity.assertion_calls(), 0);
    }

    #[tokio::test]
    async fn test_admin_token_is_stored() {
        let server = MockServer::start().await;
        let f = fixture(&server, MockIdentityProvider::new());
        f.manager.set_admin_token("admin-1").await.unwrap();
        assert!(f.store.contains(crate::store::vault::ADMIN_TOKEN_KEY));
    }
}
