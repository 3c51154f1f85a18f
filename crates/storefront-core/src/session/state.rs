//! Session model, the shared in-memory session cell, and the pure
//! reconciliation of the two login authorities.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::identity::LoginMethod;

/// Version of the persisted session record.
pub const SESSION_RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum AuthState {
    #[default]
    Uninitialized,
    Restoring,
    Authenticated,
    ReauthPending,
    LoggedOut,
}

impl AuthState {
    pub fn can_transition_to(self, next: AuthState) -> bool {
        use AuthState::*;
        matches!(
            (self, next),
            (Uninitialized, Restoring)
                | (Restoring, Authenticated | ReauthPending | LoggedOut)
                | (Authenticated, Authenticated | ReauthPending | LoggedOut)
                | (ReauthPending, Authenticated | LoggedOut)
                | (LoggedOut | Uninitialized, Authenticated | LoggedOut)
        )
    }

    /// Logged in from the app's point of view. A pending re-authentication
    /// still counts: the refresh either restores the session or logs out.
    pub fn is_authenticated(self) -> bool {
        matches!(self, AuthState::Authenticated | AuthState::ReauthPending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Session {
    pub auth_state: AuthState,
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub display_name: Option<String>,
    pub login_method: Option<LoginMethod>,
    pub session_start_time: Option<DateTime<Utc>>,
    pub last_activity_time: Option<DateTime<Utc>>,
}

impl Session {
    fn logged_out() -> Self {
        Self {
            auth_state: AuthState::LoggedOut,
            ..Self::default()
        }
    }

    /// Minutes since the session was created
    pub fn duration_minutes(&self) -> Option<i64> {
        self.session_start_time
            .map(|start| (Utc::now() - start).num_minutes())
    }

    pub fn minutes_since_activity(&self) -> Option<i64> {
        self.last_activity_time
            .map(|last| (Utc::now() - last).num_minutes())
    }
}

/// The session as mirrored to the credential store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub version: u32,
    pub authenticated: bool,
    pub session: Session,
}

impl SessionRecord {
    pub fn from_session(session: &Session) -> Self {
        Self {
            version: SESSION_RECORD_VERSION,
            authenticated: session.auth_state.is_authenticated(),
            session: session.clone(),
        }
    }
}

pub type SessionListener = Arc<dyn Fn(&Session) + Send + Sync>;

struct CellInner {
    session: Session,
    listeners: Vec<(u64, SessionListener)>,
    next_listener_id: u64,
}

/// The in-memory session, shared by the session manager and the token
/// refresh routine. Listeners are called after every state change, outside
/// the lock, with a snapshot of the new session.
#[derive(Clone)]
pub struct SessionCell {
    inner: Arc<Mutex<CellInner>>,
}

impl Default for SessionCell {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(inner: &Mutex<CellInner>) -> MutexGuard<'_, CellInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionCell {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CellInner {
                session: Session::default(),
                listeners: Vec::new(),
                next_listener_id: 0,
            })),
        }
    }

    pub fn snapshot(&self) -> Session {
        lock(&self.inner).session.clone()
    }

    pub fn state(&self) -> AuthState {
        lock(&self.inner).session.auth_state
    }

    /// Move to `next` if the state machine allows it, then notify.
    pub fn transition(&self, next: AuthState) -> bool {
        let snapshot = {
            let mut inner = lock(&self.inner);
            let current = inner.session.auth_state;
            if !current.can_transition_to(next) {
                warn!(from = ?current, to = ?next, "Ignoring invalid session transition");
                return false;
            }
            inner.session.auth_state = next;
            debug!(from = ?current, to = ?next, "Session transition");
            inner.session.clone()
        };
        self.notify(&snapshot);
        true
    }

    /// Replace the whole session (new login), then notify.
    pub fn replace(&self, session: Session) -> bool {
        let snapshot = {
            let mut inner = lock(&self.inner);
            let current = inner.session.auth_state;
            if !current.can_transition_to(session.auth_state) {
                warn!(from = ?current, to = ?session.auth_state, "Ignoring invalid session replacement");
                return false;
            }
            inner.session = session;
            inner.session.clone()
        };
        self.notify(&snapshot);
        true
    }

    /// Update session fields without changing the state. No notification.
    pub fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut Session),
    {
        let mut inner = lock(&self.inner);
        let state = inner.session.auth_state;
        change(&mut inner.session);
        inner.session.auth_state = state;
    }

    /// Reset to a blank logged-out session without notifying. Returns the
    /// previous state.
    pub(crate) fn clear(&self) -> AuthState {
        let mut inner = lock(&self.inner);
        let previous = inner.session.auth_state;
        inner.session = Session::logged_out();
        previous
    }

    pub fn subscribe(&self, listener: SessionListener) -> Subscription {
        let mut inner = lock(&self.inner);
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push((id, listener));
        Subscription {
            cell: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    pub(crate) fn notify_current(&self) {
        let snapshot = self.snapshot();
        self.notify(&snapshot);
    }

    fn notify(&self, snapshot: &Session) {
        let listeners: Vec<SessionListener> = lock(&self.inner)
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(snapshot))).is_err() {
                error!(state = ?snapshot.auth_state, "Session listener panicked");
            }
        }
    }
}

/// Handle returned by [`SessionCell::subscribe`].
pub struct Subscription {
    cell: Weak<Mutex<CellInner>>,
    id: u64,
}

impl Subscription {
    /// Stop receiving notifications.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.cell.upgrade() {
            lock(&inner).listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

/// What the backend said about the current token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendVerdict {
    /// The token was accepted (possibly after an inline refresh)
    Accepted,
    /// The token was rejected and could not be refreshed
    Rejected,
    /// No definitive answer: unreachable, timed out, overloaded, or not asked
    Inconclusive,
}

/// Both authorities' view of the login, as gathered by the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthorityView {
    /// The persisted session record says the user was logged in
    pub session_flag: bool,
    /// A backend token with its profile is stored
    pub backend_token: bool,
    /// The identity provider has a live session
    pub identity_session: bool,
    pub backend: BackendVerdict,
}

/// Decide the next state from the current one and both authorities.
///
/// Never yields `Authenticated` unless the session flag, the backend token
/// and the identity session are all present and the backend did not reject
/// the token. An inconclusive backend keeps an existing login.
pub fn reconcile(current: AuthState, view: &AuthorityView) -> AuthState {
    use AuthState::*;

    if matches!(current, Uninitialized | LoggedOut) {
        return current;
    }
    if !(view.session_flag && view.backend_token && view.identity_session) {
        return LoggedOut;
    }
    match (view.backend, current) {
        (BackendVerdict::Accepted, _) => Authenticated,
        (BackendVerdict::Rejected, _) => LoggedOut,
        (BackendVerdict::Inconclusive, Restoring) => Authenticated,
        (BackendVerdict::Inconclusive, state) => state,
    }
}
