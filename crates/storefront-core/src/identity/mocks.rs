//! Mock identity provider for testing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use super::{publish_user, IdentityAssertion, IdentityError, IdentityProvider, IdentityUser};

#[derive(Debug, Default)]
struct MockState {
    user: Option<IdentityUser>,
    fail_assertions: bool,
    issued: u64,
}

/// Mock identity provider.
///
/// Holds an optional signed-in user in memory and counts calls so tests
/// can assert how often the provider was consulted.
#[derive(Debug)]
pub struct MockIdentityProvider {
    state: Mutex<MockState>,
    changes: watch::Sender<Option<IdentityUser>>,
    assertion_delay: Mutex<Option<Duration>>,
    assertion_calls: AtomicUsize,
    forced_refreshes: AtomicUsize,
    sign_outs: AtomicUsize,
}

impl Default for MockIdentityProvider {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            changes: watch::channel(None).0,
            assertion_delay: Mutex::default(),
            assertion_calls: AtomicUsize::new(0),
            forced_refreshes: AtomicUsize::new(0),
            sign_outs: AtomicUsize::new(0),
        }
    }
}

impl MockIdentityProvider {
    /// A provider with nobody signed in.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(user: IdentityUser) -> Self {
        let provider = Self::new();
        provider.set_user(Some(user));
        provider
    }

    /// A user with an email identity.
    pub fn user(uid: &str, email: &str) -> IdentityUser {
        IdentityUser {
            uid: uid.to_string(),
            email: Some(email.to_string()),
            phone: None,
            display_name: None,
            provider_id: Some("password".to_string()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sign a user in or out, as if it happened in the provider's own UI.
    /// Watchers are told about the change.
    pub fn set_user(&self, user: Option<IdentityUser>) {
        self.lock().user = user.clone();
        publish_user(&self.changes, user);
    }

    /// Make every assertion request fail as if the provider were unreachable.
    pub fn fail_assertions(&self, fail: bool) {
        self.lock().fail_assertions = fail;
    }

    /// Delay every assertion, to widen concurrency windows in tests.
    pub fn set_assertion_delay(&self, delay: Duration) {
        if let Ok(mut guard) = self.assertion_delay.lock() {
            *guard = Some(delay);
        }
    }

    pub fn assertion_calls(&self) -> usize {
        self.assertion_calls.load(Ordering::SeqCst)
    }

    pub fn forced_refreshes(&self) -> usize {
        self.forced_refreshes.load(Ordering::SeqCst)
    }

    pub fn sign_outs(&self) -> usize {
        self.sign_outs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn current_user(&self) -> Option<IdentityUser> {
        self.lock().user.clone()
    }

    async fn assertion(&self, force_refresh: bool) -> Result<IdentityAssertion, IdentityError> {
        self.assertion_calls.fetch_add(1, Ordering::SeqCst);
        if force_refresh {
            self.forced_refreshes.fetch_add(1, Ordering::SeqCst);
        }

        let delay = self.assertion_delay.lock().ok().and_then(|guard| *guard);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.fail_assertions {
            return Err(IdentityError::Network("mock provider offline".to_string()));
        }
        let uid = match state.user.as_ref() {
            Some(user) => user.uid.clone(),
            None => return Err(IdentityError::NoCurrentUser),
        };
        state.issued += 1;
        Ok(IdentityAssertion {
            token: format!("assertion-{}-{}", uid, state.issued),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        self.lock().user = None;
        publish_user(&self.changes, None);
        Ok(())
    }

    fn watch_user(&self) -> watch::Receiver<Option<IdentityUser>> {
        self.changes.subscribe()
    }
}
