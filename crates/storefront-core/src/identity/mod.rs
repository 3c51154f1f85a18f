//! Identity provider adapter.
//!
//! The identity provider is an external service that asserts who the user
//! is (email/password, phone verification, federated sign-in). It keeps its
//! own session; this layer only asks it for the current identity and for a
//! short-lived assertion it can exchange for a backend token.

#[cfg(any(test, feature = "test-utils"))]
pub mod mocks;
pub mod rest;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

pub use rest::RestIdentityProvider;

/// Treat an assertion as stale this long before it actually expires.
const ASSERTION_REFRESH_BUFFER_MINUTES: i64 = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("No user currently signed in")]
    NoCurrentUser,

    #[error("Identity provider rejected the request: {0}")]
    Rejected(String),

    #[error("Identity provider unreachable: {0}")]
    Network(String),

    #[error("Invalid identity provider response: {0}")]
    InvalidResponse(String),
}

/// How the user proved their identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum LoginMethod {
    IdentityEmail,
    IdentityPhone,
    IdentityFederated,
}

/// The identity provider's view of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityUser {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Provider that authenticated the user (`password`, `phone`, `google.com`, ...)
    #[serde(default)]
    pub provider_id: Option<String>,
}

impl IdentityUser {
    pub fn login_method(&self) -> LoginMethod {
        match self.provider_id.as_deref() {
            Some("password") => LoginMethod::IdentityEmail,
            Some("phone") => LoginMethod::IdentityPhone,
            Some(_) => LoginMethod::IdentityFederated,
            None if self.email.is_some() => LoginMethod::IdentityEmail,
            None if self.phone.is_some() => LoginMethod::IdentityPhone,
            None => LoginMethod::IdentityFederated,
        }
    }
}

/// Short-lived proof of identity.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityAssertion {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl IdentityAssertion {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Still usable without a refresh round trip
    pub fn is_fresh(&self) -> bool {
        Utc::now() + Duration::minutes(ASSERTION_REFRESH_BUFFER_MINUTES) < self.expires_at
    }
}

impl fmt::Debug for IdentityAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityAssertion")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The signed-in user, if the provider holds a live session.
    async fn current_user(&self) -> Option<IdentityUser>;

    /// An identity assertion for the current user. `force_refresh` skips any
    /// cached assertion and asks the provider for a new one.
    async fn assertion(&self, force_refresh: bool) -> Result<IdentityAssertion, IdentityError>;

    async fn sign_out(&self) -> Result<(), IdentityError>;

    /// Follow sign-in and sign-out as they happen. The receiver starts at
    /// the provider's current user and wakes on every change after that.
    fn watch_user(&self) -> watch::Receiver<Option<IdentityUser>>;
}

/// Publish `user` to watchers if it differs from what they last saw.
pub(crate) fn publish_user(
    changes: &watch::Sender<Option<IdentityUser>>,
    user: Option<IdentityUser>,
) {
    changes.send_if_modified(|current| {
        if *current == user {
            false
        } else {
            *current = user;
            true
        }
    });
}
