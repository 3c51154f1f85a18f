//! Session lifecycle.
//!
//! This module provides:
//! - `SessionManager`: the login state machine exposed to the app
//! - `BackendSessionClient`: token mint, single-flight refresh, backend logout
//! - `AuthContext`: the shared state both of them mutate, and the cascade clear
//! - `reconcile`: the pure decision over the two login authorities

pub mod backend;
pub mod context;
pub mod manager;
pub mod state;

use thiserror::Error;

use crate::error::ApiError;
use crate::identity::IdentityError;

pub use backend::BackendSessionClient;
pub use context::AuthContext;
pub use manager::SessionManager;
pub use state::{
    reconcile, AuthState, AuthorityView, BackendVerdict, Session, SessionCell, SessionListener,
    SessionRecord, Subscription,
};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Backend rejected the sign-in: {0}")]
    MintRejected(String),

    #[error("Credential storage failed: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl SessionError {
    /// Failures worth another attempt: the network or the backend was
    /// briefly unavailable. Rejections are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Identity(IdentityError::Network(_)) => true,
            SessionError::Api(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Text suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::Identity(IdentityError::Rejected(_)) => {
                "Sign-in failed. Please check your details and try again.".to_string()
            }
            SessionError::Identity(IdentityError::NoCurrentUser) => {
                "Please sign in again.".to_string()
            }
            SessionError::Identity(_) => {
                "Network connection failed. Please check your internet connection.".to_string()
            }
            SessionError::Api(e) => e.user_message(),
            SessionError::MintRejected(message) => message.clone(),
            SessionError::Storage(_) => "Could not save your sign-in. Please try again.".to_string(),
        }
    }
}
