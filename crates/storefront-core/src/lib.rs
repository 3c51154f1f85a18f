//! Storefront core library.
//!
//! Authenticated request orchestration and session lifecycle for the
//! storefront client. Screens use this crate through [`Storefront`]:
//!
//! - [`http`]: rate-limited, deduplicating request pipeline with 401/429 recovery
//! - [`session`]: login state machine over the identity provider and backend token
//! - [`identity`]: identity provider adapter
//! - [`store`]: persistent credential storage

pub mod config;
pub mod error;
pub mod http;
pub mod identity;
pub mod session;
pub mod store;
pub mod storefront;

pub use config::{ClientConfig, CredentialBackend, IdentityConfig};
pub use error::ApiError;
pub use http::{ApiResponse, RequestDescriptor};
pub use identity::{IdentityProvider, IdentityUser, LoginMethod};
pub use session::{AuthState, Session, SessionError, Subscription};
pub use storefront::{Storefront, StorefrontBuilder};
