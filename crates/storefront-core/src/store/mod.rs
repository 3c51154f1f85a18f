//! Persistent credential storage.
//!
//! This module provides:
//! - `CredentialStore`: async key→value storage that survives restarts
//! - `FileCredentialStore`: JSON file in the user's data directory
//! - `KeyringCredentialStore`: OS-level credential storage via keyring
//! - `MemoryCredentialStore`: process-local storage for tests and guests
//! - `CredentialVault`: typed access to the records the session layer keeps

pub mod file;
pub mod keychain;
pub mod memory;
pub mod vault;

use anyhow::Result;
use async_trait::async_trait;

pub use file::FileCredentialStore;
pub use keychain::KeyringCredentialStore;
pub use memory::MemoryCredentialStore;
pub use vault::{BackendToken, CredentialVault, UserProfile};

/// Durable key→value storage.
///
/// `set_many` and `remove_many` apply all entries together so a token is
/// never stored without the profile it was issued for.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_many(&self, entries: Vec<(String, String)>) -> Result<()>;

    async fn remove_many(&self, keys: &[&str]) -> Result<()>;

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.set_many(vec![(key.to_string(), value)]).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.remove_many(&[key]).await
    }
}
