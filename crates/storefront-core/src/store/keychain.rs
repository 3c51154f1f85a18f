use anyhow::{Context, Result};
use async_trait::async_trait;
use keyring::Entry;

use super::CredentialStore;

const SERVICE_NAME: &str = "storefront";

/// Credential store backed by the OS keychain.
///
/// Each key becomes one keychain entry under the service name.
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for KeyringCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve credential from keychain"),
        }
    }

    async fn set_many(&self, entries: Vec<(String, String)>) -> Result<()> {
        let mut written: Vec<String> = Vec::with_capacity(entries.len());
        for (key, value) in &entries {
            let result = self
                .entry(key)
                .and_then(|entry| {
                    entry
                        .set_password(value)
                        .context("Failed to store credential in keychain")
                });
            if let Err(e) = result {
                // Keychains have no transactions; undo what we wrote so far
                for done in &written {
                    if let Ok(entry) = self.entry(done) {
                        let _ = entry.delete_credential();
                    }
                }
                return Err(e);
            }
            written.push(key.clone());
        }
        Ok(())
    }

    async fn remove_many(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            match self.entry(key)?.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => return Err(e).context("Failed to delete credential from keychain"),
            }
        }
        Ok(())
    }
}
