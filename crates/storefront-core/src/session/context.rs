use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use super::state::{AuthState, SessionCell, SessionRecord, SESSION_RECORD_VERSION};
use crate::identity::IdentityProvider;
use crate::store::vault::SESSION_KEY;
use crate::store::CredentialVault;

/// Shared authentication state: the in-memory session, the credential
/// vault, and the identity provider.
#[derive(Clone)]
pub struct AuthContext {
    pub cell: SessionCell,
    pub vault: CredentialVault,
    pub identity: Arc<dyn IdentityProvider>,
    clears: Arc<AtomicU64>,
}

impl AuthContext {
    pub fn new(vault: CredentialVault, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            cell: SessionCell::new(),
            vault,
            identity,
            clears: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of cascade clears started so far. Work that began under an
    /// older value must not persist credentials.
    pub fn epoch(&self) -> u64 {
        self.clears.load(Ordering::SeqCst)
    }

    /// Whether a cascade clear has started since `epoch` was read.
    pub fn cleared_since(&self, epoch: u64) -> bool {
        self.epoch() != epoch
    }

    /// Clear every trace of the login: in-memory session, stored auth
    /// records, identity provider session. Listeners are notified last.
    ///
    /// Steps that fail are logged; the clear always completes.
    pub async fn cascade_clear(&self, reason: &str) {
        self.clears.fetch_add(1, Ordering::SeqCst);
        let previous = self.cell.clear();
        info!(reason, from = ?previous, "Clearing session");

        if let Err(e) = self.vault.clear_auth().await {
            warn!(error = %e, "Failed to clear stored credentials");
        }
        if let Err(e) = self.identity.sign_out().await {
            warn!(error = %e, "Identity provider sign-out failed");
        }

        self.cell.notify_current();
    }

    /// Mirror the in-memory session to the store.
    pub async fn save_record(&self) {
        let record = SessionRecord::from_session(&self.cell.snapshot());
        if let Err(e) = self.vault.store_json(SESSION_KEY, &record).await {
            warn!(error = %e, "Failed to persist session record");
        }
    }

    /// The stored session record, if present and of the current version.
    pub async fn load_record(&self) -> Option<SessionRecord> {
        match self.vault.load_json::<SessionRecord>(SESSION_KEY).await {
            Ok(Some(record)) if record.version == SESSION_RECORD_VERSION => Some(record),
            Ok(Some(record)) => {
                warn!(version = record.version, "Ignoring session record of unknown version");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read session record");
                None
            }
        }
    }

    pub fn state(&self) -> AuthState {
        self.cell.state()
    }
}
