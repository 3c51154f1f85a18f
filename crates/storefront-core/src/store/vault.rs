use std::fmt;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use anyhow::{Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::CredentialStore;

pub const AUTH_TOKEN_KEY: &str = "auth_token";
pub const USER_PROFILE_KEY: &str = "user_profile";
pub const SESSION_KEY: &str = "session";
pub const ADMIN_TOKEN_KEY: &str = "admin_token";
pub const GUEST_SESSION_KEY: &str = "guest_session_id";

/// Everything cleared on logout. The guest session id is deliberately not
/// here: it identifies the device's anonymous cart, not the user.
const AUTH_SCOPED_KEYS: [&str; 4] = [AUTH_TOKEN_KEY, USER_PROFILE_KEY, SESSION_KEY, ADMIN_TOKEN_KEY];

/// Current on-disk shape of the profile record.
/// Version 1 was the backend's raw user object, stored without an envelope.
const PROFILE_SCHEMA_VERSION: u32 = 2;

/// The user record a backend token was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl UserProfile {
    /// Build a profile from the backend's user object.
    ///
    /// The backend has returned `_id`, `uid` and `id` at different times, and
    /// `name` or `displayName` for the display name.
    pub fn from_backend_user(user: &Value) -> Option<Self> {
        let text = |keys: &[&str]| {
            keys.iter()
                .filter_map(|k| user.get(*k))
                .find_map(|v| match v {
                    Value::String(s) if !s.is_empty() => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
        };

        Some(Self {
            id: text(&["_id", "uid", "id"])?,
            email: text(&["email"]),
            phone: text(&["phone", "phoneNumber"]),
            display_name: text(&["name", "displayName"]),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ProfileEnvelope {
    version: u32,
    profile: UserProfile,
}

fn encode_profile(profile: &UserProfile) -> Result<String> {
    serde_json::to_string(&ProfileEnvelope {
        version: PROFILE_SCHEMA_VERSION,
        profile: profile.clone(),
    })
    .context("Failed to serialize user profile")
}

fn decode_profile(raw: &str) -> Option<UserProfile> {
    let value: Value = serde_json::from_str(raw).ok()?;
    match value.get("version").and_then(Value::as_u64) {
        Some(v) if v == u64::from(PROFILE_SCHEMA_VERSION) => {
            serde_json::from_value::<ProfileEnvelope>(value)
                .ok()
                .map(|envelope| envelope.profile)
        }
        Some(v) => {
            warn!(version = v, "Unknown profile schema version");
            None
        }
        None => {
            debug!("Migrating unversioned profile record");
            UserProfile::from_backend_user(&value)
        }
    }
}

/// An opaque bearer credential plus the profile it was issued for.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendToken {
    pub token: String,
    pub profile: UserProfile,
}

impl fmt::Debug for BackendToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendToken")
            .field("token", &"<redacted>")
            .field("profile", &self.profile)
            .finish()
    }
}

#[derive(Debug, Clone)]
enum CachedToken {
    Unknown,
    Loaded(Option<BackendToken>),
}

/// In-memory copy of the token record. `generation` moves on every write
/// or clear, so a load that started earlier cannot overwrite it.
#[derive(Debug)]
struct TokenCache {
    generation: u64,
    value: CachedToken,
}

/// Typed access to the credential records.
///
/// Keeps an in-memory copy of the current backend token so request
/// interception does not hit storage on every call; the copy is only
/// replaced after the store write succeeds.
#[derive(Clone)]
pub struct CredentialVault {
    store: Arc<dyn CredentialStore>,
    current: Arc<RwLock<TokenCache>>,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            current: Arc::new(RwLock::new(TokenCache {
                generation: 0,
                value: CachedToken::Unknown,
            })),
        }
    }

    fn cache(&self) -> RwLockWriteGuard<'_, TokenCache> {
        self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cached(&self) -> (u64, CachedToken) {
        let cache = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        (cache.generation, cache.value.clone())
    }

    fn set_cached(&self, value: Option<BackendToken>) {
        let mut cache = self.cache();
        cache.generation += 1;
        cache.value = CachedToken::Loaded(value);
    }

    /// Fill the cache from a load, unless a write or clear landed while the
    /// load was reading. Returns whatever the cache holds afterwards.
    fn fill_cached(&self, generation: u64, loaded: Option<BackendToken>) -> Option<BackendToken> {
        let mut cache = self.cache();
        if cache.generation == generation {
            cache.value = CachedToken::Loaded(loaded.clone());
            return loaded;
        }
        match &cache.value {
            CachedToken::Loaded(newer) => newer.clone(),
            CachedToken::Unknown => loaded,
        }
    }

    /// The current backend token, if one exists with a readable profile.
    /// A token without its profile is treated as absent.
    pub async fn backend_token(&self) -> Result<Option<BackendToken>> {
        let generation = match self.cached() {
            (_, CachedToken::Loaded(token)) => return Ok(token),
            (generation, CachedToken::Unknown) => generation,
        };

        let token = self.store.get(AUTH_TOKEN_KEY).await?;
        let profile = self.store.get(USER_PROFILE_KEY).await?;
        let loaded = match (token, profile) {
            (Some(token), Some(raw)) if !token.is_empty() => match decode_profile(&raw) {
                Some(profile) => Some(BackendToken { token, profile }),
                None => {
                    warn!("Stored token has an unreadable profile, treating as absent");
                    None
                }
            },
            (Some(_), None) => {
                warn!("Stored token has no profile, treating as absent");
                None
            }
            _ => None,
        };
        Ok(self.fill_cached(generation, loaded))
    }

    /// Bearer string for the current backend token
    pub async fn bearer(&self) -> Result<Option<String>> {
        Ok(self.backend_token().await?.map(|t| t.token))
    }

    /// Persist a freshly minted token and its profile together.
    pub async fn store_backend_token(&self, token: &BackendToken) -> Result<()> {
        self.store
            .set_many(vec![
                (AUTH_TOKEN_KEY.to_string(), token.token.clone()),
                (USER_PROFILE_KEY.to_string(), encode_profile(&token.profile)?),
            ])
            .await
            .context("Failed to persist backend token")?;
        self.set_cached(Some(token.clone()));
        debug!(user_id = %token.profile.id, "Backend token stored");
        Ok(())
    }

    pub async fn admin_token(&self) -> Result<Option<String>> {
        self.store.get(ADMIN_TOKEN_KEY).await
    }

    pub async fn store_admin_token(&self, token: &str) -> Result<()> {
        self.store.set(ADMIN_TOKEN_KEY, token.to_string()).await
    }

    /// Remove every auth-scoped record. The cached token is dropped first so
    /// no request picks it up while the store is being cleared.
    pub async fn clear_auth(&self) -> Result<()> {
        self.set_cached(None);
        self.store
            .remove_many(&AUTH_SCOPED_KEYS)
            .await
            .context("Failed to clear stored credentials")?;
        info!("Stored credentials cleared");
        Ok(())
    }

    pub async fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key).await? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse stored record {}", key))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn store_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)
            .with_context(|| format!("Failed to serialize record {}", key))?;
        self.store.set(key, raw).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.store.remove(key).await
    }

    /// Anonymous id used for guest carts and wishlists. Created on first use
    /// and kept across logouts.
    pub async fn guest_session_id(&self) -> Result<String> {
        if let Some(existing) = self.stored_guest_session_id().await? {
            return Ok(existing);
        }
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(9)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        let id = format!("guest_{}_{}", chrono::Utc::now().timestamp_millis(), suffix);
        self.store.set(GUEST_SESSION_KEY, id.clone()).await?;
        info!(guest_session_id = %id, "Generated new guest session id");
        Ok(id)
    }

    /// The guest session id if one was ever handed out. Never creates one.
    pub async fn stored_guest_session_id(&self) -> Result<Option<String>> {
        Ok(self.store.get(GUEST_SESSION_KEY).await?.filter(|id| !id.is_empty()))
    }

    /// Forget the guest session once its cart and wishlist belong to a user.
    pub async fn clear_guest_session(&self) -> Result<()> {
        self.store
            .remove(GUEST_SESSION_KEY)
            .await
            .context("Failed to clear guest session id")
    }
}
