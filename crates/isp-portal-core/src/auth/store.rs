use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use reqwest::cookie::Jar;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{AuthError, AuthEvents, AuthFailure, Credential};
use crate::env::EnvironmentDescriptor;
use crate::storage::StorageBackend;

/// Key holding the bearer token
pub const TOKEN_KEY: &str = "auth_token";

/// Key holding the JSON identity blob
pub const IDENTITY_KEY: &str = "auth_user";

/// Key names written by earlier builds. Still removed on every clear so a
/// stale value can't come back after a partial clear.
pub const LEGACY_KEYS: &[&str] = &[
    "jwt_auth_token",
    "jwt_user_data",
    "jwt_token",
    "currentUser",
    "userSession",
    "user_data",
    "access_token",
    "bearer_token",
    "app_token",
    "session_token",
    "mobile_token",
    "replit_token",
    "api_token",
    "authData",
    "sessionData",
    "loginData",
    "userData",
];

/// Prefixes used by superseded storage schemes, swept where a backend can
/// enumerate its keys
pub const LEGACY_PREFIXES: &[&str] = &["auth_", "jwt_", "token_", "user_", "session_", "mobile_"];

/// Cookie names that have carried credentials
pub const CREDENTIAL_COOKIES: &[&str] = &[
    "auth_token",
    "jwt_token",
    "session_token",
    "user_session",
    "access_token",
    "bearer_token",
    "api_token",
];

const EXPIRED_COOKIE_ATTRS: &str = "Expires=Thu, 01 Jan 1970 00:00:00 GMT; Max-Age=0; Path=/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearOptions {
    /// Report success even when some backends failed to clear
    pub force: bool,
}

impl Default for ClearOptions {
    fn default() -> Self {
        Self { force: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub success: bool,
    /// One entry per failed removal, `backend: key: error`
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Written to this backend
    Durable { backend: &'static str },
    /// Every backend refused; the credential lives in memory until exit
    Volatile,
}

/// What [`CredentialStore::invalidate`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// This call ended the session; subscribers were notified
    Performed(ClearReport),
    /// Already signed out, nothing to do
    AlreadyCleared,
    /// A newer credential replaced the failing one; left alone
    Superseded,
}

enum CacheState {
    Unloaded,
    Absent,
    Present(Arc<Credential>),
    /// No backend would take it; lives only as long as the process
    Volatile(Arc<Credential>),
}

impl CacheState {
    fn credential(&self) -> Option<&Arc<Credential>> {
        match self {
            CacheState::Present(credential) | CacheState::Volatile(credential) => Some(credential),
            CacheState::Unloaded | CacheState::Absent => None,
        }
    }
}

/// Cookie jar shared with the HTTP client, plus the domains credential
/// cookies may have been set on.
struct CookieScope {
    jar: Arc<Jar>,
    origin: Url,
    related_domains: Vec<String>,
}

/// One logical save/load/clear surface over a ranked list of backends.
///
/// The in-memory cache is the source of truth once loaded. Every mutation
/// happens under the cache lock, so a clear and a save can never interleave.
pub struct CredentialStore {
    backends: Vec<Arc<dyn StorageBackend>>,
    session: Arc<dyn StorageBackend>,
    cookies: Option<CookieScope>,
    events: Arc<AuthEvents>,
    cache: Mutex<CacheState>,
}

impl CredentialStore {
    /// `backends` in priority order; `session` holds session-scoped flags.
    pub fn new(backends: Vec<Arc<dyn StorageBackend>>, session: Arc<dyn StorageBackend>) -> Self {
        Self {
            backends,
            session,
            cookies: None,
            events: Arc::new(AuthEvents::new()),
            cache: Mutex::new(CacheState::Unloaded),
        }
    }

    /// Expire credential cookies in `jar` on clear
    pub fn with_cookies(mut self, jar: Arc<Jar>, env: &EnvironmentDescriptor) -> Self {
        self.cookies = Some(CookieScope {
            jar,
            origin: env.origin.clone(),
            related_domains: env.related_domains.clone(),
        });
        self
    }

    pub fn events(&self) -> &Arc<AuthEvents> {
        &self.events
    }

    /// Session-scoped transient store (wiped by every clear)
    pub fn session_flags(&self) -> &Arc<dyn StorageBackend> {
        &self.session
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Persist `credential` to the first backend that takes both values.
    ///
    /// Backends are tried one after another, never in parallel. Whatever
    /// happens on disk, the in-memory session holds the new credential when
    /// this returns.
    pub async fn save(&self, credential: Credential) -> SaveOutcome {
        let mut cache = self.cache.lock().await;
        let credential = Arc::new(credential);

        let outcome = match serde_json::to_string(credential.identity()) {
            Ok(identity_blob) => self.write_first(credential.token(), &identity_blob).await,
            Err(e) => {
                error!(error = %e, "Failed to serialize identity");
                SaveOutcome::Volatile
            }
        };

        *cache = if outcome == SaveOutcome::Volatile {
            warn!("No storage backend accepted the credential, keeping it in memory only");
            CacheState::Volatile(credential)
        } else {
            CacheState::Present(credential)
        };
        outcome
    }

    async fn write_first(&self, token: &str, identity_blob: &str) -> SaveOutcome {
        for backend in &self.backends {
            let written = match backend.set(TOKEN_KEY, token).await {
                Ok(()) => backend.set(IDENTITY_KEY, identity_blob).await,
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => {
                    info!(backend = backend.name(), "Credential saved");
                    return SaveOutcome::Durable {
                        backend: backend.name(),
                    };
                }
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "Credential save failed, trying next backend");
                    // Don't leave a token behind without its identity
                    if let Err(e) = backend.remove(TOKEN_KEY).await {
                        debug!(backend = backend.name(), error = %e, "Rollback of partial save failed");
                    }
                }
            }
        }
        SaveOutcome::Volatile
    }

    /// Read the first decodable credential from the backends and make it
    /// the in-memory session. A memory-only credential is kept until the
    /// next clear; storage that refused it may still hold an older one.
    pub async fn load(&self) -> Option<Arc<Credential>> {
        let mut cache = self.cache.lock().await;
        self.reload(&mut cache).await
    }

    /// The in-memory credential, loading from storage on first use.
    pub async fn current(&self) -> Option<Arc<Credential>> {
        let mut cache = self.cache.lock().await;
        if let CacheState::Unloaded = *cache {
            return self.reload(&mut cache).await;
        }
        cache.credential().cloned()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.current().await.is_some()
    }

    async fn reload(&self, cache: &mut MutexGuard<'_, CacheState>) -> Option<Arc<Credential>> {
        if let CacheState::Volatile(credential) = &**cache {
            debug!("Keeping memory-only credential over stored state");
            return Some(credential.clone());
        }
        match self.read_first().await.map(Arc::new) {
            Some(credential) => {
                **cache = CacheState::Present(credential.clone());
                Some(credential)
            }
            None => {
                **cache = CacheState::Absent;
                None
            }
        }
    }

    async fn read_first(&self) -> Option<Credential> {
        for backend in &self.backends {
            let token = match backend.get(TOKEN_KEY).await {
                Ok(token) => token,
                Err(e) => {
                    debug!(backend = backend.name(), error = %e, "Backend unavailable for load");
                    continue;
                }
            };
            let identity = match backend.get(IDENTITY_KEY).await {
                Ok(identity) => identity,
                Err(e) => {
                    debug!(backend = backend.name(), error = %e, "Backend unavailable for load");
                    continue;
                }
            };
            if token.is_none() && identity.is_none() {
                continue;
            }
            match Credential::from_parts(token.as_deref(), identity.as_deref()) {
                Some(credential) => {
                    debug!(backend = backend.name(), "Credential loaded");
                    return Some(credential);
                }
                None => {
                    warn!(backend = backend.name(), "Stored credential is partial or malformed, ignoring");
                }
            }
        }
        None
    }

    /// Forced clear of every backend, legacy key, session flag and cookie.
    pub async fn clear(&self) -> ClearReport {
        self.clear_with(ClearOptions::default()).await
    }

    pub async fn clear_with(&self, options: ClearOptions) -> ClearReport {
        let mut cache = self.cache.lock().await;
        self.purge(&mut cache, options).await
    }

    /// End the session because `token` failed authentication.
    ///
    /// Only the caller that actually moves the session from signed-in to
    /// signed-out clears storage and notifies subscribers; concurrent
    /// failures for the same token find the session already gone.
    pub async fn invalidate(&self, token: &str, error: AuthError) -> Invalidation {
        let mut cache = self.cache.lock().await;
        let username = match cache.credential() {
            Some(current) if current.token() == token => Some(current.username().to_string()),
            Some(_) => {
                debug!("Auth failure for a superseded credential, ignoring");
                return Invalidation::Superseded;
            }
            None if matches!(*cache, CacheState::Absent) => return Invalidation::AlreadyCleared,
            None => None,
        };

        warn!(error = %error, "Ending session");
        let report = self.purge(&mut cache, ClearOptions::default()).await;
        drop(cache);

        self.events.emit(AuthFailure {
            error,
            username,
            at: Utc::now(),
        });
        Invalidation::Performed(report)
    }

    async fn purge(&self, cache: &mut MutexGuard<'_, CacheState>, options: ClearOptions) -> ClearReport {
        // The session is gone the moment a clear starts
        **cache = CacheState::Absent;

        let durable = self.backends.iter().map(|backend| purge_durable(backend.as_ref()));
        let (durable, session) = futures::join!(join_all(durable), purge_session(self.session.as_ref()));

        let mut errors: Vec<String> = durable.into_iter().flatten().collect();
        errors.extend(session);
        self.expire_cookies();

        let success = options.force || errors.is_empty();
        if errors.is_empty() {
            info!("Credential state cleared from all backends");
        } else {
            warn!(failures = errors.len(), force = options.force, "Credential clear finished with errors");
        }
        ClearReport { success, errors }
    }

    fn expire_cookies(&self) {
        let Some(scope) = &self.cookies else {
            return;
        };
        let Some(host) = scope.origin.host_str() else {
            return;
        };
        for name in CREDENTIAL_COOKIES {
            scope
                .jar
                .add_cookie_str(&format!("{}=; {}", name, EXPIRED_COOKIE_ATTRS), &scope.origin);
            scope.jar.add_cookie_str(
                &format!("{}=; {}; Domain=.{}", name, EXPIRED_COOKIE_ATTRS, host),
                &scope.origin,
            );
            for domain in &scope.related_domains {
                scope.jar.add_cookie_str(
                    &format!("{}=; {}; Domain=.{}", name, EXPIRED_COOKIE_ATTRS, domain),
                    &scope.origin,
                );
            }
        }
        debug!(host, "Expired credential cookies");
    }

    /// Credential-related keys still present anywhere, as `backend: key`
    pub async fn remaining_keys(&self) -> Vec<String> {
        let mut found = Vec::new();
        for backend in &self.backends {
            let mut keys: Vec<String> = known_keys().map(str::to_string).collect();
            if let Ok(listed) = backend.keys().await {
                keys.extend(listed.into_iter().filter(|k| is_credential_key(k)));
            }
            keys.sort();
            keys.dedup();
            for key in keys {
                if let Ok(Some(_)) = backend.get(&key).await {
                    found.push(format!("{}: {}", backend.name(), key));
                }
            }
        }
        found
    }
}

fn known_keys() -> impl Iterator<Item = &'static str> {
    [TOKEN_KEY, IDENTITY_KEY].into_iter().chain(LEGACY_KEYS.iter().copied())
}

fn is_credential_key(key: &str) -> bool {
    known_keys().any(|k| k == key) || LEGACY_PREFIXES.iter().any(|p| key.starts_with(p))
}

async fn purge_durable(backend: &dyn StorageBackend) -> Vec<String> {
    let mut errors = Vec::new();
    for key in known_keys() {
        if let Err(e) = backend.remove(key).await {
            errors.push(format!("{}: {}: {}", backend.name(), key, e));
        }
    }
    match backend.keys().await {
        Ok(keys) => {
            for key in keys.into_iter().filter(|k| is_credential_key(k)) {
                if let Err(e) = backend.remove(&key).await {
                    errors.push(format!("{}: {}: {}", backend.name(), key, e));
                } else {
                    debug!(backend = backend.name(), key = %key, "Removed legacy key");
                }
            }
        }
        Err(e) => errors.push(format!("{}: key scan: {}", backend.name(), e)),
    }
    errors
}

async fn purge_session(backend: &dyn StorageBackend) -> Vec<String> {
    let mut errors = Vec::new();
    match backend.keys().await {
        Ok(keys) => {
            for key in keys {
                if let Err(e) = backend.remove(&key).await {
                    errors.push(format!("{}: {}: {}", backend.name(), key, e));
                }
            }
        }
        Err(e) => errors.push(format!("{}: key scan: {}", backend.name(), e)),
    }
    errors
}
