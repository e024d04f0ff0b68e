use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::cookie::Jar;
use tracing::{info, warn};

use super::reconcile::{AuthReconciler, DiagnosticResult, ReconcileOutcome};
use super::store::{ClearReport, CredentialStore, SaveOutcome};
use super::token::{Claims, TokenValidator};
use super::{AuthError, AuthFailure, Credential, Identity};
use crate::api::{ApiClient, ApiError};
use crate::config::Config;
use crate::env::{EnvironmentDescriptor, EnvironmentRouter};
use crate::storage::{FileBackend, KeyringBackend, MemoryBackend, StorageBackend};

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub credential: Arc<Credential>,
    pub storage: SaveOutcome,
}

/// The surface the UI talks to.
///
/// Owns one credential store, one validator and one API client, all wired
/// to the same environment descriptor and cookie jar.
pub struct SessionManager {
    env: Arc<EnvironmentDescriptor>,
    store: Arc<CredentialStore>,
    validator: Arc<TokenValidator>,
    api: ApiClient,
    reconciler: AuthReconciler,
}

impl SessionManager {
    pub fn new(
        config: &Config,
        env: Arc<EnvironmentDescriptor>,
        backends: Vec<Arc<dyn StorageBackend>>,
        session: Arc<dyn StorageBackend>,
    ) -> Result<Self, ApiError> {
        let jar = Arc::new(Jar::default());
        let client = ApiClient::http_client(config.request_timeout(), jar.clone())?;

        let store = Arc::new(CredentialStore::new(backends, session).with_cookies(jar, &env));
        let validator = Arc::new(TokenValidator::new(
            client.clone(),
            env.clone(),
            store.clone(),
            config.confirm_timeout(),
        ));
        let api = ApiClient::new(client, env.clone(), store.clone());
        let reconciler =
            AuthReconciler::new(store.clone(), validator.clone(), env.clone(), config.reconcile);

        Ok(Self {
            env,
            store,
            validator,
            api,
            reconciler,
        })
    }

    /// Production wiring: native secure store first (with the
    /// `native-keychain` feature), then the origin-scoped file store, with an
    /// in-process session store for flags.
    pub fn from_config(config: &Config) -> Result<Self> {
        let router = EnvironmentRouter::new(config.runtime_context()?, config.routing.clone());
        let env = router.descriptor();

        let data_dir = config.data_dir()?;
        let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::new();
        if cfg!(feature = "native-keychain") {
            backends.push(Arc::new(KeyringBackend::new()));
        }
        backends.push(Arc::new(FileBackend::new(&data_dir, env.origin.as_str())));
        let session: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::session());

        Self::new(config, env, backends, session).context("Failed to create HTTP client")
    }

    /// Load the stored credential at startup. A token that has already
    /// expired is cleared quietly; there was no live session to end.
    pub async fn restore(&self) -> Option<Arc<Credential>> {
        let credential = self.store.load().await?;
        let expired = Claims::decode(credential.token())
            .map(|claims| TokenValidator::is_locally_expired(&claims))
            .unwrap_or(false);
        if expired {
            info!(username = %credential.username(), "Stored token has expired, clearing");
            self.store.clear().await;
            return None;
        }
        info!(username = %credential.username(), "Session restored");
        Some(credential)
    }

    pub async fn get_credential(&self) -> Option<Arc<Credential>> {
        self.store.current().await
    }

    pub async fn is_authenticated(&self) -> bool {
        self.store.is_authenticated().await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginOutcome, AuthError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::LoginFailed(
                "username and password are required".to_string(),
            ));
        }

        let response = self.api.login(username, password).await.map_err(|e| match e {
            ApiError::NetworkError(e) => AuthError::NetworkIndeterminate(e.to_string()),
            other => AuthError::LoginFailed(other.to_string()),
        })?;
        let (token, identity) = response.into_parts(username)?;

        // The existing session stays until the server hands out a new one.
        // Then drop whatever an earlier account left behind before writing.
        self.store.clear().await;
        let storage = self.store.save(Credential::new(token, identity)).await;
        if storage == SaveOutcome::Volatile {
            warn!("Signed in, but the credential will not survive a restart");
        }
        let credential = self
            .store
            .current()
            .await
            .ok_or(AuthError::NotAuthenticated)?;
        info!(username = %credential.username(), "Login successful");
        Ok(LoginOutcome {
            credential,
            storage,
        })
    }

    pub async fn logout(&self) -> ClearReport {
        info!("Logging out");
        self.store.clear().await
    }

    /// Called once per session-ending auth failure
    pub fn on_auth_failure(&self, callback: impl Fn(&AuthFailure) + Send + Sync + 'static) {
        self.store.events().subscribe(callback);
    }

    /// Ask the server whether the current credential is still good
    pub async fn verify(&self) -> Result<Identity, AuthError> {
        let credential = self
            .store
            .current()
            .await
            .ok_or(AuthError::NotAuthenticated)?;
        self.validator
            .confirm_with_server(credential.token())
            .await
            .into_result()
    }

    pub async fn reconcile(&self) -> ReconcileOutcome {
        self.reconciler.run().await
    }

    pub async fn diagnose(&self) -> DiagnosticResult {
        self.reconciler.diagnose().await
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn environment(&self) -> &Arc<EnvironmentDescriptor> {
        &self.env
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }
}
