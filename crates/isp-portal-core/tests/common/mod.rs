#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use reqwest::cookie::Jar;
use wiremock::MockServer;

use isp_portal_core::api::ApiClient;
use isp_portal_core::auth::{CredentialStore, RetryPolicy, TokenValidator, IDENTITY_KEY, TOKEN_KEY};
use isp_portal_core::env::{EnvironmentDescriptor, RoutingPolicy, RuntimeContext};
use isp_portal_core::storage::{MemoryBackend, StorageBackend, StorageError};

/// Signed-looking token for `username` expiring `exp_offset_secs` from now
pub fn token_for(username: &str, exp_offset_secs: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = serde_json::json!({
        "username": username,
        "exp": Utc::now().timestamp() + exp_offset_secs,
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.c2lnbmF0dXJl", header, payload)
}

/// Native-shell environment whose direct API root is the mock server
pub fn env_for(server: &MockServer) -> Arc<EnvironmentDescriptor> {
    let policy = RoutingPolicy {
        direct_api_root: server.uri(),
        ..RoutingPolicy::default()
    };
    let ctx = RuntimeContext::from_origin("app://localhost").unwrap();
    Arc::new(EnvironmentDescriptor::detect(&ctx, &policy))
}

/// A store, validator and API client wired together against `server`
pub struct Harness {
    pub env: Arc<EnvironmentDescriptor>,
    pub primary: Arc<MemoryBackend>,
    pub session: Arc<MemoryBackend>,
    pub store: Arc<CredentialStore>,
    pub validator: Arc<TokenValidator>,
    pub api: ApiClient,
}

impl Harness {
    pub fn new(server: &MockServer) -> Self {
        Self::with_timeout(server, Duration::from_secs(5))
    }

    pub fn with_timeout(server: &MockServer, confirm_timeout: Duration) -> Self {
        let env = env_for(server);
        let primary = Arc::new(MemoryBackend::new("primary"));
        let session = Arc::new(MemoryBackend::session());
        let jar = Arc::new(Jar::default());
        let client = ApiClient::http_client(Duration::from_secs(5), jar.clone()).unwrap();

        let store = Arc::new(
            CredentialStore::new(vec![primary.clone()], session.clone()).with_cookies(jar, &env),
        );
        let validator = Arc::new(TokenValidator::new(
            client.clone(),
            env.clone(),
            store.clone(),
            confirm_timeout,
        ));
        let api = ApiClient::new(client, env.clone(), store.clone())
            .with_initial_backoff(Duration::from_millis(10));

        Self {
            env,
            primary,
            session,
            store,
            validator,
            api,
        }
    }

    pub fn retry_policy() -> RetryPolicy {
        RetryPolicy {
            max_indeterminate_runs: 3,
            initial_interval_secs: 0,
        }
    }
}

/// Backend that refuses every call
pub struct FailingBackend;

#[async_trait]
impl StorageBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::unavailable("failing", "backend offline"))
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::unavailable("failing", "backend offline"))
    }

    async fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::unavailable("failing", "backend offline"))
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Err(StorageError::unavailable("failing", "backend offline"))
    }
}

/// In-memory backend that counts writes and removals
pub struct CountingBackend {
    inner: MemoryBackend,
    pub sets: AtomicUsize,
    pub removes: AtomicUsize,
}

impl CountingBackend {
    pub fn new() -> Self {
        Self {
            inner: MemoryBackend::new("counting"),
            sets: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
        }
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(key).await
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.inner.keys().await
    }
}

/// Backend that still reads an older credential but refuses every write
pub struct ReadOnlyBackend {
    inner: MemoryBackend,
}

impl ReadOnlyBackend {
    pub async fn holding(token: &str, username: &str) -> Self {
        let inner = MemoryBackend::new("read-only");
        inner.set(TOKEN_KEY, token).await.unwrap();
        inner
            .set(IDENTITY_KEY, &serde_json::json!({ "username": username }).to_string())
            .await
            .unwrap();
        Self { inner }
    }
}

#[async_trait]
impl StorageBackend for ReadOnlyBackend {
    fn name(&self) -> &'static str {
        "read-only"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(key).await
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::unavailable("read-only", "volume is read-only"))
    }

    async fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::unavailable("read-only", "volume is read-only"))
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.inner.keys().await
    }
}
