//! Authenticated client for the portal API.
//!
//! Every data call goes through [`ApiClient::send`], which attaches the
//! current credential and ends the session on a 401/403 before the caller
//! sees the response.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use reqwest::cookie::Jar;
use reqwest::{header, Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::ApiError;
use crate::auth::{AuthError, Credential, CredentialStore, Identity};
use crate::env::EnvironmentDescriptor;
use crate::models::{Dashboard, Invoice, UsageSummary};

// ============================================================================
// Constants
// ============================================================================

pub const LOGIN_PATH: &str = "/login";
pub const IDENTITY_PATH: &str = "/identity";
pub const USAGE_PATH: &str = "/proxy/remaining";
pub const INVOICES_PATH: &str = "/proxy/invoices";

/// HTTP request timeout in seconds.
/// 30s allows for slow billing backends while failing fast enough for good UX.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Error strings the direct API uses for a dead token on a 200 response
const TOKEN_ERROR_MESSAGES: &[&str] = &["Invalid token", "Token expired"];

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub success: bool,
    pub token: Option<String>,
    #[serde(alias = "user")]
    pub identity: Option<LoginIdentity>,
    pub message: Option<String>,
    pub error: Option<String>,
}

/// Identity as returned by the login endpoint, where every field may be
/// missing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginIdentity {
    pub username: Option<String>,
    pub email: Option<String>,
    #[serde(alias = "firstname")]
    pub first_name: Option<String>,
    #[serde(alias = "lastname")]
    pub last_name: Option<String>,
}

impl LoginResponse {
    /// Split into token and identity, or the server's reason for refusing.
    /// The username typed at login fills in for one the server left out.
    pub fn into_parts(self, username: &str) -> Result<(String, Identity), AuthError> {
        let token = self.token.filter(|t| !t.trim().is_empty());
        match (self.success, token, self.identity) {
            (true, Some(token), Some(user)) => {
                let identity = Identity {
                    username: user
                        .username
                        .filter(|u| !u.trim().is_empty())
                        .unwrap_or_else(|| username.to_string()),
                    email: user.email,
                    first_name: user.first_name,
                    last_name: user.last_name,
                };
                Ok((token, identity))
            }
            _ => Err(AuthError::LoginFailed(
                self.message
                    .or(self.error)
                    .unwrap_or_else(|| "invalid username or password".to_string()),
            )),
        }
    }
}

/// Data endpoints on the direct API wrap payloads as `{success, data}`; the
/// proxy returns them bare.
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

/// Request authenticator for the portal API.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    env: Arc<EnvironmentDescriptor>,
    store: Arc<CredentialStore>,
    initial_backoff: Duration,
}

impl ApiClient {
    pub fn new(client: Client, env: Arc<EnvironmentDescriptor>, store: Arc<CredentialStore>) -> Self {
        Self {
            client,
            env,
            store,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    /// Build the shared HTTP client. Credential cookies land in `jar`, which
    /// the credential store expires on clear.
    pub fn http_client(timeout: Duration, jar: Arc<Jar>) -> Result<Client, ApiError> {
        Ok(Client::builder()
            .timeout(timeout)
            .cookie_provider(jar)
            .build()?)
    }

    /// Override the first rate-limit backoff step
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn environment(&self) -> &Arc<EnvironmentDescriptor> {
        &self.env
    }

    /// Exchange username and password for a credential. Unauthenticated.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let url = self.env.endpoint(LOGIN_PATH)?;
        debug!(url = %url, username, "Sending login request");

        let response = self
            .client
            .post(url)
            .header(header::ACCEPT, "application/json")
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // A refused login still explains itself in the usual envelope
            if let Ok(parsed) = serde_json::from_str::<LoginResponse>(&body) {
                if status.is_client_error() {
                    return Ok(parsed);
                }
            }
            return Err(ApiError::from_status(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("login response: {}", e)))
    }

    /// Send an authenticated request.
    ///
    /// Fails closed without touching the network when there is no
    /// credential. On 401/403 the session is ended before this returns, so a
    /// caller redirecting to sign-in can never race a retry with the dead
    /// token.
    pub async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Response, ApiError> {
        self.send_as(method, path, body).await.map(|(response, _)| response)
    }

    /// [`Self::send`], also handing back the credential the request carried
    async fn send_as(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(Response, Arc<Credential>), ApiError> {
        let credential = self.store.current().await.ok_or(ApiError::NotAuthenticated)?;
        let url = self.env.endpoint(path)?;

        let mut request = self
            .client
            .request(method.clone(), url)
            .bearer_auth(credential.token())
            .header(header::ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(%method, path, status = status.as_u16(), "API response");

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(path, status = status.as_u16(), "Credential rejected");
            self.store
                .invalidate(credential.token(), AuthError::AuthRejected { status: status.as_u16() })
                .await;
        }
        Ok((response, credential))
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status() == StatusCode::TOO_MANY_REQUESTS {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, ApiError> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let (response, credential) = self.send_as(method.clone(), path, body).await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    let value: Value = response
                        .json()
                        .await
                        .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", path, e)))?;
                    return self.unwrap_payload(path, credential.token(), value).await;
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                    let wait = backoff + Duration::from_millis(jitter);
                    warn!(path, retry = retries, backoff_ms = wait.as_millis() as u64, "Rate limited, backing off");
                    tokio::time::sleep(wait).await;
                    backoff *= 2; // Exponential backoff
                }
            }
        }
    }

    /// Unwrap the payload, treating an in-band "invalid token" answer the
    /// same as a 401 for the `token` that was sent.
    async fn unwrap_payload<T: DeserializeOwned>(
        &self,
        path: &str,
        token: &str,
        value: Value,
    ) -> Result<T, ApiError> {
        let refused = value.get("success") == Some(&Value::Bool(false))
            || value.get("ok") == Some(&Value::Bool(false));
        if refused {
            let message = value.get("error").and_then(Value::as_str).unwrap_or_default();
            if TOKEN_ERROR_MESSAGES.contains(&message) {
                warn!(path, message, "Server rejected credential in response body");
                self.store
                    .invalidate(token, AuthError::AuthRejected { status: 401 })
                    .await;
                return Err(ApiError::Unauthorized);
            }
            return Err(ApiError::InvalidResponse(format!("{}: {}", path, message)));
        }

        serde_json::from_value::<Envelope<T>>(value)
            .map(|envelope| match envelope {
                Envelope::Wrapped { data } => data,
                Envelope::Bare(data) => data,
            })
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", path, e)))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request_json(Method::GET, path, None).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("request body: {}", e)))?;
        self.request_json(Method::POST, path, Some(&body)).await
    }

    // ===== Data Fetching Methods =====

    pub async fn fetch_identity(&self) -> Result<Identity, ApiError> {
        self.get(IDENTITY_PATH).await
    }

    pub async fn fetch_usage(&self) -> Result<UsageSummary, ApiError> {
        self.get(USAGE_PATH).await
    }

    pub async fn fetch_invoices(&self) -> Result<Vec<Invoice>, ApiError> {
        self.get(INVOICES_PATH).await
    }

    /// Fetch identity, usage and invoices concurrently.
    ///
    /// A non-auth failure in one part leaves a warning and an empty slot; an
    /// auth failure in any part fails the whole view.
    pub async fn dashboard(&self) -> Result<Dashboard, ApiError> {
        let (identity, usage, invoices) =
            tokio::join!(self.fetch_identity(), self.fetch_usage(), self.fetch_invoices());

        let auth_failed = [
            identity.as_ref().err(),
            usage.as_ref().err(),
            invoices.as_ref().err(),
        ]
        .into_iter()
        .flatten()
        .any(|e| e.is_auth_failure() || matches!(e, ApiError::NotAuthenticated));
        if auth_failed {
            warn!("Authentication failed while building dashboard");
            return Err(ApiError::Unauthorized);
        }

        let mut warnings = Vec::new();
        let identity = identity
            .map_err(|e| warnings.push(format!("identity: {}", e)))
            .ok();
        let usage = usage.map_err(|e| warnings.push(format!("usage: {}", e))).ok();
        let (invoices, invoices_failed) = match invoices {
            Ok(invoices) => (invoices, false),
            Err(e) => {
                warnings.push(format!("invoices: {}", e));
                (Vec::new(), true)
            }
        };

        if identity.is_none() && usage.is_none() && invoices_failed {
            return Err(ApiError::ServerError(warnings.join("; ")));
        }
        Ok(Dashboard::assemble(identity, usage, invoices, warnings, Utc::now()))
    }
}
