use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{AuthError, CredentialStore, Identity};
use crate::api::IDENTITY_PATH;
use crate::env::EnvironmentDescriptor;

/// Claims read out of a token's payload segment. Decoded without verifying
/// the signature; only the server can say whether the token is genuine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Claims {
    pub exp: Option<i64>,
    pub iat: Option<i64>,
    pub sub: Option<String>,
    pub username: Option<String>,
}

impl Claims {
    pub fn decode(token: &str) -> Result<Self, AuthError> {
        let segments: Vec<&str> = token.split('.').collect();
        let [_, payload, _] = segments.as_slice() else {
            return Err(AuthError::Decode(format!(
                "expected 3 token segments, found {}",
                segments.len()
            )));
        };
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| AuthError::Decode(format!("payload is not base64url: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AuthError::Decode(format!("payload is not a claims object: {}", e)))
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| Utc.timestamp_opt(exp, 0).single())
    }

    /// Username the token was issued for, if the issuer embedded one
    pub fn subject(&self) -> Option<&str> {
        self.username.as_deref().or(self.sub.as_deref())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.exp.map(|exp| exp <= now.timestamp()).unwrap_or(false)
    }
}

/// Outcome of asking the server about a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed(Identity),
    /// 401/403: the token is invalid and has been cleared
    Rejected { status: u16 },
    /// Couldn't tell. The credential is left exactly as it was.
    Indeterminate(String),
}

impl Confirmation {
    pub fn into_result(self) -> Result<Identity, AuthError> {
        match self {
            Confirmation::Confirmed(identity) => Ok(identity),
            Confirmation::Rejected { status } => Err(AuthError::AuthRejected { status }),
            Confirmation::Indeterminate(reason) => Err(AuthError::NetworkIndeterminate(reason)),
        }
    }
}

/// The identity endpoint answers bare on the proxy and wrapped on the
/// direct API.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdentityEnvelope {
    Wrapped { data: Identity },
    Bare(Identity),
}

impl IdentityEnvelope {
    fn into_identity(self) -> Identity {
        match self {
            IdentityEnvelope::Wrapped { data } => data,
            IdentityEnvelope::Bare(identity) => identity,
        }
    }
}

pub struct TokenValidator {
    client: Client,
    env: Arc<EnvironmentDescriptor>,
    store: Arc<CredentialStore>,
    timeout: Duration,
}

impl TokenValidator {
    pub fn new(
        client: Client,
        env: Arc<EnvironmentDescriptor>,
        store: Arc<CredentialStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            env,
            store,
            timeout,
        }
    }

    /// True only when the payload decodes and carries an expiry. Anything
    /// else means validity can't be judged locally.
    pub fn is_structurally_valid(token: &str) -> bool {
        match Claims::decode(token) {
            Ok(claims) => claims.exp.is_some(),
            Err(e) => {
                debug!(error = %e, "Token failed structural check");
                false
            }
        }
    }

    /// Tokens without an expiry are never locally expired; the server decides.
    pub fn is_locally_expired(claims: &Claims) -> bool {
        claims.is_expired_at(Utc::now())
    }

    /// One identity round trip under a bounded timeout.
    ///
    /// Only an explicit 401/403 clears the credential. Timeouts, transport
    /// errors, 5xx and malformed bodies are all indeterminate.
    pub async fn confirm_with_server(&self, token: &str) -> Confirmation {
        let url = match self.env.endpoint(IDENTITY_PATH) {
            Ok(url) => url,
            Err(e) => return Confirmation::Indeterminate(format!("invalid identity endpoint: {}", e)),
        };

        let request = self
            .client
            .get(url)
            .bearer_auth(token)
            .header(header::ACCEPT, "application/json")
            .timeout(self.timeout)
            .send();

        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(error = %e, "Identity check failed in transport, keeping credential");
                return Confirmation::Indeterminate(e.to_string());
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Identity check timed out, keeping credential");
                return Confirmation::Indeterminate("identity check timed out".to_string());
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            info!(status = status.as_u16(), "Server rejected credential");
            self.store
                .invalidate(token, AuthError::AuthRejected { status: status.as_u16() })
                .await;
            return Confirmation::Rejected { status: status.as_u16() };
        }
        if !status.is_success() {
            warn!(status = status.as_u16(), "Identity check returned non-auth error");
            return Confirmation::Indeterminate(format!("identity check returned HTTP {}", status));
        }

        let body = match tokio::time::timeout(self.timeout, response.json::<IdentityEnvelope>()).await {
            Ok(Ok(body)) => body.into_identity(),
            Ok(Err(e)) => {
                warn!(error = %e, "Identity payload has unexpected shape");
                return Confirmation::Indeterminate(format!("unexpected identity payload: {}", e));
            }
            Err(_) => return Confirmation::Indeterminate("identity body timed out".to_string()),
        };

        if !body.is_complete() {
            return Confirmation::Indeterminate("identity payload has no username".to_string());
        }
        debug!(username = %body.username, "Server confirmed credential");
        Confirmation::Confirmed(body)
    }
}
