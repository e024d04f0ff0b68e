use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::token::Claims;

/// Who the credential belongs to, as reported by the portal API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Identity {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, alias = "firstname", skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, alias = "lastname", skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: None,
            first_name: None,
            last_name: None,
        }
    }

    /// The key two identities are compared on
    pub fn primary_key(&self) -> &str {
        &self.username
    }

    /// Structural decode of a stored identity blob. Anything that isn't a
    /// JSON object with a non-blank username is treated as absent.
    pub fn decode(blob: &str) -> Option<Self> {
        let identity: Identity = serde_json::from_str(blob).ok()?;
        identity.is_complete().then_some(identity)
    }

    pub fn is_complete(&self) -> bool {
        !self.username.trim().is_empty()
    }

    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) if !last.is_empty() => format!("{} {}", first, last),
            (Some(first), _) if !first.is_empty() => first.clone(),
            _ => self.username.clone(),
        }
    }
}

/// A bearer token together with the identity it was issued for.
///
/// Never partially populated: the only ways to get one are a completed login
/// or a stored token/identity pair that both decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Credential {
    token: String,
    identity: Identity,
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(token: impl Into<String>, identity: Identity) -> Self {
        let token = token.into();
        let expires_at = Claims::decode(&token)
            .ok()
            .and_then(|claims| claims.expires_at());
        Self {
            token,
            identity,
            expires_at,
        }
    }

    /// Rebuild a credential from its two stored values, failing closed.
    pub fn from_parts(token: Option<&str>, identity_blob: Option<&str>) -> Option<Self> {
        let token = token?.trim();
        if token.is_empty() || token.chars().any(char::is_whitespace) {
            return None;
        }
        let identity = Identity::decode(identity_blob?)?;
        Some(Self::new(token, identity))
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn username(&self) -> &str {
        self.identity.primary_key()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}
