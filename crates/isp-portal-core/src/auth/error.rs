use thiserror::Error;

use crate::storage::StorageError;

/// Authentication-level failures.
///
/// Storage trouble is a [`crate::storage::StorageError`] and is absorbed by
/// the credential store; only the variants here ever reach the UI layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Not signed in")]
    NotAuthenticated,

    #[error("Credential storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Credential could not be decoded: {0}")]
    Decode(String),

    #[error("Credential rejected by server (HTTP {status})")]
    AuthRejected { status: u16 },

    #[error("Could not confirm credential with server: {0}")]
    NetworkIndeterminate(String),

    #[error("Signed-in identity {local} does not match server identity {remote}")]
    IdentityConflict { local: String, remote: String },

    #[error("Login failed: {0}")]
    LoginFailed(String),
}

impl From<StorageError> for AuthError {
    fn from(e: StorageError) -> Self {
        AuthError::StorageUnavailable(e.to_string())
    }
}

impl AuthError {
    /// Whether this failure ends the session. Indeterminate errors never do.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthError::AuthRejected { .. } | AuthError::IdentityConflict { .. }
        )
    }
}
