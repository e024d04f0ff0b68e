use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend cannot be reached in this runtime (no keychain service,
    /// unwritable data directory, ...). Always non-fatal for callers.
    #[error("{backend} storage unavailable: {reason}")]
    Unavailable { backend: &'static str, reason: String },

    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt storage file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl StorageError {
    pub fn unavailable(backend: &'static str, reason: impl Into<String>) -> Self {
        StorageError::Unavailable {
            backend,
            reason: reason.into(),
        }
    }
}

/// Key/value persistence capability shared by every credential backend.
///
/// Backends are held as a ranked list by [`crate::auth::CredentialStore`];
/// fallback is a loop over that list, so any implementation (including test
/// fakes that fail on every call) can be slotted in.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short stable name used in logs and clear reports.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removing a key that does not exist is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Enumerate stored keys for prefix-based purging.
    ///
    /// Backends that cannot enumerate (the OS keychain) return an empty list;
    /// callers fall back to removing an explicit list of known names.
    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(Vec::new())
    }
}
