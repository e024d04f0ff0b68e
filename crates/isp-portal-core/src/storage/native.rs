use async_trait::async_trait;
use keyring::Entry;
use tracing::debug;

use super::{StorageBackend, StorageError};

/// Keychain service name credentials are filed under
const SERVICE_NAME: &str = "isp-portal";

const BACKEND_NAME: &str = "native-secure";

/// Secure native preferences store backed by the OS keychain.
///
/// Each logical key becomes its own keychain entry under a shared service
/// name. The keychain cannot enumerate entries, so prefix scans see nothing
/// here and clears rely on the explicit key lists.
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    /// Separate service name, useful to keep test runs off the real entries
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StorageError> {
        Entry::new(&self.service, key).map_err(map_keyring_error)
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Missing platform support is "unavailable", everything else stays a
/// keyring error so logs keep the platform detail.
fn map_keyring_error(e: keyring::Error) -> StorageError {
    match e {
        keyring::Error::NoStorageAccess(inner) => {
            StorageError::unavailable(BACKEND_NAME, inner.to_string())
        }
        keyring::Error::PlatformFailure(inner) => {
            StorageError::unavailable(BACKEND_NAME, inner.to_string())
        }
        other => StorageError::Keyring(other),
    }
}

#[async_trait]
impl StorageBackend for KeyringBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(map_keyring_error(e)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entry(key)?
            .set_password(value)
            .map_err(map_keyring_error)
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => {
                debug!(key, "No keychain entry to remove");
                Ok(())
            }
            Err(e) => Err(map_keyring_error(e)),
        }
    }
}
