use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{StorageBackend, StorageError};

/// Process-lifetime key/value store.
///
/// Used for session-scoped transient flags (lost when the process exits,
/// like a browser tab's session storage) and as a plain backend in tests.
pub struct MemoryBackend {
    name: &'static str,
    values: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            values: Mutex::new(HashMap::new()),
        }
    }

    /// Session-scoped store for transient flags
    pub fn session() -> Self {
        Self::new("session")
    }

    pub fn len(&self) -> usize {
        self.values.lock().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn values(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StorageError> {
        self.values
            .lock()
            .map_err(|_| StorageError::unavailable(self.name, "storage lock poisoned"))
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.values()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.values()?.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.values()?.keys().cloned().collect())
    }
}
