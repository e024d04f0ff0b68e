use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{StorageBackend, StorageError};

const BACKEND_NAME: &str = "web-origin";

/// Subdirectory of the data dir holding one file per origin
const ORIGINS_DIR: &str = "origins";

/// Durable origin-scoped store: the portal's equivalent of browser local
/// storage. Every origin gets its own JSON map on disk, so a session saved
/// while talking to one deployment never leaks into another.
pub struct FileBackend {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file
    lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(data_dir: &Path, origin: &str) -> Self {
        let path = data_dir
            .join(ORIGINS_DIR)
            .join(format!("{}.json", sanitize_origin(origin)));
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>, StorageError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(map)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }

    fn with_map<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> (T, bool),
    ) -> Result<T, StorageError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StorageError::unavailable(BACKEND_NAME, "storage lock poisoned"))?;
        let mut map = self.read_map()?;
        let (result, dirty) = f(&mut map);
        if dirty {
            self.write_map(&map)?;
        }
        Ok(result)
    }
}

/// Turn `https://portal.example.com:8443` into a safe file stem
fn sanitize_origin(origin: &str) -> String {
    let trimmed = origin
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    let stem: String = trimmed
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "default".to_string()
    } else {
        stem
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.with_map(|map| (map.get(key).cloned(), false))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.with_map(|map| {
            map.insert(key.to_string(), value.to_string());
            ((), true)
        })
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let removed = self.with_map(|map| {
            let removed = map.remove(key).is_some();
            (removed, removed)
        });
        match removed {
            Ok(true) => {
                debug!(key, "Removed key from origin storage");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(StorageError::Corrupt(e)) => {
                // An unparseable file can't hold a usable credential; drop it
                warn!(error = %e, path = %self.path.display(), "Discarding corrupt origin storage file");
                std::fs::remove_file(&self.path)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.with_map(|map| (map.keys().cloned().collect(), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_origin() {
        assert_eq!(sanitize_origin("https://saidawifi.com"), "saidawifi.com");
        assert_eq!(sanitize_origin("http://localhost:5000/"), "localhost_5000");
        assert_eq!(sanitize_origin(""), "default");
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), "https://saidawifi.com");

        assert_eq!(backend.get("auth_token").await.unwrap(), None);
        backend.set("auth_token", "abc").await.unwrap();
        assert_eq!(backend.get("auth_token").await.unwrap().as_deref(), Some("abc"));
        assert_eq!(backend.keys().await.unwrap(), vec!["auth_token".to_string()]);

        backend.remove("auth_token").await.unwrap();
        backend.remove("auth_token").await.unwrap();
        assert_eq!(backend.get("auth_token").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_origins_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let prod = FileBackend::new(dir.path(), "https://saidawifi.com");
        let preview = FileBackend::new(dir.path(), "https://portal.replit.app");

        prod.set("auth_token", "prod").await.unwrap();
        assert_eq!(preview.get("auth_token").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_discarded_on_remove() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), "https://saidawifi.com");
        std::fs::create_dir_all(backend.path().parent().unwrap()).unwrap();
        std::fs::write(backend.path(), "{not json").unwrap();

        assert!(backend.get("auth_token").await.is_err());
        backend.remove("auth_token").await.unwrap();
        assert_eq!(backend.get("auth_token").await.unwrap(), None);
    }
}
