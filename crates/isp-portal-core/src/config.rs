//! Application configuration management.
//!
//! This module handles loading and saving the portal configuration: where
//! the portal is served from, how API calls are routed, timeouts, the
//! reconcile retry policy and the last used username.
//!
//! Configuration is stored at `~/.config/isp-portal/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::REQUEST_TIMEOUT_SECS;
use crate::auth::RetryPolicy;
use crate::env::{RoutingPolicy, RuntimeContext};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "isp-portal";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Origin of the packaged native shell
const DEFAULT_ORIGIN: &str = "app://localhost";

/// Identity checks are a single small GET; fail fast into "indeterminate"
const DEFAULT_CONFIRM_TIMEOUT_SECS: u64 = 10;

pub const ORIGIN_ENV: &str = "ISP_PORTAL_ORIGIN";
pub const API_ROOT_ENV: &str = "ISP_PORTAL_API_ROOT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Origin the portal is served from
    pub origin: String,
    pub routing: RoutingPolicy,
    pub request_timeout_secs: u64,
    pub confirm_timeout_secs: u64,
    pub reconcile: RetryPolicy,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            routing: RoutingPolicy::default(),
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            confirm_timeout_secs: DEFAULT_CONFIRM_TIMEOUT_SECS,
            reconcile: RetryPolicy::default(),
            last_username: None,
        }
    }
}

impl Config {
    /// Load from the default location, then apply environment overrides
    pub fn load() -> Result<Self> {
        let config = Self::load_from(&Self::config_path()?)?;
        Ok(config.with_overrides(|key| std::env::var(key).ok()))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Apply `ISP_PORTAL_ORIGIN` / `ISP_PORTAL_API_ROOT` from `lookup`
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(origin) = lookup(ORIGIN_ENV).filter(|v| !v.trim().is_empty()) {
            self.origin = origin.trim().to_string();
        }
        if let Some(root) = lookup(API_ROOT_ENV).filter(|v| !v.trim().is_empty()) {
            self.routing.direct_api_root = root.trim().to_string();
        }
        self
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Root of the durable file backend
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn runtime_context(&self) -> Result<RuntimeContext> {
        RuntimeContext::from_origin(&self.origin)
            .with_context(|| format!("Invalid portal origin {:?}", self.origin))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }
}
