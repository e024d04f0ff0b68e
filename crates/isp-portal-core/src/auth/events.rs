use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;

use super::AuthError;

/// Sent to subscribers when a live session ends because the server (or the
/// reconciler) said the credential is no good.
#[derive(Debug, Clone)]
pub struct AuthFailure {
    pub error: AuthError,
    pub username: Option<String>,
    pub at: DateTime<Utc>,
}

type Listener = Arc<dyn Fn(&AuthFailure) + Send + Sync>;

/// Auth-failure notification hub. The UI registers here to get sent back to
/// the sign-in screen; it never touches storage itself.
#[derive(Default)]
pub struct AuthEvents {
    listeners: Mutex<Vec<Listener>>,
}

impl AuthEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: impl Fn(&AuthFailure) + Send + Sync + 'static) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Arc::new(callback));
        }
    }

    pub fn emit(&self, failure: AuthFailure) {
        // Snapshot so callbacks run without the lock held
        let listeners: Vec<Listener> = match self.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        debug!(listeners = listeners.len(), error = %failure.error, "Dispatching auth failure");
        for listener in listeners {
            listener(&failure);
        }
    }
}
