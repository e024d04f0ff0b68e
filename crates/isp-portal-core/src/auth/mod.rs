//! Authentication module for managing the portal credential.
//!
//! This module provides:
//! - `CredentialStore`: one save/load/clear surface over ranked storage backends
//! - `TokenValidator`: local claim checks and server confirmation
//! - `AuthReconciler`: once-per-session self-healing of corrupted state
//! - `SessionManager`: the surface the UI talks to
//!
//! A 401/403 from the server ends the session exactly once, through
//! [`CredentialStore::invalidate`], and notifies `on_auth_failure` subscribers.

pub mod credential;
pub mod error;
pub mod events;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod token;

pub use credential::{Credential, Identity};
pub use error::AuthError;
pub use events::{AuthEvents, AuthFailure};
pub use reconcile::{
    AuthReconciler, CorruptionReason, DiagnosticResult, ReconcileError, ReconcileEvent,
    ReconcileOutcome, ReconcileState, RetryPolicy, SkipReason, UnchangedReason,
    RECONCILE_FLAG_KEY,
};
pub use session::{LoginOutcome, SessionManager};
pub use store::{
    ClearOptions, ClearReport, CredentialStore, Invalidation, SaveOutcome, IDENTITY_KEY,
    LEGACY_KEYS, TOKEN_KEY,
};
pub use token::{Claims, Confirmation, TokenValidator};
