//! isp-portal-core - credential lifecycle and API routing for the ISP
//! subscriber portal.
//!
//! This crate provides:
//! - Storage backends (native secure store, origin-scoped file store,
//!   session memory)
//! - Credential persistence, invalidation and self-healing reconciliation
//! - Environment detection deciding direct vs proxied API routing
//! - An authenticated API client and the dashboard data models

pub mod api;
pub mod auth;
pub mod config;
pub mod env;
pub mod models;
pub mod storage;

pub use api::{ApiClient, ApiError};
pub use auth::{
    AuthError, AuthFailure, Credential, CredentialStore, Identity, ReconcileOutcome,
    ReconcileState, SessionManager, TokenValidator,
};
pub use config::Config;
pub use env::{EnvironmentDescriptor, EnvironmentRouter, RoutingMode, RuntimeContext};
pub use models::{Dashboard, Invoice, UsageSummary};
pub use storage::{StorageBackend, StorageError};
