//! REST API client module for the portal backend.
//!
//! This module provides the `ApiClient` that authenticates every data call
//! with the current bearer credential and ends the session when the server
//! rejects it.
//!
//! Paths are relative to the environment's base address, so the same calls
//! work against the direct API root and the same-origin `/api` proxy.

pub mod client;
pub mod error;

pub use client::{
    ApiClient, LoginIdentity, LoginResponse, IDENTITY_PATH, INVOICES_PATH, LOGIN_PATH,
    REQUEST_TIMEOUT_SECS, USAGE_PATH,
};
pub use error::ApiError;
