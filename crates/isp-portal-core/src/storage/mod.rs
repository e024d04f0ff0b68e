//! Persistence backends for credential state.
//!
//! This module provides:
//! - `StorageBackend`: the `get/set/remove` capability every store implements
//! - `KeyringBackend`: secure native store (OS keychain)
//! - `FileBackend`: durable origin-scoped store on disk
//! - `MemoryBackend`: session-scoped transient store
//!
//! Backends never decide policy. Ordering, fallback and purge rules live in
//! [`crate::auth::CredentialStore`].

pub mod backend;
pub mod file;
pub mod memory;
pub mod native;

pub use backend::{StorageBackend, StorageError};
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use native::KeyringBackend;
