//! Credential storage and refresh.
//!
//! This module provides:
//! - `CredentialStore`: the current access/refresh pair, durable via a backend
//! - `RefreshCoordinator`: one shared refresh call per expiry episode
//! - `spawn_refresh_timer`: the passive, fixed-period refresh

pub mod coordinator;
pub mod credentials;
pub mod store;
pub mod timer;

pub use coordinator::RefreshCoordinator;
pub use credentials::{
    CredentialBackend, CredentialPair, FileBackend, KeyringBackend, MemoryBackend, Token,
};
pub use store::CredentialStore;
pub use timer::spawn_refresh_timer;
