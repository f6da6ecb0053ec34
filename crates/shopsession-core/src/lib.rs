//! Session and token lifecycle for the storefront and admin API clients.
//!
//! A [`SessionManager`] holds the access/refresh credential pair for one
//! deployment, attaches it to outbound requests, collapses concurrent 401s
//! into a single refresh call, retries each rejected request once, and tears
//! the session down cleanly when the refresh credential is no longer accepted.

pub mod api;
pub mod auth;
pub mod config;
pub mod session;

pub use api::{ApiError, ApiRequest, AuthenticatedClient, MultipartField, RefreshFailure, RequestBody};
pub use auth::{CredentialPair, CredentialStore, RefreshCoordinator, Token};
pub use config::{Config, Deployment, StorageKind};
pub use session::{Identity, SessionEvent, SessionManager, SessionState};
