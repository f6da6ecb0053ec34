//! HTTP side of the session.
//!
//! `AuthenticatedClient` attaches the access credential to requests built
//! from an `ApiRequest` and handles the 401, refresh, retry-once path.
//! Everything else the API returns is passed through untouched.

pub mod client;
pub mod error;
pub mod request;

pub use client::AuthenticatedClient;
pub use error::{ApiError, RefreshFailure};
pub use request::{ApiRequest, FieldValue, MultipartField, RequestBody};
