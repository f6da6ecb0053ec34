//! Session lifecycle.
//!
//! This module provides:
//! - `SessionManager`: login, logout, authenticated requests, derived state
//! - `SessionState`: `Anonymous`, `Unresolved`, or `Authenticated(identity)`
//! - `SessionEvent`: broadcast lifecycle notifications, including forced logout

pub mod events;
pub mod manager;
pub mod state;

pub use events::{ExpiredHook, SessionEvent, SessionEvents};
pub use manager::{SessionManager, SessionManagerBuilder};
pub use state::{spawn_state_publisher, Identity, SessionState};
