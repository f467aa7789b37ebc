//! Authentication module for managing the client-side session.
//!
//! This module provides:
//! - `SessionRecord`: The persisted access/refresh token pair and profile snapshot
//! - `SessionStorage`: Loads and stores the record, treating any failure as "no session"
//! - `token`: Advisory, unverified decoding of token expiry
//! - `SessionManager`: Hands out valid access tokens, refreshing them single-flight
//!
//! Access tokens are refreshed when they expire within two minutes, and a
//! background timer refreshes them shortly before expiry.

pub mod manager;
pub mod session;
pub mod token;

pub use manager::{SessionConfig, SessionManager};
pub use session::{SessionRecord, SessionStorage, UserProfile};
