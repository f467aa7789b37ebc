//! Core library for Fin Engine clients.
//!
//! Owns the client-side session: the persisted access/refresh token pair,
//! advisory expiry decoding, and a single-flight, throttled refresh that
//! callers share through one [`SessionManager`] handle.

pub mod api;
pub mod auth;
pub mod config;
pub mod store;

pub use api::{ApiClient, ApiError, TokenRefresher};
pub use auth::{SessionConfig, SessionManager, SessionRecord, UserProfile};
pub use config::{Config, ConfigError, StorageKind};
pub use store::{FileStore, KeyringStore, MemoryStore, SessionStore, StorageError};
