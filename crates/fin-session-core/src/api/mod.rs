//! REST client for the Fin Engine authentication endpoints.
//!
//! This module provides the `ApiClient` used to log in and to exchange a
//! refresh token for a new access token. The refresh exchange sits behind the
//! `TokenRefresher` trait so the session manager can be driven by a fake in
//! tests.

pub mod client;
pub mod error;

pub use client::{ApiClient, RefreshEncoding, RefreshedTokens, TokenRefresher};
pub use error::ApiError;
