//! HTTP middleware components.
//!
//! Middleware are functions that run before route handlers.
//! They can:
//! - Authenticate requests
//! - Bind the request to the account's device session
//! - Short-circuit requests (reject unauthorized or superseded devices)

/// Admin API key authentication middleware
pub mod auth;

/// Single-active-device session binding
pub mod session;
