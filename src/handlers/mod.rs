//! HTTP request handlers (route handlers).
//!
//! Each handler is an async function that:
//! 1. Receives HTTP request data (JSON body, URL params, extensions)
//! 2. Delegates to an engine in [`services`](crate::services)
//! 3. Returns HTTP response (JSON, status code)

/// Admin account endpoints
pub mod accounts;
pub mod health;
/// Admin key endpoints
pub mod keys;
pub mod quota;
/// End-user redemption and license endpoints
pub mod redemption;
pub mod sessions;
