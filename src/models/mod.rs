//! Data models representing database entities.
//!
//! This module contains all data structures that map to database tables,
//! together with the request/response bodies built from them.

/// Account record with membership, quota overrides and session binding
pub mod account;
/// Admin API key authentication model
pub mod api_key;
/// Access keys, boost keys and the redemption audit
pub mod key;
/// Quota scopes, ledger, temporary boosts and settings
pub mod quota;
/// Device-session binding
pub mod session;
