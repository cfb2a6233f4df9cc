//! Admin API key model for authentication.
//!
//! Admin keys authenticate the key-administration endpoints. They are stored
//! in the database as SHA-256 hashes; the plaintext key is never persisted.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Represents an admin API key record from the database.
///
/// # Database Table
///
/// Maps to the `admin_api_keys` table with columns:
/// - `id`: Unique identifier (UUID)
/// - `key_hash`: SHA-256 hash of the actual API key
/// - `label`: Who or what the key was issued to
/// - `created_at`: When the key was created
/// - `is_active`: Whether the key is currently valid
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AdminApiKey {
    /// Unique identifier for this API key
    pub id: Uuid,

    /// SHA-256 hash of the actual API key (64 hex characters)
    ///
    /// When a request comes in with "Bearer abc123", we:
    /// 1. Hash "abc123" with SHA-256
    /// 2. Look up this hash in the database
    /// 3. If found and active, authenticate the request
    pub key_hash: String,

    /// Operator-facing label
    pub label: String,

    /// Timestamp when this API key was created
    pub created_at: DateTime<Utc>,

    /// Inactive keys are rejected during authentication.
    pub is_active: bool,
}
