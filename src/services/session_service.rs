//! Device-session binding: at most one active device per account.
//!
//! The account row holds one `current_session_id` of the form
//! `<account>:<device>:<fingerprint>`, where the fingerprint is a truncated
//! HMAC-SHA256 of the bearer token. Binding compares only the device part:
//!
//! | stored            | presented device | login flow | result                        |
//! |-------------------|------------------|------------|-------------------------------|
//! | none              | any              | any        | bind, `FirstLogin`            |
//! | same device       | same             | any        | touch, `Continued`            |
//! | other device      | different        | yes        | overwrite, `Superseded`       |
//! | other device      | different        | no         | `SessionSuperseded` (401)     |
//!
//! Every write is a compare-and-swap against the value that was read; a lost
//! swap re-reads the account from the store and decides again.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AppError;
use crate::models::account::Account;
use crate::models::session::{BindOutcome, BoundSession};
use crate::services::account_service::AccountDirectory;
use crate::services::retry::RetryPolicy;
use crate::store::Store;

type HmacSha256 = Hmac<Sha256>;

/// Longest accepted device id.
pub const MAX_DEVICE_ID_LEN: usize = 128;

/// Hex characters of the token fingerprint kept in the session id.
const FINGERPRINT_HEX_LEN: usize = 16;

/// Single-device gate invoked by every session-bound entry point.
#[async_trait]
pub trait SessionBinder: Send + Sync {
    /// Bind the request's device to the account.
    ///
    /// # Errors
    ///
    /// - `SessionSuperseded` when another device holds the account and this
    ///   is not the login flow
    /// - `InvalidRequest` for a malformed device id
    /// - `Unauthenticated` for an empty token
    /// - `AccountNotFound`, `PersistenceConflict`
    async fn bind(
        &self,
        account_id: Uuid,
        device_id: &str,
        auth_token: &str,
        is_login_flow: bool,
    ) -> Result<BindOutcome, AppError>;

    /// The device currently holding the account.
    async fn current(&self, account_id: Uuid) -> Result<BoundSession, AppError>;
}

/// Validate a client-supplied device id.
pub fn validate_device_id(device_id: &str) -> Result<(), AppError> {
    if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(AppError::InvalidRequest(format!(
            "device id must be 1..={MAX_DEVICE_ID_LEN} characters"
        )));
    }
    if !device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AppError::InvalidRequest(
            "device id may only contain letters, digits, '_' and '-'".to_string(),
        ));
    }
    Ok(())
}

/// Parsed form of a stored session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId {
    pub account_id: Uuid,
    pub device_id: String,
    pub fingerprint: String,
}

impl SessionId {
    pub fn encode(&self) -> String {
        format!("{}:{}:{}", self.account_id, self.device_id, self.fingerprint)
    }

    /// `None` for anything not produced by [`SessionId::encode`].
    pub fn decode(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, ':');
        let account_id = parts.next()?.parse().ok()?;
        let device_id = parts.next()?;
        let fingerprint = parts.next()?;
        if validate_device_id(device_id).is_err()
            || fingerprint.len() != FINGERPRINT_HEX_LEN
            || !fingerprint.chars().all(|c| c.is_ascii_hexdigit())
        {
            return None;
        }
        Some(Self {
            account_id,
            device_id: device_id.to_string(),
            fingerprint: fingerprint.to_string(),
        })
    }
}

/// Device carried by a stored session id, if it can be read.
fn stored_device(account: &Account) -> Option<String> {
    let raw = account.current_session_id.as_deref()?;
    match SessionId::decode(raw) {
        Some(session) if session.account_id == account.id => Some(session.device_id),
        _ => {
            tracing::warn!(account_id = %account.id, "stored session id is unreadable");
            None
        }
    }
}

/// What a bind decided for one snapshot of the account.
enum Decision {
    Bind { expected: Option<String> },
    Touch { session_id: String },
    Reject,
}

fn decide(account: &Account, device_id: &str, is_login_flow: bool) -> Decision {
    let Some(stored) = account.current_session_id.clone() else {
        return Decision::Bind { expected: None };
    };
    if stored_device(account).as_deref() == Some(device_id) {
        Decision::Touch { session_id: stored }
    } else if is_login_flow {
        Decision::Bind {
            expected: Some(stored),
        }
    } else {
        Decision::Reject
    }
}

/// [`SessionBinder`] backed by the account row.
pub struct DeviceSessionBinder {
    store: Arc<dyn Store>,
    accounts: Arc<AccountDirectory>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    secret: Vec<u8>,
}

impl DeviceSessionBinder {
    pub fn new(
        store: Arc<dyn Store>,
        accounts: Arc<AccountDirectory>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        secret: &[u8],
    ) -> Self {
        Self {
            store,
            accounts,
            clock,
            retry,
            secret: secret.to_vec(),
        }
    }

    /// Truncated HMAC-SHA256 of the bearer token. The token itself is never
    /// stored.
    pub fn fingerprint(&self, auth_token: &str) -> Result<String, AppError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AppError::Internal(format!("session secret rejected: {e}")))?;
        mac.update(auth_token.as_bytes());
        let digest = mac.finalize().into_bytes();
        Ok(hex::encode(&digest[..FINGERPRINT_HEX_LEN / 2]))
    }

    pub fn session_id(
        &self,
        account_id: Uuid,
        device_id: &str,
        auth_token: &str,
    ) -> Result<SessionId, AppError> {
        Ok(SessionId {
            account_id,
            device_id: device_id.to_string(),
            fingerprint: self.fingerprint(auth_token)?,
        })
    }
}

#[async_trait]
impl SessionBinder for DeviceSessionBinder {
    async fn bind(
        &self,
        account_id: Uuid,
        device_id: &str,
        auth_token: &str,
        is_login_flow: bool,
    ) -> Result<BindOutcome, AppError> {
        validate_device_id(device_id)?;
        if auth_token.trim().is_empty() {
            return Err(AppError::Unauthenticated);
        }
        let new_session = self.session_id(account_id, device_id, auth_token)?.encode();

        // First pass may use the cached row; any disagreement with the store
        // switches to fresh reads.
        let mut fresh = false;
        let mut attempt = 0;
        loop {
            let account = if fresh {
                self.accounts.fresh(account_id).await?
            } else {
                self.accounts.get(account_id).await?
            };
            let now = self.clock.now_utc();

            let settled = match decide(&account, device_id, is_login_flow) {
                Decision::Reject if !fresh => None,
                Decision::Reject => {
                    tracing::warn!(%account_id, %device_id, "request from superseded device rejected");
                    return Err(AppError::SessionSuperseded);
                }
                Decision::Touch { session_id } => {
                    let touched = self
                        .store
                        .touch_session(account_id, &session_id, now)
                        .await?;
                    touched.then_some(BindOutcome::Continued)
                }
                Decision::Bind { expected } => {
                    let swapped = self
                        .store
                        .swap_session(account_id, expected.as_deref(), &new_session, now)
                        .await;
                    self.accounts.invalidate(account_id);
                    if swapped? {
                        let outcome = if expected.is_none() {
                            BindOutcome::FirstLogin
                        } else {
                            BindOutcome::Superseded
                        };
                        tracing::info!(
                            %account_id,
                            %device_id,
                            outcome = ?outcome,
                            "device session bound"
                        );
                        Some(outcome)
                    } else {
                        None
                    }
                }
            };

            if let Some(outcome) = settled {
                return Ok(outcome);
            }

            self.accounts.invalidate(account_id);
            if fresh {
                tracing::warn!(%account_id, %device_id, attempt, "session swap lost a race");
                if !self.retry.pause(attempt).await {
                    return Err(AppError::PersistenceConflict);
                }
                attempt += 1;
            }
            fresh = true;
        }
    }

    async fn current(&self, account_id: Uuid) -> Result<BoundSession, AppError> {
        let account = self.accounts.fresh(account_id).await?;
        Ok(BoundSession {
            device_id: stored_device(&account),
            last_active_at: account.last_active_at,
        })
    }
}
