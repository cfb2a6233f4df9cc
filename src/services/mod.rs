//! Business logic services.
//!
//! Services contain the engines, separated from HTTP handlers. They talk to
//! durable state only through [`Store`](crate::store::Store) and read time
//! only through [`Clock`](crate::clock::Clock).

pub mod account_service;
pub mod key_admin_service;
pub mod license_service;
pub mod quota_service;
pub mod retry;
pub mod session_service;
pub mod settings;
