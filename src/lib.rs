//! Membership paywall backend: access-key licensing, rolling-window quotas
//! and single-active-device sessions, served over HTTP by axum.
//!
//! The binary in `main.rs` only loads configuration and picks a store; all
//! engines live here so they can be embedded and tested without a database.

pub mod app;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;
