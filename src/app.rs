//! Application wiring: shared state and the HTTP router.
//!
//! Routes fall into three groups:
//! - public: `/health`
//! - session-bound: every end-user route, behind the bind-session middleware
//! - admin: behind admin API key authentication

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{delete, get, post, put},
};
use tower_http::trace::TraceLayer;

use crate::{
    cache::TtlCache,
    clock::Clock,
    config::Config,
    handlers,
    middleware::{self, session::LOGIN_PATH},
    services::{
        account_service::AccountDirectory,
        key_admin_service::KeyAdmin,
        license_service::LicenseManager,
        quota_service::QuotaEngine,
        retry::RetryPolicy,
        session_service::{DeviceSessionBinder, SessionBinder},
        settings::QuotaSettingsProvider,
    },
    store::Store,
};

/// State shared by every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub accounts: Arc<AccountDirectory>,
    pub settings: Arc<QuotaSettingsProvider>,
    pub license: Arc<LicenseManager>,
    pub quota: Arc<QuotaEngine>,
    pub sessions: Arc<dyn SessionBinder>,
    pub keys: Arc<KeyAdmin>,
}

impl AppState {
    /// Wire the engines over `store` and `clock`.
    pub fn build(config: &Config, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        let retry = RetryPolicy::new(config.redeem_max_attempts, config.retry_backoff());

        let accounts = Arc::new(AccountDirectory::new(
            store.clone(),
            TtlCache::new(config.account_cache_ttl(), clock.clone()),
            clock.clone(),
            retry,
        ));
        let settings = Arc::new(QuotaSettingsProvider::new(
            store.clone(),
            config.quota_settings(),
            TtlCache::new(config.settings_cache_ttl(), clock.clone()),
            retry,
        ));
        let quota = Arc::new(QuotaEngine::new(
            store.clone(),
            accounts.clone(),
            settings.clone(),
            clock.clone(),
            retry,
            config.quota_serialize_per_account,
        ));
        let license = Arc::new(LicenseManager::new(
            store.clone(),
            accounts.clone(),
            settings.clone(),
            quota.clone(),
            clock.clone(),
            retry,
        ));
        let sessions: Arc<dyn SessionBinder> = Arc::new(DeviceSessionBinder::new(
            store.clone(),
            accounts.clone(),
            clock.clone(),
            retry,
            config.session_secret.as_bytes(),
        ));
        let keys = Arc::new(KeyAdmin::new(store.clone(), clock.clone(), retry));

        Self {
            store,
            clock,
            accounts,
            settings,
            license,
            quota,
            sessions,
            keys,
        }
    }
}

/// Build the full router with middleware and state applied.
pub fn build_router(state: AppState) -> Router {
    let session_routes = Router::new()
        .route(LOGIN_PATH, post(handlers::sessions::login))
        .route(
            "/api/v1/sessions/current",
            get(handlers::sessions::current_session),
        )
        .route("/api/v1/license", get(handlers::redemption::license_status))
        .route(
            "/api/v1/keys/redeem",
            post(handlers::redemption::redeem_access_key),
        )
        .route(
            "/api/v1/boosts/redeem",
            post(handlers::redemption::redeem_boost_key),
        )
        .route("/api/v1/quota", get(handlers::quota::quota_status))
        .route("/api/v1/quota/check", post(handlers::quota::quota_check))
        .route("/api/v1/quota/record", post(handlers::quota::quota_record))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::session::bind_session_middleware,
        ));

    let admin_routes = Router::new()
        .route(
            "/api/v1/admin/accounts",
            post(handlers::accounts::create_account),
        )
        .route(
            "/api/v1/admin/accounts/{id}",
            get(handlers::accounts::get_account),
        )
        .route(
            "/api/v1/admin/accounts/{id}/expiry",
            put(handlers::accounts::override_expiry),
        )
        .route(
            "/api/v1/admin/accounts/{id}/limits",
            put(handlers::accounts::set_base_limits),
        )
        .route(
            "/api/v1/admin/accounts/{id}/redemptions",
            get(handlers::accounts::list_redemptions),
        )
        .route(
            "/api/v1/admin/accounts/{id}/quota",
            get(handlers::accounts::account_quota),
        )
        .route(
            "/api/v1/admin/keys/access",
            post(handlers::keys::generate_access_keys),
        )
        .route(
            "/api/v1/admin/keys/boost",
            post(handlers::keys::generate_boost_keys),
        )
        .route(
            "/api/v1/admin/keys/{kind}/{id}/active",
            put(handlers::keys::set_key_active),
        )
        .route(
            "/api/v1/admin/keys/{kind}/{id}",
            delete(handlers::keys::delete_key),
        )
        .route(
            "/api/v1/admin/boosts/{id}/disable",
            post(handlers::keys::disable_temporary_boost),
        )
        .route(
            "/api/v1/admin/settings/reload",
            post(handlers::keys::reload_settings),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::admin_auth_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .merge(session_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
