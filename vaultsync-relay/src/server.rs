//! Axum router setup.

use crate::config::RelayConfig;
use crate::handlers::{keys, rules, sessions, versions, AppState};
use crate::storage::RelayStorage;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

pub fn build_router(storage: RelayStorage, config: RelayConfig) -> Router {
    let max_payload_size = config.max_payload_size;
    let state = AppState::new(storage, config);

    let vaults = Router::new()
        .route(
            "/v1/vaults/{vault}/keys",
            get(keys::list_keys).post(keys::register_key),
        )
        .route(
            "/v1/vaults/{vault}/keys/{fingerprint}/revoke",
            post(keys::revoke_key),
        )
        .route("/v1/vaults/{vault}/sessions", post(sessions::issue_session))
        .route("/v1/vaults/{vault}/profiles", get(versions::list_profiles))
        .route(
            "/v1/vaults/{vault}/profiles/{profile}/sync-rules",
            get(rules::get_rules).put(rules::put_rules),
        )
        .route(
            "/v1/vaults/{vault}/profiles/{profile}/versions",
            get(versions::list_versions).post(versions::record_version),
        )
        .route(
            "/v1/vaults/{vault}/profiles/{profile}/versions/latest",
            get(versions::latest_version),
        );

    Router::new()
        .merge(vaults)
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(max_payload_size))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
