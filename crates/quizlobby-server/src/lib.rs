pub mod broadcaster;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod locks;
pub mod registry;
pub mod state;
pub mod store;
pub mod ws;

use axum::Router;
use axum::routing::get;

use config::ServerConfig;
use state::AppState;

/// Build the Axum router and application state from a config.
pub fn build_app(config: ServerConfig) -> (Router<()>, AppState) {
    let state = AppState::new(config);
    let app = router(state.clone());
    (app, state)
}

/// Router over an existing state, for callers that supply their own store.
pub fn router(state: AppState) -> Router<()> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health::health_check))
        .with_state(state)
}
