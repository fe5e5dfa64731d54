//! Tandem Server - relay for realtime state synchronization.
//!
//! Clients connect per project over WebSocket. The relay keeps each
//! project's current document, sends it as the first frame to every
//! newcomer, applies the patches clients send, and forwards them to the
//! project's other connections together with presence events.

pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod routes;
pub mod storage;

use crate::config::Config;
use crate::hub::HubRegistry;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<HubRegistry>,
}

impl AppState {
    pub fn new(config: Config, storage: Arc<dyn storage::SnapshotStorage>) -> Self {
        Self {
            config: Arc::new(config),
            registry: HubRegistry::new_shared(storage),
        }
    }
}

/// Build the application router.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
