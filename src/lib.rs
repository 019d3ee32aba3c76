pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod profiles;
pub mod registry;
pub mod rooms;

use std::sync::Arc;

use axum::{extract::FromRef, routing::get, Router};
use sqlx::SqlitePool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use error::{RelayError, RelayResult};

use auth::TokenVerifier;
use profiles::UserDirectory;
use registry::ConnectionRegistry;
use rooms::{msg::History, RoomRouter};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub verifier: Arc<TokenVerifier>,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<RoomRouter>,
    pub history: Arc<History>,
    pub directory: UserDirectory,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, jwt_secret: &str) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        AppState {
            verifier: Arc::new(TokenVerifier::new(jwt_secret)),
            router: Arc::new(RoomRouter::new(registry.clone())),
            registry,
            history: Arc::new(History::new(db_pool.clone())),
            directory: UserDirectory::new(db_pool),
        }
    }
}

pub fn app(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(rooms::router())
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}
