//! HTTP trigger surface for backup jobs.

pub mod auth;
pub mod error;
pub mod health;
pub mod jobs;

use crate::config::Config;
use auth::{Authorizer, StaticTokenAuthorizer};
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub authorizer: Arc<dyn Authorizer>,
}

/// State guarding job routes with the configured static token
pub fn create_app_state(config: Config) -> AppState {
    let authorizer = Arc::new(StaticTokenAuthorizer::new(config.agent.token.clone()));
    AppState {
        config: Arc::new(config),
        authorizer,
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        // Job endpoints
        .route("/jobs/{id}/start", post(jobs::start))
        .route("/jobs/{id}/resume", post(jobs::resume))
        .route("/jobs/{id}/fetch", get(jobs::fetch))
        .route("/jobs/{id}", delete(jobs::cleanup))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
