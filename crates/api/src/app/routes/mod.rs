use axum::Router;

pub mod builds;
pub mod system;

/// Router for all endpoints that require a caller identity.
pub fn router() -> Router {
    Router::new().nest("/builds", builds::router())
}
