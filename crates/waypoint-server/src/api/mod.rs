pub mod mcp_routes;
pub mod workflows;

use axum::Router;

use waypoint_core::state::AppState;

/// Build the complete API router with all sub-routes.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/api/mcp", mcp_routes::router())
        .nest("/api/workflows", workflows::workflows_router())
        .nest("/api/instances", workflows::instances_router())
}
