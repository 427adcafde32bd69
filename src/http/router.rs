//! Router configuration for the HTTP API.

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::state::AppState;

/// Create the application router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let admin = Router::new()
        .route(
            "/routing/settings",
            get(handlers::get_settings).put(handlers::update_settings),
        )
        .route("/routing/mode", post(handlers::set_mode))
        .route("/routing/run", post(handlers::run_auto_routing))
        .route("/routing/history", get(handlers::auto_routing_history))
        .route("/routing/preview", post(handlers::preview_route))
        .route("/routing/approvals", get(handlers::pending_approvals))
        .route("/routes", get(handlers::list_routes).post(handlers::create_route))
        .route(
            "/routes/scheduler",
            get(handlers::scheduler_status).post(handlers::scheduler_run),
        )
        .route("/routes/{id}", get(handlers::get_route))
        .route("/routes/{id}/approve", post(handlers::approve_route))
        .route("/routes/{id}/reject", post(handlers::reject_route))
        .route("/routes/{id}/assign", post(handlers::assign_route))
        .route("/routes/{id}/earnings", get(handlers::route_earnings))
        .route("/bookings", post(handlers::create_booking))
        .route("/drivers", get(handlers::list_drivers).post(handlers::create_driver))
        .route("/drivers/{id}/availability", put(handlers::set_driver_availability));

    let driver = Router::new()
        .route("/routes", get(handlers::driver_routes))
        .route("/routes/{id}/decline", post(handlers::decline_route))
        .route("/routes/{id}/start", post(handlers::start_route))
        .route("/routes/{id}/drops/{drop_id}/complete", post(handlers::complete_drop))
        .route("/routes/{id}/earnings", get(handlers::driver_route_earnings));

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api/admin", admin)
        .nest("/api/driver", driver)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
