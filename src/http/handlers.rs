//! HTTP handlers for the REST API.
//!
//! Each handler checks the caller's role and delegates to the route manager.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use super::auth::Caller;
use super::dto::{
    ApproveRequest, AssignRequest, AvailabilityRequest, HealthResponse, LimitQuery, ModeRequest,
    PreviewRequest, RejectRequest, RoutesQuery, RunQuery, SchedulerRun, SchedulerStatus,
};
use super::error::AppError;
use super::extract::ApiJson;
use super::state::AppState;
use crate::config::Role;
use crate::db::{NewBooking, NewDriver};
use crate::earnings::RouteEarnings;
use crate::manager::{
    AutoRoutingReport, DropCompletion, ManualRouteInput, ManualRouteOutcome, PendingApproval,
    RouteDetail, RoutePreview, SettingsPatch,
};
use crate::model::{ActorType, AuditEntry, Booking, Driver, Route, RoutingSettings};
use crate::scheduler;

/// Result type for handlers.
pub type HandlerResult<T> = Result<Json<T>, AppError>;

type Created<T> = Result<(StatusCode, Json<T>), AppError>;

const ADMIN: &[Role] = &[Role::Admin];
const DRIVER: &[Role] = &[Role::Driver];
const CRON_OR_ADMIN: &[Role] = &[Role::Cron, Role::Admin];

const DEFAULT_LIMIT: i64 = 50;

// =============================================================================
// Health
// =============================================================================

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> HandlerResult<HealthResponse> {
    let database = match sqlx::query("SELECT 1").execute(state.manager.pool()).await {
        Ok(_) => "connected".to_string(),
        Err(e) => format!("error: {}", e),
    };
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
    }))
}

// =============================================================================
// Routing settings and auto-routing
// =============================================================================

/// GET /api/admin/routing/settings
pub async fn get_settings(State(state): State<AppState>, caller: Caller) -> HandlerResult<RoutingSettings> {
    caller.require(ADMIN)?;
    Ok(Json(state.manager.settings().await?))
}

/// PUT /api/admin/routing/settings
pub async fn update_settings(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(patch): ApiJson<SettingsPatch>,
) -> HandlerResult<RoutingSettings> {
    let admin = caller.require(ADMIN)?;
    Ok(Json(state.manager.update_settings(&patch, admin).await?))
}

/// POST /api/admin/routing/mode
pub async fn set_mode(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(req): ApiJson<ModeRequest>,
) -> HandlerResult<RoutingSettings> {
    let admin = caller.require(ADMIN)?;
    Ok(Json(state.manager.set_routing_mode(req.mode, admin).await?))
}

/// POST /api/admin/routing/run?force=true
pub async fn run_auto_routing(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<RunQuery>,
) -> HandlerResult<AutoRoutingReport> {
    let admin = caller.require(ADMIN)?;
    let force = query.force.unwrap_or(false);
    Ok(Json(state.manager.run_auto_routing(admin, force).await?))
}

/// GET /api/admin/routing/history
pub async fn auto_routing_history(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<LimitQuery>,
) -> HandlerResult<Vec<AuditEntry>> {
    caller.require(ADMIN)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    Ok(Json(state.manager.auto_routing_history(limit).await?))
}

/// POST /api/admin/routing/preview
pub async fn preview_route(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(req): ApiJson<PreviewRequest>,
) -> HandlerResult<RoutePreview> {
    caller.require(ADMIN)?;
    Ok(Json(state.manager.preview_route(&req.booking_ids).await?))
}

/// GET /api/admin/routing/approvals
pub async fn pending_approvals(
    State(state): State<AppState>,
    caller: Caller,
) -> HandlerResult<Vec<PendingApproval>> {
    caller.require(ADMIN)?;
    Ok(Json(state.manager.pending_approvals().await?))
}

// =============================================================================
// Scheduler hook
// =============================================================================

/// GET /api/admin/routes/scheduler
pub async fn scheduler_status(State(state): State<AppState>, caller: Caller) -> HandlerResult<SchedulerStatus> {
    caller.require(CRON_OR_ADMIN)?;
    Ok(Json(state.manager.settings().await?.into()))
}

/// POST /api/admin/routes/scheduler
pub async fn scheduler_run(State(state): State<AppState>, caller: Caller) -> HandlerResult<SchedulerRun> {
    let subject = caller.require(CRON_OR_ADMIN)?;
    let settings = state.manager.settings().await?;
    if !scheduler::is_enabled(&settings) {
        return Ok(Json(SchedulerRun::Skipped {
            skipped: true,
            reason: "auto-routing is disabled".to_string(),
        }));
    }
    let report = state.manager.run_auto_routing(subject, false).await?;
    Ok(Json(SchedulerRun::Ran(report)))
}

// =============================================================================
// Routes (admin)
// =============================================================================

/// GET /api/admin/routes?status=pending&limit=20
pub async fn list_routes(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<RoutesQuery>,
) -> HandlerResult<Vec<Route>> {
    caller.require(ADMIN)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    Ok(Json(state.manager.list_routes(query.status, limit).await?))
}

/// POST /api/admin/routes
pub async fn create_route(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(mut input): ApiJson<ManualRouteInput>,
) -> Created<ManualRouteOutcome> {
    input.admin_id = caller.require(ADMIN)?.to_string();
    let outcome = state.manager.create_manual_route(&input).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// GET /api/admin/routes/{id}
pub async fn get_route(
    State(state): State<AppState>,
    caller: Caller,
    Path(route_id): Path<String>,
) -> HandlerResult<RouteDetail> {
    caller.require(ADMIN)?;
    Ok(Json(state.manager.route_detail(&route_id).await?))
}

/// POST /api/admin/routes/{id}/approve
pub async fn approve_route(
    State(state): State<AppState>,
    caller: Caller,
    Path(route_id): Path<String>,
    ApiJson(req): ApiJson<ApproveRequest>,
) -> HandlerResult<Route> {
    let admin = caller.require(ADMIN)?;
    Ok(Json(
        state
            .manager
            .approve_route(&route_id, admin, req.driver_id.as_deref())
            .await?,
    ))
}

/// POST /api/admin/routes/{id}/reject
pub async fn reject_route(
    State(state): State<AppState>,
    caller: Caller,
    Path(route_id): Path<String>,
    ApiJson(req): ApiJson<RejectRequest>,
) -> HandlerResult<Route> {
    let admin = caller.require(ADMIN)?;
    Ok(Json(state.manager.reject_route(&route_id, admin, &req.reason).await?))
}

/// POST /api/admin/routes/{id}/assign
pub async fn assign_route(
    State(state): State<AppState>,
    caller: Caller,
    Path(route_id): Path<String>,
    ApiJson(req): ApiJson<AssignRequest>,
) -> HandlerResult<Route> {
    let admin = caller.require(ADMIN)?;
    Ok(Json(state.manager.assign_driver(&route_id, &req.driver_id, admin).await?))
}

/// GET /api/admin/routes/{id}/earnings
pub async fn route_earnings(
    State(state): State<AppState>,
    caller: Caller,
    Path(route_id): Path<String>,
) -> HandlerResult<RouteEarnings> {
    caller.require(ADMIN)?;
    Ok(Json(state.manager.route_earnings(&route_id).await?))
}

// =============================================================================
// Bookings and drivers (admin)
// =============================================================================

/// POST /api/admin/bookings
pub async fn create_booking(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(booking): ApiJson<NewBooking>,
) -> Created<Booking> {
    let admin = caller.require(ADMIN)?;
    let booking = state.manager.create_booking(booking, admin).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

/// POST /api/admin/drivers
pub async fn create_driver(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(driver): ApiJson<NewDriver>,
) -> Created<Driver> {
    let admin = caller.require(ADMIN)?;
    let driver = state.manager.create_driver(driver, admin).await?;
    Ok((StatusCode::CREATED, Json(driver)))
}

/// GET /api/admin/drivers
pub async fn list_drivers(State(state): State<AppState>, caller: Caller) -> HandlerResult<Vec<Driver>> {
    caller.require(ADMIN)?;
    Ok(Json(state.manager.list_drivers().await?))
}

/// PUT /api/admin/drivers/{id}/availability
pub async fn set_driver_availability(
    State(state): State<AppState>,
    caller: Caller,
    Path(driver_id): Path<String>,
    ApiJson(req): ApiJson<AvailabilityRequest>,
) -> HandlerResult<Driver> {
    let admin = caller.require(ADMIN)?;
    Ok(Json(
        state
            .manager
            .set_driver_availability(&driver_id, req.availability, admin, ActorType::Admin)
            .await?,
    ))
}

// =============================================================================
// Driver endpoints
// =============================================================================

/// GET /api/driver/routes
pub async fn driver_routes(State(state): State<AppState>, caller: Caller) -> HandlerResult<Vec<Route>> {
    let driver = caller.require(DRIVER)?;
    Ok(Json(state.manager.driver_routes(driver).await?))
}

/// POST /api/driver/routes/{id}/decline
pub async fn decline_route(
    State(state): State<AppState>,
    caller: Caller,
    Path(route_id): Path<String>,
) -> HandlerResult<Route> {
    let driver = caller.require(DRIVER)?;
    Ok(Json(state.manager.decline_route(&route_id, driver).await?))
}

/// POST /api/driver/routes/{id}/start
pub async fn start_route(
    State(state): State<AppState>,
    caller: Caller,
    Path(route_id): Path<String>,
) -> HandlerResult<Route> {
    let driver = caller.require(DRIVER)?;
    Ok(Json(state.manager.start_route(&route_id, driver).await?))
}

/// POST /api/driver/routes/{id}/drops/{drop_id}/complete
pub async fn complete_drop(
    State(state): State<AppState>,
    caller: Caller,
    Path((route_id, drop_id)): Path<(String, String)>,
) -> HandlerResult<DropCompletion> {
    let driver = caller.require(DRIVER)?;
    Ok(Json(state.manager.complete_drop(&route_id, &drop_id, driver).await?))
}

/// GET /api/driver/routes/{id}/earnings
pub async fn driver_route_earnings(
    State(state): State<AppState>,
    caller: Caller,
    Path(route_id): Path<String>,
) -> HandlerResult<RouteEarnings> {
    let driver = caller.require(DRIVER)?;
    Ok(Json(state.manager.driver_route_earnings(&route_id, driver).await?))
}
