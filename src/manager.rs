//! Route manager: the service layer over the store and the orchestration
//! engine.
//!
//! Every state-changing operation runs in one transaction and writes an
//! audit entry inside it. Driver notifications are queued in the same
//! transaction and delivered later by the outbox worker.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashSet;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::booking;
use crate::config::{self, Config};
use crate::db::{self, EarningsRecord, NewAuditEntry, NewBooking, NewDriver};
use crate::earnings::{self, DailyCap, RateCard, RouteEarnings};
use crate::model::{
    ActorType, ApprovalStatus, Assignment, AssignmentStatus, AuditEntry, AutoRoutingStatus,
    Booking, BookingStatus, Driver, DriverAvailability, DriverStatus, Drop, DropStatus,
    OutboxKind, Route, RouteApproval, RouteOrigin, RouteStatus, RoutingMode, RoutingSettings,
    ServiceTier, Severity,
};
use crate::orchestration::{self, EngineConfig, OrchestrateOptions, RouteProposal};

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Conflict(String),
    #[error("auto-routing is already running")]
    AlreadyRunning,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type RoutingResult<T> = Result<T, RoutingError>;

const AUTO_ROUTING_EVENTS: &[&str] = &[
    "auto_routing_started",
    "auto_routing_completed",
    "auto_routing_failed",
    "auto_routing_unassigned",
    "auto_routing_recovered",
];

/// Partial settings update; absent fields keep their value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub auto_routing_enabled: Option<bool>,
    pub auto_routing_interval_min: Option<i64>,
    pub max_drops_per_route: Option<i64>,
    pub max_route_distance_km: Option<f64>,
    pub auto_assign_drivers: Option<bool>,
    pub require_admin_approval: Option<bool>,
    pub min_drops_for_auto_route: Option<i64>,
}

impl SettingsPatch {
    fn validate(&self) -> RoutingResult<()> {
        let positive = |name: &str, v: Option<i64>| match v {
            Some(v) if v <= 0 => Err(RoutingError::Invalid(format!("{} must be positive", name))),
            _ => Ok(()),
        };
        positive("auto_routing_interval_min", self.auto_routing_interval_min)?;
        positive("max_drops_per_route", self.max_drops_per_route)?;
        positive("min_drops_for_auto_route", self.min_drops_for_auto_route)?;
        if let Some(km) = self.max_route_distance_km {
            if km.is_nan() || km <= 0.0 {
                return Err(RoutingError::Invalid("max_route_distance_km must be positive".into()));
            }
        }
        Ok(())
    }

    fn apply(&self, settings: &mut RoutingSettings) {
        if let Some(v) = self.auto_routing_enabled {
            settings.auto_routing_enabled = v;
        }
        if let Some(v) = self.auto_routing_interval_min {
            settings.auto_routing_interval_min = v;
        }
        if let Some(v) = self.max_drops_per_route {
            settings.max_drops_per_route = v;
        }
        if let Some(v) = self.max_route_distance_km {
            settings.max_route_distance_km = v;
        }
        if let Some(v) = self.auto_assign_drivers {
            settings.auto_assign_drivers = v;
        }
        if let Some(v) = self.require_admin_approval {
            settings.require_admin_approval = v;
        }
        if let Some(v) = self.min_drops_for_auto_route {
            settings.min_drops_for_auto_route = v;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoRoutingReport {
    pub success: bool,
    pub routes_created: usize,
    pub bookings_processed: usize,
    pub drops_created: usize,
    pub routes_awaiting_approval: usize,
    pub routes_assigned: usize,
    pub unassigned_drop_ids: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

impl AutoRoutingReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            success: false,
            routes_created: 0,
            bookings_processed: 0,
            drops_created: 0,
            routes_awaiting_approval: 0,
            routes_assigned: 0,
            unassigned_drop_ids: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            duration_ms: 0,
            started_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualRouteInput {
    #[serde(default)]
    pub drop_ids: Vec<String>,
    #[serde(default)]
    pub booking_ids: Vec<String>,
    #[serde(default)]
    pub driver_id: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub service_tier: Option<ServiceTier>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub admin_id: String,
    #[serde(default)]
    pub skip_approval: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualRouteOutcome {
    pub route: Route,
    pub requires_approval: bool,
    pub approval: Option<RouteApproval>,
    pub assignment: Option<Assignment>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    Pickup,
    Delivery,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviewStop {
    pub sequence: usize,
    pub drop_id: String,
    pub kind: StopKind,
    pub address: String,
    pub lat: f64,
    pub lng: f64,
    pub estimated_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePreview {
    pub estimated_duration_min: i64,
    pub estimated_distance_km: f64,
    pub total_drops: usize,
    pub total_value_pence: i64,
    pub service_tier: ServiceTier,
    pub stops: Vec<PreviewStop>,
    pub warnings: Vec<String>,
    pub unrouted_booking_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub approval: RouteApproval,
    pub route: Route,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteDetail {
    pub route: Route,
    pub drops: Vec<Drop>,
    pub approval: Option<RouteApproval>,
    pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DropCompletion {
    pub route: Route,
    pub drop_id: String,
    pub route_completed: bool,
    pub earnings: Option<RouteEarnings>,
}

/// Stops in visiting order: each drop's pickup then its delivery, timed from
/// `start` with the drop's handling time and the per-drop buffer.
pub fn plan_stops(drops: &[Drop], start: DateTime<Utc>, buffer_min: i64) -> Vec<PreviewStop> {
    let mut stops = Vec::with_capacity(drops.len() * 2);
    let mut cursor = start;
    for drop in drops {
        stops.push(PreviewStop {
            sequence: stops.len() + 1,
            drop_id: drop.id.clone(),
            kind: StopKind::Pickup,
            address: drop.pickup.address.clone(),
            lat: drop.pickup.point.lat,
            lng: drop.pickup.point.lng,
            estimated_time: cursor,
        });
        let delivered = cursor + Duration::minutes(drop.estimated_duration_min);
        stops.push(PreviewStop {
            sequence: stops.len() + 1,
            drop_id: drop.id.clone(),
            kind: StopKind::Delivery,
            address: drop.delivery.address.clone(),
            lat: drop.delivery.point.lat,
            lng: drop.delivery.point.lng,
            estimated_time: delivered,
        });
        cursor = delivered + Duration::minutes(buffer_min);
    }
    stops
}

fn proposal_preview(proposal: &RouteProposal, warnings: &[String], buffer_min: i64) -> RoutePreview {
    RoutePreview {
        estimated_duration_min: proposal.estimated_duration_min,
        estimated_distance_km: proposal.total_distance_km,
        total_drops: proposal.drops.len(),
        total_value_pence: proposal.total_value_pence,
        service_tier: proposal.service_tier,
        stops: plan_stops(&proposal.drops, proposal.proposed_start_time, buffer_min),
        warnings: warnings.to_vec(),
        unrouted_booking_ids: Vec::new(),
    }
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<sqlx::Error>(),
            Some(sqlx::Error::Database(e)) if e.is_unique_violation()
        )
    })
}

/// Route row built from a set of drops.
struct RouteDraft<'a> {
    drops: &'a [Drop],
    status: RouteStatus,
    origin: RouteOrigin,
    driver_id: Option<String>,
    start_time: DateTime<Utc>,
    service_tier: ServiceTier,
    distance_km: f64,
    duration_min: i64,
    notes: Option<String>,
    created_by: String,
}

impl RouteDraft<'_> {
    fn into_route(self, now: DateTime<Utc>) -> Route {
        Route {
            id: db::new_id("rt"),
            driver_id: self.driver_id,
            status: self.status,
            origin: self.origin,
            start_time: self.start_time,
            service_tier: self.service_tier,
            total_drops: self.drops.len() as i64,
            completed_drops: 0,
            total_value_pence: self.drops.iter().map(|d| d.value_pence).sum(),
            total_weight_kg: self.drops.iter().map(|d| d.weight_kg).sum(),
            total_volume_m3: self.drops.iter().map(|d| d.volume_m3).sum(),
            distance_km: self.distance_km,
            estimated_duration_min: self.duration_min,
            notes: self.notes,
            created_by: self.created_by,
            created_at: now,
            updated_at: now,
        }
    }
}

pub struct RouteManager {
    pool: SqlitePool,
    limits: config::Orchestration,
    earnings: config::Earnings,
    rate_card: RateCard,
    run_guard: Mutex<()>,
}

impl RouteManager {
    pub fn new(pool: SqlitePool, cfg: &Config) -> Self {
        Self::with_limits(pool, cfg.orchestration.clone(), cfg.earnings.clone())
    }

    pub fn with_limits(pool: SqlitePool, limits: config::Orchestration, earnings: config::Earnings) -> Self {
        let rate_card = RateCard::scaled(earnings.driver_rate_multiplier);
        Self {
            pool,
            limits,
            earnings,
            rate_card,
            run_guard: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn buffer_min(&self) -> i64 {
        EngineConfig::default().buffer_min_per_drop
    }

    // -----------------------------------------------------------------------
    // settings

    #[instrument(skip_all)]
    pub async fn settings(&self) -> RoutingResult<RoutingSettings> {
        let mut conn = self.pool.acquire().await?;
        Ok(db::get_or_create_settings(&mut conn, Utc::now()).await?)
    }

    #[instrument(skip(self))]
    pub async fn set_routing_mode(&self, mode: RoutingMode, admin_id: &str) -> RoutingResult<RoutingSettings> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut settings = db::get_or_create_settings(&mut tx, now).await?;
        let old_mode = settings.routing_mode;
        settings.routing_mode = mode;
        settings.auto_routing_enabled = mode == RoutingMode::Auto;
        settings.updated_by = admin_id.to_string();
        settings.updated_at = now;
        db::save_settings(&mut tx, &settings).await?;
        let entry = NewAuditEntry::info("routing_mode_changed", "set_routing_mode", admin_id, ActorType::Admin)
            .target("routing_settings", "1")
            .details(json!({ "old_mode": old_mode, "new_mode": mode }));
        db::insert_audit(&mut tx, &entry, now).await?;
        tx.commit().await?;
        info!(%old_mode, new_mode = %mode, admin_id, "routing mode changed");
        Ok(settings)
    }

    #[instrument(skip_all)]
    pub async fn update_settings(&self, patch: &SettingsPatch, admin_id: &str) -> RoutingResult<RoutingSettings> {
        patch.validate()?;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut settings = db::get_or_create_settings(&mut tx, now).await?;
        patch.apply(&mut settings);
        settings.updated_by = admin_id.to_string();
        settings.updated_at = now;
        db::save_settings(&mut tx, &settings).await?;
        let entry = NewAuditEntry::info("routing_settings_updated", "update_settings", admin_id, ActorType::Admin)
            .target("routing_settings", "1")
            .details(json!({ "changes": patch }));
        db::insert_audit(&mut tx, &entry, now).await?;
        tx.commit().await?;
        Ok(settings)
    }

    // -----------------------------------------------------------------------
    // auto-routing

    /// Clears a `running` status left behind by a pass that never finished,
    /// e.g. a crash mid-run. Returns true when a stale status was reset.
    pub async fn recover_interrupted_run(&self) -> RoutingResult<bool> {
        if self.run_guard.try_lock().is_err() {
            return Ok(false);
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let settings = db::get_or_create_settings(&mut tx, now).await?;
        if settings.auto_routing_status != AutoRoutingStatus::Running {
            return Ok(false);
        }
        db::set_auto_routing_status(&mut tx, AutoRoutingStatus::Idle, None, None).await?;
        let entry = NewAuditEntry::info("auto_routing_recovered", "recover_interrupted_run", "system", ActorType::System)
            .severity(Severity::Warning)
            .target("routing_settings", "1");
        db::insert_audit(&mut tx, &entry, now).await?;
        tx.commit().await?;
        warn!("reset auto-routing status left running by an interrupted pass");
        Ok(true)
    }

    /// One auto-routing pass. `force` ignores the enabled flag. Only one pass
    /// runs at a time; a concurrent call fails with `AlreadyRunning`.
    #[instrument(skip(self))]
    pub async fn run_auto_routing(&self, triggered_by: &str, force: bool) -> RoutingResult<AutoRoutingReport> {
        let _guard = self.run_guard.try_lock().map_err(|_| RoutingError::AlreadyRunning)?;
        let clock = Instant::now();
        let started_at = Utc::now();
        let mut report = AutoRoutingReport::new(started_at);

        let settings = self.settings().await?;
        if !settings.auto_routing_enabled && !force {
            report.errors.push("auto-routing is disabled".to_string());
            return Ok(report);
        }

        {
            let mut tx = self.pool.begin().await?;
            db::set_auto_routing_status(&mut tx, AutoRoutingStatus::Running, None, None).await?;
            let entry = NewAuditEntry::info("auto_routing_started", "run_auto_routing", triggered_by, ActorType::System)
                .details(json!({ "force": force }));
            db::insert_audit(&mut tx, &entry, started_at).await?;
            tx.commit().await?;
        }
        info!(triggered_by, "auto-routing started");

        let outcome = self.auto_routing_pass(&settings, triggered_by, &mut report).await;
        report.duration_ms = clock.elapsed().as_millis() as u64;

        let finished_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        match &outcome {
            Ok(()) => {
                report.success = report.routes_created > 0;
                db::set_auto_routing_status(&mut tx, AutoRoutingStatus::Idle, Some(finished_at), None).await?;
                let entry = NewAuditEntry::info(
                    "auto_routing_completed",
                    "run_auto_routing",
                    triggered_by,
                    ActorType::System,
                )
                .details(serde_json::to_value(&report).unwrap_or_default());
                db::insert_audit(&mut tx, &entry, finished_at).await?;
                info!(
                    routes = report.routes_created,
                    awaiting = report.routes_awaiting_approval,
                    unassigned = report.unassigned_drop_ids.len(),
                    duration_ms = report.duration_ms,
                    "auto-routing completed"
                );
            }
            Err(err) => {
                let message = err.to_string();
                report.errors.push(message.clone());
                db::set_auto_routing_status(&mut tx, AutoRoutingStatus::Error, Some(finished_at), Some(&message))
                    .await?;
                let entry = NewAuditEntry::info("auto_routing_failed", "run_auto_routing", triggered_by, ActorType::System)
                    .details(serde_json::to_value(&report).unwrap_or_default())
                    .failed(message.clone());
                db::insert_audit(&mut tx, &entry, finished_at).await?;
                error!(error = %message, "auto-routing failed");
            }
        }
        tx.commit().await?;
        Ok(report)
    }

    async fn auto_routing_pass(
        &self,
        settings: &RoutingSettings,
        triggered_by: &str,
        report: &mut AutoRoutingReport,
    ) -> RoutingResult<()> {
        let now = Utc::now();
        let horizon = now + Duration::hours(self.limits.booking_horizon_hours);

        let drops = {
            let mut tx = self.pool.begin().await?;
            let bookings =
                db::fetch_routable_bookings(&mut tx, now, horizon, self.limits.booking_batch_size).await?;
            report.bookings_processed = bookings.len();
            if (bookings.len() as i64) < settings.min_drops_for_auto_route {
                report.errors.push(format!(
                    "not enough bookings for auto-routing ({} < {})",
                    bookings.len(),
                    settings.min_drops_for_auto_route
                ));
                return Ok(());
            }
            let (drops, created) = pending_drops_for(&mut tx, &bookings, now).await?;
            tx.commit().await?;
            report.drops_created = created;
            drops
        };

        if drops.is_empty() {
            report.errors.push("no valid drops created from bookings".to_string());
            return Ok(());
        }

        let engine = EngineConfig::from_settings(settings, &self.limits);
        let result = orchestration::orchestrate(&drops, &engine, &OrchestrateOptions::default());
        report.warnings.extend(result.warnings.iter().cloned());

        for proposal in &result.routes {
            match self.persist_proposal(proposal, settings, &result.warnings, triggered_by).await {
                Ok(route) => {
                    report.routes_created += 1;
                    match route.status {
                        RouteStatus::Pending => report.routes_awaiting_approval += 1,
                        RouteStatus::Assigned => report.routes_assigned += 1,
                        _ => {}
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to persist route proposal");
                    report.errors.push(format!("failed to create route: {}", err));
                }
            }
        }

        report.unassigned_drop_ids = result.unassigned.iter().map(|d| d.id.clone()).collect();
        if !report.unassigned_drop_ids.is_empty() {
            report.errors.push(format!(
                "{} drops could not be assigned to routes",
                report.unassigned_drop_ids.len()
            ));
            let mut conn = self.pool.acquire().await?;
            let entry = NewAuditEntry::info("auto_routing_unassigned", "log_unassigned", triggered_by, ActorType::System)
                .severity(Severity::Warning)
                .details(json!({
                    "unassigned_count": report.unassigned_drop_ids.len(),
                    "unassigned_ids": report.unassigned_drop_ids,
                }));
            db::insert_audit(&mut conn, &entry, Utc::now()).await?;
        }
        Ok(())
    }

    async fn persist_proposal(
        &self,
        proposal: &RouteProposal,
        settings: &RoutingSettings,
        warnings: &[String],
        triggered_by: &str,
    ) -> RoutingResult<Route> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let driver = if settings.auto_assign_drivers {
            db::find_available_driver(&mut tx).await?
        } else {
            None
        };
        let status = match (settings.require_admin_approval, &driver) {
            (true, _) => RouteStatus::Pending,
            (false, Some(_)) => RouteStatus::Assigned,
            (false, None) => RouteStatus::Planned,
        };

        let route = RouteDraft {
            drops: &proposal.drops,
            status,
            origin: RouteOrigin::Auto,
            driver_id: driver.as_ref().map(|d| d.id.clone()),
            start_time: proposal.proposed_start_time,
            service_tier: proposal.service_tier,
            distance_km: proposal.total_distance_km,
            duration_min: proposal.estimated_duration_min,
            notes: None,
            created_by: triggered_by.to_string(),
        }
        .into_route(now);
        db::insert_route(&mut tx, &route).await?;
        link_route_drops(&mut tx, &route.id, &proposal.drops).await?;

        if status == RouteStatus::Pending {
            let preview = proposal_preview(proposal, warnings, self.buffer_min());
            let approval = new_approval(&route, triggered_by, true, &preview, now)?;
            db::insert_approval(&mut tx, &approval).await?;
        }
        if let (RouteStatus::Assigned, Some(driver)) = (status, &driver) {
            assign_in_tx(&mut tx, &route.id, &driver.id, now).await?;
        }

        let entry = NewAuditEntry::info("route_created", "create_auto_route", triggered_by, ActorType::System)
            .target("route", &route.id)
            .details(json!({
                "status": status,
                "drops": route.total_drops,
                "driver_id": route.driver_id,
                "total_value_pence": route.total_value_pence,
            }));
        db::insert_audit(&mut tx, &entry, now).await?;
        tx.commit().await?;
        Ok(route)
    }

    // -----------------------------------------------------------------------
    // manual routes

    #[instrument(skip_all)]
    pub async fn create_manual_route(&self, input: &ManualRouteInput) -> RoutingResult<ManualRouteOutcome> {
        let ids = match (input.drop_ids.is_empty(), input.booking_ids.is_empty()) {
            (false, true) => &input.drop_ids,
            (true, false) => &input.booking_ids,
            _ => {
                return Err(RoutingError::Invalid(
                    "provide either drop_ids or booking_ids".into(),
                ))
            }
        };
        let unique: HashSet<&String> = ids.iter().collect();
        if unique.len() != ids.len() {
            return Err(RoutingError::Invalid("duplicate ids in request".into()));
        }
        if input.admin_id.trim().is_empty() {
            return Err(RoutingError::Invalid("admin_id must not be empty".into()));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let settings = db::get_or_create_settings(&mut tx, now).await?;

        let driver = match &input.driver_id {
            Some(id) => Some(require_active_driver(&mut tx, id).await?),
            None => None,
        };

        let drops = if input.drop_ids.is_empty() {
            drops_for_manual_bookings(&mut tx, &input.booking_ids, now).await?
        } else {
            available_drops(&mut tx, &input.drop_ids).await?
        };

        let requires_approval = settings.require_admin_approval && !input.skip_approval;
        let status = match (requires_approval, &driver) {
            (true, _) => RouteStatus::Pending,
            (false, Some(_)) => RouteStatus::Assigned,
            (false, None) => RouteStatus::Planned,
        };
        let buffer = self.buffer_min();
        let route = RouteDraft {
            drops: &drops,
            status,
            origin: RouteOrigin::Manual,
            driver_id: driver.as_ref().map(|d| d.id.clone()),
            start_time: input.start_time,
            service_tier: input
                .service_tier
                .unwrap_or_else(|| orchestration::majority_tier(&drops)),
            distance_km: orchestration::route_distance_km(&drops),
            duration_min: orchestration::route_duration_min(&drops, buffer),
            notes: input.notes.clone(),
            created_by: input.admin_id.clone(),
        }
        .into_route(now);
        db::insert_route(&mut tx, &route).await?;
        link_route_drops(&mut tx, &route.id, &drops).await?;

        let mut approval = None;
        let mut assignment = None;
        if status == RouteStatus::Pending {
            let preview = RoutePreview {
                estimated_duration_min: route.estimated_duration_min,
                estimated_distance_km: route.distance_km,
                total_drops: drops.len(),
                total_value_pence: route.total_value_pence,
                service_tier: route.service_tier,
                stops: plan_stops(&drops, route.start_time, buffer),
                warnings: Vec::new(),
                unrouted_booking_ids: Vec::new(),
            };
            let record = new_approval(&route, &input.admin_id, false, &preview, now)?;
            db::insert_approval(&mut tx, &record).await?;
            approval = Some(record);
        }
        if let (RouteStatus::Assigned, Some(driver)) = (status, &driver) {
            assignment = Some(assign_in_tx(&mut tx, &route.id, &driver.id, now).await?);
        }

        let entry = NewAuditEntry::info("route_created_manual", "create_manual_route", &input.admin_id, ActorType::Admin)
            .target("route", &route.id)
            .details(json!({
                "status": status,
                "drop_ids": drops.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
                "driver_id": route.driver_id,
                "skip_approval": input.skip_approval,
            }));
        db::insert_audit(&mut tx, &entry, now).await?;
        tx.commit().await?;

        let message = match status {
            RouteStatus::Pending => "Route created and awaiting admin approval",
            RouteStatus::Assigned => "Route created and assigned to driver",
            _ => "Route created",
        };
        info!(route_id = %route.id, %status, drops = route.total_drops, "manual route created");
        Ok(ManualRouteOutcome {
            route,
            requires_approval,
            approval,
            assignment,
            message: message.to_string(),
        })
    }

    /// Engine preview over a set of bookings; nothing is persisted.
    #[instrument(skip_all)]
    pub async fn preview_route(&self, booking_ids: &[String]) -> RoutingResult<RoutePreview> {
        if booking_ids.is_empty() {
            return Err(RoutingError::Invalid("booking_ids must not be empty".into()));
        }
        let (bookings, settings) = {
            let mut conn = self.pool.acquire().await?;
            let bookings = db::get_bookings(&mut conn, booking_ids).await?;
            let settings = db::get_or_create_settings(&mut conn, Utc::now()).await?;
            (bookings, settings)
        };
        if let Some(missing) = missing_ids(booking_ids, bookings.iter().map(|b| &b.id)) {
            return Err(RoutingError::NotFound(format!("bookings {}", missing)));
        }

        let mut warnings = Vec::new();
        let drops: Vec<Drop> = bookings
            .iter()
            .filter_map(|b| {
                let drop = booking::drop_from_booking(b, format!("preview_{}", b.id));
                if drop.is_none() {
                    warnings.push(format!("booking {} has no coordinates", b.reference));
                }
                drop
            })
            .collect();

        let engine = EngineConfig::from_settings(&settings, &self.limits);
        let options = OrchestrateOptions {
            emergency_mode: true,
            ..OrchestrateOptions::default()
        };
        let result = orchestration::orchestrate(&drops, &engine, &options);
        let Some(best) = result.routes.first() else {
            return Err(RoutingError::Invalid("no viable routes could be generated".into()));
        };

        warnings.extend(result.warnings.iter().cloned());
        let mut preview = proposal_preview(best, &warnings, engine.buffer_min_per_drop);
        let routed: HashSet<&str> = best.drops.iter().filter_map(|d| d.booking_id.as_deref()).collect();
        preview.unrouted_booking_ids = booking_ids
            .iter()
            .filter(|id| !routed.contains(id.as_str()))
            .cloned()
            .collect();
        Ok(preview)
    }

    // -----------------------------------------------------------------------
    // approval workflow

    #[instrument(skip(self))]
    pub async fn approve_route(
        &self,
        route_id: &str,
        admin_id: &str,
        driver_id: Option<&str>,
    ) -> RoutingResult<Route> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let route = require_route(&mut tx, route_id).await?;
        if route.status != RouteStatus::Pending {
            return Err(RoutingError::Conflict(format!(
                "route {} is not awaiting approval (status {})",
                route_id, route.status
            )));
        }
        let driver_id = match (driver_id, route.driver_id.as_deref()) {
            (Some(id), _) => Some(id.to_string()),
            (None, Some(proposed)) => {
                if db::driver_has_active_route(&mut tx, proposed, route_id).await? {
                    warn!(route_id, driver_id = proposed, "proposed driver is busy; route left unassigned");
                    None
                } else {
                    Some(proposed.to_string())
                }
            }
            (None, None) => None,
        };
        let driver = match &driver_id {
            Some(id) => Some(require_active_driver(&mut tx, id).await?),
            None => None,
        };

        if !db::review_approval(&mut tx, route_id, ApprovalStatus::Approved, admin_id, None, now).await? {
            return Err(RoutingError::Conflict(format!("route {} has no pending approval", route_id)));
        }
        let next = if driver.is_some() { RouteStatus::Assigned } else { RouteStatus::Planned };
        db::transition_route(&mut tx, route_id, &[RouteStatus::Pending], next, driver_id.as_deref(), now).await?;
        if let Some(driver) = &driver {
            assign_in_tx(&mut tx, route_id, &driver.id, now).await?;
        }

        let entry = NewAuditEntry::info("route_approved", "approve_route", admin_id, ActorType::Admin)
            .target("route", route_id)
            .details(json!({ "driver_id": driver_id, "status": next }));
        db::insert_audit(&mut tx, &entry, now).await?;
        let route = require_route(&mut tx, route_id).await?;
        tx.commit().await?;
        info!(route_id, admin_id, status = %route.status, "route approved");
        Ok(route)
    }

    #[instrument(skip(self))]
    pub async fn reject_route(&self, route_id: &str, admin_id: &str, reason: &str) -> RoutingResult<Route> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(RoutingError::Invalid("rejection reason must not be empty".into()));
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let route = require_route(&mut tx, route_id).await?;
        if route.status != RouteStatus::Pending {
            return Err(RoutingError::Conflict(format!(
                "route {} is not awaiting approval (status {})",
                route_id, route.status
            )));
        }
        if !db::review_approval(&mut tx, route_id, ApprovalStatus::Rejected, admin_id, Some(reason), now).await? {
            return Err(RoutingError::Conflict(format!("route {} has no pending approval", route_id)));
        }
        db::transition_route(&mut tx, route_id, &[RouteStatus::Pending], RouteStatus::Cancelled, None, now).await?;
        let drops = db::release_drops(&mut tx, route_id).await?;
        let bookings = db::release_bookings(&mut tx, route_id).await?;

        let entry = NewAuditEntry::info("route_rejected", "reject_route", admin_id, ActorType::Admin)
            .severity(Severity::Warning)
            .target("route", route_id)
            .details(json!({
                "reason": reason,
                "released_drops": drops,
                "released_bookings": bookings,
            }));
        db::insert_audit(&mut tx, &entry, now).await?;
        let route = require_route(&mut tx, route_id).await?;
        tx.commit().await?;
        info!(route_id, admin_id, released_drops = drops, "route rejected");
        Ok(route)
    }

    // -----------------------------------------------------------------------
    // dispatch

    #[instrument(skip(self))]
    pub async fn assign_driver(&self, route_id: &str, driver_id: &str, admin_id: &str) -> RoutingResult<Route> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let route = require_route(&mut tx, route_id).await?;
        if !matches!(route.status, RouteStatus::Planned | RouteStatus::Assigned) {
            return Err(RoutingError::Conflict(format!(
                "route {} cannot be assigned in status {}",
                route_id, route.status
            )));
        }
        if route.status == RouteStatus::Assigned && route.driver_id.as_deref() == Some(driver_id) {
            return Err(RoutingError::Conflict(format!(
                "route {} is already assigned to {}",
                route_id, driver_id
            )));
        }
        let driver = require_active_driver(&mut tx, driver_id).await?;
        if driver.availability != DriverAvailability::Online {
            return Err(RoutingError::Invalid(format!("driver {} is not online", driver_id)));
        }

        let replaced = db::close_active_assignment(&mut tx, route_id, AssignmentStatus::Cancelled, now).await?;
        db::transition_route(
            &mut tx,
            route_id,
            &[RouteStatus::Planned, RouteStatus::Assigned],
            RouteStatus::Assigned,
            Some(driver_id),
            now,
        )
        .await?;
        assign_in_tx(&mut tx, route_id, driver_id, now).await?;

        let entry = NewAuditEntry::info("route_assigned", "assign_driver", admin_id, ActorType::Admin)
            .target("route", route_id)
            .details(json!({
                "driver_id": driver_id,
                "previous_driver_id": route.driver_id,
                "replaced_assignments": replaced,
            }));
        db::insert_audit(&mut tx, &entry, now).await?;
        let route = require_route(&mut tx, route_id).await?;
        tx.commit().await?;
        Ok(route)
    }

    #[instrument(skip(self))]
    pub async fn decline_route(&self, route_id: &str, driver_id: &str) -> RoutingResult<Route> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let route = require_driver_route(&mut tx, route_id, driver_id).await?;
        if route.status != RouteStatus::Assigned {
            return Err(RoutingError::Conflict(format!(
                "route {} cannot be declined in status {}",
                route_id, route.status
            )));
        }
        db::close_active_assignment(&mut tx, route_id, AssignmentStatus::Declined, now).await?;
        db::transition_route(&mut tx, route_id, &[RouteStatus::Assigned], RouteStatus::Planned, None, now).await?;
        let entry = NewAuditEntry::info("route_declined", "decline_route", driver_id, ActorType::Driver)
            .severity(Severity::Warning)
            .target("route", route_id);
        db::insert_audit(&mut tx, &entry, now).await?;
        let route = require_route(&mut tx, route_id).await?;
        tx.commit().await?;
        info!(route_id, driver_id, "route declined");
        Ok(route)
    }

    #[instrument(skip(self))]
    pub async fn start_route(&self, route_id: &str, driver_id: &str) -> RoutingResult<Route> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let route = require_driver_route(&mut tx, route_id, driver_id).await?;
        if route.status != RouteStatus::Assigned {
            return Err(RoutingError::Conflict(format!(
                "route {} cannot be started in status {}",
                route_id, route.status
            )));
        }
        db::transition_route(
            &mut tx,
            route_id,
            &[RouteStatus::Assigned],
            RouteStatus::InProgress,
            Some(driver_id),
            now,
        )
        .await?;
        let entry = NewAuditEntry::info("route_started", "start_route", driver_id, ActorType::Driver)
            .target("route", route_id);
        db::insert_audit(&mut tx, &entry, now).await?;
        let route = require_route(&mut tx, route_id).await?;
        tx.commit().await?;
        Ok(route)
    }

    /// Mark one drop delivered. The last delivery completes the route, its
    /// bookings and assignment, and records the driver's earnings.
    #[instrument(skip(self))]
    pub async fn complete_drop(&self, route_id: &str, drop_id: &str, driver_id: &str) -> RoutingResult<DropCompletion> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let route = require_driver_route(&mut tx, route_id, driver_id).await?;
        if route.status != RouteStatus::InProgress {
            return Err(RoutingError::Conflict(format!(
                "route {} is not in progress (status {})",
                route_id, route.status
            )));
        }
        if !db::mark_drop_delivered(&mut tx, route_id, drop_id).await? {
            let drops = db::drops_for_route(&mut tx, route_id).await?;
            return match drops.iter().find(|d| d.id == drop_id) {
                None => Err(RoutingError::NotFound(format!("drop {} on route {}", drop_id, route_id))),
                Some(d) => Err(RoutingError::Conflict(format!("drop {} is already {}", drop_id, d.status))),
            };
        }
        let completed = db::increment_completed_drops(&mut tx, route_id, now).await?;
        let entry = NewAuditEntry::info("drop_completed", "complete_drop", driver_id, ActorType::Driver)
            .target("drop", drop_id)
            .details(json!({ "route_id": route_id, "completed_drops": completed }));
        db::insert_audit(&mut tx, &entry, now).await?;

        let mut earnings = None;
        let route_completed = completed >= route.total_drops;
        if route_completed {
            db::transition_route(
                &mut tx,
                route_id,
                &[RouteStatus::InProgress],
                RouteStatus::Completed,
                Some(driver_id),
                now,
            )
            .await?;
            db::complete_bookings(&mut tx, route_id).await?;
            db::close_active_assignment(&mut tx, route_id, AssignmentStatus::Completed, now).await?;
            earnings = Some(self.record_route_earnings(&mut tx, &route, driver_id, now).await?);
            let entry = NewAuditEntry::info("route_completed", "complete_route", driver_id, ActorType::Driver)
                .target("route", route_id)
                .details(json!({
                    "total_drops": route.total_drops,
                    "earnings_pence": earnings.as_ref().map(|e| e.total_earnings_pence),
                }));
            db::insert_audit(&mut tx, &entry, now).await?;
        }

        let route = require_route(&mut tx, route_id).await?;
        tx.commit().await?;
        Ok(DropCompletion {
            route,
            drop_id: drop_id.to_string(),
            route_completed,
            earnings,
        })
    }

    async fn record_route_earnings(
        &self,
        conn: &mut SqliteConnection,
        route: &Route,
        driver_id: &str,
        now: DateTime<Utc>,
    ) -> RoutingResult<RouteEarnings> {
        let drops = db::drops_for_route(conn, &route.id).await?;
        let estimate = earnings::route_earnings(&self.rate_card, route, &drops);
        let daily = DailyCap {
            cap_pence: self.earnings.daily_cap_pence,
            earned_today_pence: db::earned_on_day(conn, driver_id, now).await?,
        };
        let (net, capped) = daily.apply(estimate.total_earnings_pence);
        if capped {
            warn!(route_id = %route.id, driver_id, net, "daily earnings cap applied");
        }
        let record = EarningsRecord {
            id: db::new_id("ern"),
            driver_id: driver_id.to_string(),
            route_id: Some(route.id.clone()),
            drop_id: None,
            base_pence: estimate.breakdowns.iter().map(|b| b.base_fare).sum(),
            gross_pence: estimate.total_gross_pence,
            capped_net_pence: estimate.total_earnings_pence,
            net_pence: net,
            requires_admin_approval: estimate.requires_admin_approval || (capped && net == 0),
            calculated_at: now,
        };
        db::insert_earnings(conn, &record).await?;
        Ok(estimate)
    }

    // -----------------------------------------------------------------------
    // bookings and drivers

    #[instrument(skip_all)]
    pub async fn create_booking(&self, input: NewBooking, admin_id: &str) -> RoutingResult<Booking> {
        let booking = booking::prepare(input).map_err(RoutingError::Invalid)?;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let created = match db::insert_booking(&mut tx, &booking, now).await {
            Ok(b) => b,
            Err(err) if is_unique_violation(&err) => {
                return Err(RoutingError::Conflict(format!(
                    "booking reference {} already exists",
                    booking.reference
                )))
            }
            Err(err) => return Err(err.into()),
        };
        let entry = NewAuditEntry::info("booking_created", "create_booking", admin_id, ActorType::Admin)
            .target("booking", &created.id)
            .details(json!({ "reference": created.reference, "status": created.status }));
        db::insert_audit(&mut tx, &entry, now).await?;
        tx.commit().await?;
        Ok(created)
    }

    #[instrument(skip_all)]
    pub async fn create_driver(&self, driver: NewDriver, admin_id: &str) -> RoutingResult<Driver> {
        if driver.name.trim().is_empty() {
            return Err(RoutingError::Invalid("driver name must not be empty".into()));
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let created = db::insert_driver(&mut tx, &driver, now).await?;
        let entry = NewAuditEntry::info("driver_created", "create_driver", admin_id, ActorType::Admin)
            .target("driver", &created.id);
        db::insert_audit(&mut tx, &entry, now).await?;
        tx.commit().await?;
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn set_driver_availability(
        &self,
        driver_id: &str,
        availability: DriverAvailability,
        actor: &str,
        actor_type: ActorType,
    ) -> RoutingResult<Driver> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        if !db::set_driver_availability(&mut tx, driver_id, availability).await? {
            return Err(RoutingError::NotFound(format!("driver {}", driver_id)));
        }
        let entry = NewAuditEntry::info("driver_availability_changed", "set_availability", actor, actor_type)
            .target("driver", driver_id)
            .details(json!({ "availability": availability }));
        db::insert_audit(&mut tx, &entry, now).await?;
        let driver = db::get_driver(&mut tx, driver_id)
            .await?
            .ok_or_else(|| RoutingError::NotFound(format!("driver {}", driver_id)))?;
        tx.commit().await?;
        Ok(driver)
    }

    pub async fn list_drivers(&self) -> RoutingResult<Vec<Driver>> {
        let mut conn = self.pool.acquire().await?;
        Ok(db::list_drivers(&mut conn).await?)
    }

    // -----------------------------------------------------------------------
    // queries

    pub async fn pending_approvals(&self) -> RoutingResult<Vec<PendingApproval>> {
        let mut conn = self.pool.acquire().await?;
        let approvals = db::pending_approvals(&mut conn).await?;
        let mut out = Vec::with_capacity(approvals.len());
        for approval in approvals {
            if let Some(route) = db::get_route(&mut conn, &approval.route_id).await? {
                out.push(PendingApproval { approval, route });
            }
        }
        Ok(out)
    }

    pub async fn auto_routing_history(&self, limit: i64) -> RoutingResult<Vec<AuditEntry>> {
        let mut conn = self.pool.acquire().await?;
        Ok(db::list_audit(&mut conn, AUTO_ROUTING_EVENTS, limit.clamp(1, 500)).await?)
    }

    pub async fn list_routes(&self, status: Option<RouteStatus>, limit: i64) -> RoutingResult<Vec<Route>> {
        let mut conn = self.pool.acquire().await?;
        Ok(db::list_routes(&mut conn, status, None, limit.clamp(1, 500)).await?)
    }

    pub async fn route_detail(&self, route_id: &str) -> RoutingResult<RouteDetail> {
        let mut conn = self.pool.acquire().await?;
        let route = require_route(&mut conn, route_id).await?;
        Ok(RouteDetail {
            drops: db::drops_for_route(&mut conn, route_id).await?,
            approval: db::approval_for_route(&mut conn, route_id).await?,
            assignments: db::list_assignments(&mut conn, route_id).await?,
            route,
        })
    }

    pub async fn route_earnings(&self, route_id: &str) -> RoutingResult<RouteEarnings> {
        let mut conn = self.pool.acquire().await?;
        let route = require_route(&mut conn, route_id).await?;
        let drops = db::drops_for_route(&mut conn, route_id).await?;
        Ok(earnings::route_earnings(&self.rate_card, &route, &drops))
    }

    pub async fn driver_routes(&self, driver_id: &str) -> RoutingResult<Vec<Route>> {
        let mut conn = self.pool.acquire().await?;
        Ok(db::routes_for_driver(&mut conn, driver_id).await?)
    }

    pub async fn driver_route_earnings(&self, route_id: &str, driver_id: &str) -> RoutingResult<RouteEarnings> {
        let mut conn = self.pool.acquire().await?;
        let route = require_driver_route(&mut conn, route_id, driver_id).await?;
        let drops = db::drops_for_route(&mut conn, route_id).await?;
        Ok(earnings::route_earnings(&self.rate_card, &route, &drops))
    }
}

fn missing_ids<'a>(requested: &'a [String], found: impl Iterator<Item = &'a String>) -> Option<String> {
    let found: HashSet<&String> = found.collect();
    let missing: Vec<&str> = requested
        .iter()
        .filter(|id| !found.contains(id))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(missing.join(", "))
    }
}

async fn require_route(conn: &mut SqliteConnection, route_id: &str) -> RoutingResult<Route> {
    db::get_route(conn, route_id)
        .await?
        .ok_or_else(|| RoutingError::NotFound(format!("route {}", route_id)))
}

/// Route addressed to `driver_id`. Other drivers' routes and routes still
/// awaiting approval read as not found.
async fn require_driver_route(conn: &mut SqliteConnection, route_id: &str, driver_id: &str) -> RoutingResult<Route> {
    let route = require_route(conn, route_id).await?;
    if route.driver_id.as_deref() != Some(driver_id) || route.status == RouteStatus::Pending {
        return Err(RoutingError::NotFound(format!("route {}", route_id)));
    }
    Ok(route)
}

async fn require_active_driver(conn: &mut SqliteConnection, driver_id: &str) -> RoutingResult<Driver> {
    let driver = db::get_driver(conn, driver_id)
        .await?
        .ok_or_else(|| RoutingError::NotFound(format!("driver {}", driver_id)))?;
    if driver.status != DriverStatus::Active {
        return Err(RoutingError::Invalid(format!("driver {} is {}", driver_id, driver.status)));
    }
    Ok(driver)
}

/// Pending drops for auto-routing: reuse an unrouted drop already created for
/// a booking, otherwise convert the booking. Bookings without coordinates
/// are skipped. Returns the drops and how many were created.
async fn pending_drops_for(
    conn: &mut SqliteConnection,
    bookings: &[Booking],
    now: DateTime<Utc>,
) -> RoutingResult<(Vec<Drop>, usize)> {
    let mut drops = Vec::with_capacity(bookings.len());
    let mut created = 0;
    for b in bookings {
        if let Some(existing) = db::find_drop_by_booking(conn, &b.id).await? {
            if existing.status == DropStatus::Pending && existing.route_id.is_none() {
                drops.push(existing);
            }
            continue;
        }
        match booking::drop_from_booking(b, db::new_id("drp")) {
            Some(drop) => {
                db::insert_drop(conn, &drop, now).await?;
                created += 1;
                drops.push(drop);
            }
            None => warn!(booking_id = %b.id, "booking has no coordinates; skipped"),
        }
    }
    Ok((drops, created))
}

/// Drops for the requested bookings in request order. Every booking must be
/// confirmed, unrouted and geocoded.
async fn drops_for_manual_bookings(
    conn: &mut SqliteConnection,
    booking_ids: &[String],
    now: DateTime<Utc>,
) -> RoutingResult<Vec<Drop>> {
    let bookings = db::get_bookings(conn, booking_ids).await?;
    if let Some(missing) = missing_ids(booking_ids, bookings.iter().map(|b| &b.id)) {
        return Err(RoutingError::NotFound(format!("bookings {}", missing)));
    }
    let unavailable: Vec<&str> = bookings
        .iter()
        .filter(|b| b.status != BookingStatus::Confirmed || b.route_id.is_some())
        .map(|b| b.id.as_str())
        .collect();
    if !unavailable.is_empty() {
        return Err(RoutingError::Conflict(format!(
            "bookings not available for routing: {}",
            unavailable.join(", ")
        )));
    }

    let mut drops = Vec::with_capacity(booking_ids.len());
    for id in booking_ids {
        let Some(b) = bookings.iter().find(|b| &b.id == id) else {
            continue;
        };
        match db::find_drop_by_booking(conn, &b.id).await? {
            Some(existing) if existing.status == DropStatus::Pending && existing.route_id.is_none() => {
                drops.push(existing)
            }
            Some(_) => {
                return Err(RoutingError::Conflict(format!(
                    "booking {} already has a routed drop",
                    b.id
                )))
            }
            None => {
                let drop = booking::drop_from_booking(b, db::new_id("drp")).ok_or_else(|| {
                    RoutingError::Invalid(format!("booking {} has no coordinates", b.id))
                })?;
                db::insert_drop(conn, &drop, now).await?;
                drops.push(drop);
            }
        }
    }
    Ok(drops)
}

/// Requested drops in request order; all must exist and be unrouted.
async fn available_drops(conn: &mut SqliteConnection, drop_ids: &[String]) -> RoutingResult<Vec<Drop>> {
    let found = db::get_drops(conn, drop_ids).await?;
    if let Some(missing) = missing_ids(drop_ids, found.iter().map(|d| &d.id)) {
        return Err(RoutingError::NotFound(format!("drops {}", missing)));
    }
    let unavailable: Vec<&str> = found
        .iter()
        .filter(|d| d.status != DropStatus::Pending || d.route_id.is_some())
        .map(|d| d.id.as_str())
        .collect();
    if !unavailable.is_empty() {
        return Err(RoutingError::Conflict(format!(
            "drops not available for routing: {}",
            unavailable.join(", ")
        )));
    }
    let mut ordered = Vec::with_capacity(drop_ids.len());
    for id in drop_ids {
        if let Some(d) = found.iter().find(|d| &d.id == id) {
            ordered.push(d.clone());
        }
    }
    Ok(ordered)
}

/// Link drops (and their bookings) to a new route in order. Any drop or
/// booking taken by someone else in the meantime aborts with a conflict.
async fn link_route_drops(conn: &mut SqliteConnection, route_id: &str, drops: &[Drop]) -> RoutingResult<()> {
    for (index, drop) in drops.iter().enumerate() {
        if !db::link_drop(conn, &drop.id, route_id, index as i64 + 1).await? {
            return Err(RoutingError::Conflict(format!("drop {} is no longer available", drop.id)));
        }
        if let Some(booking_id) = &drop.booking_id {
            if !db::link_booking(conn, booking_id, route_id).await? {
                return Err(RoutingError::Conflict(format!(
                    "booking {} is no longer available",
                    booking_id
                )));
            }
        }
    }
    Ok(())
}

async fn assign_in_tx(
    conn: &mut SqliteConnection,
    route_id: &str,
    driver_id: &str,
    now: DateTime<Utc>,
) -> RoutingResult<Assignment> {
    let assignment = db::insert_assignment(conn, route_id, driver_id, now).await?;
    db::enqueue_outbox(conn, OutboxKind::RouteAssigned, route_id, driver_id, now).await?;
    Ok(assignment)
}

fn new_approval(
    route: &Route,
    submitted_by: &str,
    auto_generated: bool,
    preview: &RoutePreview,
    now: DateTime<Utc>,
) -> RoutingResult<RouteApproval> {
    use anyhow::Context;
    Ok(RouteApproval {
        id: db::new_id("apr"),
        route_id: route.id.clone(),
        status: ApprovalStatus::Pending,
        submitted_by: submitted_by.to_string(),
        auto_generated,
        estimated_duration_min: route.estimated_duration_min,
        estimated_distance_km: route.distance_km,
        total_drops: route.total_drops,
        total_value_pence: route.total_value_pence,
        preview: serde_json::to_value(preview).context("failed to encode route preview")?,
        reviewed_by: None,
        reviewed_at: None,
        rejection_reason: None,
        submitted_at: now,
    })
}
