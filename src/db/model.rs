//! Row mappers and insert payloads used by the repository functions.
//!
//! Enum columns are stored as their `as_str()` text; an unknown value in a
//! row is reported as an error rather than silently defaulted.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::model::{
    ActorType, Address, ApprovalStatus, Assignment, AssignmentStatus, AuditEntry,
    AutoRoutingStatus, Booking, BookingStatus, Driver, DriverAvailability, DriverStatus, Drop,
    DropStatus, GeoPoint, Location, Route, RouteApproval, RouteOrigin, RouteStatus,
    RoutingMode, RoutingSettings, ServiceTier, Severity, TimeWindow, Urgency,
};

fn text_enum<T>(row: &SqliteRow, column: &str, parse: fn(&str) -> Option<T>) -> Result<T> {
    let raw: String = row.try_get(column)?;
    parse(&raw).ok_or_else(|| anyhow!("unknown {} value {:?}", column, raw))
}

pub(crate) fn booking_from_row(row: &SqliteRow) -> Result<Booking> {
    Ok(Booking {
        id: row.try_get("id")?,
        reference: row.try_get("reference")?,
        status: text_enum(row, "status", BookingStatus::parse)?,
        scheduled_at: row.try_get("scheduled_at")?,
        pickup: Address {
            label: row.try_get("pickup_label")?,
            postcode: row.try_get("pickup_postcode")?,
            lat: row.try_get("pickup_lat")?,
            lng: row.try_get("pickup_lng")?,
        },
        dropoff: Address {
            label: row.try_get("dropoff_label")?,
            postcode: row.try_get("dropoff_postcode")?,
            lat: row.try_get("dropoff_lat")?,
            lng: row.try_get("dropoff_lng")?,
        },
        total_pence: row.try_get("total_pence")?,
        urgency: text_enum(row, "urgency", Urgency::parse)?,
        estimated_duration_min: row.try_get("estimated_duration_min")?,
        distance_miles: row.try_get("distance_miles")?,
        weight_kg: row.try_get("weight_kg")?,
        volume_m3: row.try_get("volume_m3")?,
        service_tier: text_enum(row, "service_tier", ServiceTier::parse)?,
        route_id: row.try_get("route_id")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn drop_from_row(row: &SqliteRow) -> Result<Drop> {
    Ok(Drop {
        id: row.try_get("id")?,
        booking_id: row.try_get("booking_id")?,
        route_id: row.try_get("route_id")?,
        sequence: row.try_get("sequence")?,
        status: text_enum(row, "status", DropStatus::parse)?,
        pickup: Location {
            point: GeoPoint {
                lat: row.try_get("pickup_lat")?,
                lng: row.try_get("pickup_lng")?,
            },
            address: row.try_get("pickup_address")?,
        },
        delivery: Location {
            point: GeoPoint {
                lat: row.try_get("delivery_lat")?,
                lng: row.try_get("delivery_lng")?,
            },
            address: row.try_get("delivery_address")?,
        },
        window: TimeWindow {
            earliest: row.try_get("window_earliest")?,
            latest: row.try_get("window_latest")?,
        },
        weight_kg: row.try_get("weight_kg")?,
        volume_m3: row.try_get("volume_m3")?,
        service_tier: text_enum(row, "service_tier", ServiceTier::parse)?,
        priority: row.try_get("priority")?,
        estimated_duration_min: row.try_get("estimated_duration_min")?,
        value_pence: row.try_get("value_pence")?,
        distance_miles: row.try_get("distance_miles")?,
        urgency: text_enum(row, "urgency", Urgency::parse)?,
    })
}

pub(crate) fn driver_from_row(row: &SqliteRow) -> Result<Driver> {
    Ok(Driver {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        status: text_enum(row, "status", DriverStatus::parse)?,
        availability: text_enum(row, "availability", DriverAvailability::parse)?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn route_from_row(row: &SqliteRow) -> Result<Route> {
    Ok(Route {
        id: row.try_get("id")?,
        driver_id: row.try_get("driver_id")?,
        status: text_enum(row, "status", RouteStatus::parse)?,
        origin: text_enum(row, "origin", RouteOrigin::parse)?,
        start_time: row.try_get("start_time")?,
        service_tier: text_enum(row, "service_tier", ServiceTier::parse)?,
        total_drops: row.try_get("total_drops")?,
        completed_drops: row.try_get("completed_drops")?,
        total_value_pence: row.try_get("total_value_pence")?,
        total_weight_kg: row.try_get("total_weight_kg")?,
        total_volume_m3: row.try_get("total_volume_m3")?,
        distance_km: row.try_get("distance_km")?,
        estimated_duration_min: row.try_get("estimated_duration_min")?,
        notes: row.try_get("notes")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn assignment_from_row(row: &SqliteRow) -> Result<Assignment> {
    Ok(Assignment {
        id: row.try_get("id")?,
        route_id: row.try_get("route_id")?,
        driver_id: row.try_get("driver_id")?,
        status: text_enum(row, "status", AssignmentStatus::parse)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn approval_from_row(row: &SqliteRow) -> Result<RouteApproval> {
    let preview: String = row.try_get("preview")?;
    Ok(RouteApproval {
        id: row.try_get("id")?,
        route_id: row.try_get("route_id")?,
        status: text_enum(row, "status", ApprovalStatus::parse)?,
        submitted_by: row.try_get("submitted_by")?,
        auto_generated: row.try_get("auto_generated")?,
        estimated_duration_min: row.try_get("estimated_duration_min")?,
        estimated_distance_km: row.try_get("estimated_distance_km")?,
        total_drops: row.try_get("total_drops")?,
        total_value_pence: row.try_get("total_value_pence")?,
        preview: serde_json::from_str(&preview)?,
        reviewed_by: row.try_get("reviewed_by")?,
        reviewed_at: row.try_get("reviewed_at")?,
        rejection_reason: row.try_get("rejection_reason")?,
        submitted_at: row.try_get("submitted_at")?,
    })
}

pub(crate) fn settings_from_row(row: &SqliteRow) -> Result<RoutingSettings> {
    Ok(RoutingSettings {
        routing_mode: text_enum(row, "routing_mode", RoutingMode::parse)?,
        auto_routing_enabled: row.try_get("auto_routing_enabled")?,
        auto_routing_interval_min: row.try_get("auto_routing_interval_min")?,
        max_drops_per_route: row.try_get("max_drops_per_route")?,
        max_route_distance_km: row.try_get("max_route_distance_km")?,
        auto_assign_drivers: row.try_get("auto_assign_drivers")?,
        require_admin_approval: row.try_get("require_admin_approval")?,
        min_drops_for_auto_route: row.try_get("min_drops_for_auto_route")?,
        auto_routing_status: text_enum(row, "auto_routing_status", AutoRoutingStatus::parse)?,
        last_auto_routing_run: row.try_get("last_auto_routing_run")?,
        last_error: row.try_get("last_error")?,
        updated_by: row.try_get("updated_by")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn audit_from_row(row: &SqliteRow) -> Result<AuditEntry> {
    let details: String = row.try_get("details")?;
    Ok(AuditEntry {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        severity: text_enum(row, "severity", Severity::parse)?,
        actor: row.try_get("actor")?,
        actor_type: text_enum(row, "actor_type", ActorType::parse)?,
        target_type: row.try_get("target_type")?,
        target_id: row.try_get("target_id")?,
        action: row.try_get("action")?,
        details: serde_json::from_str(&details)?,
        result: row.try_get("result")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Booking as submitted by the booking intake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBooking {
    pub reference: String,
    #[serde(default = "default_booking_status")]
    pub status: BookingStatus,
    pub scheduled_at: DateTime<Utc>,
    pub pickup: Address,
    pub dropoff: Address,
    pub total_pence: i64,
    #[serde(default = "default_urgency")]
    pub urgency: Urgency,
    #[serde(default)]
    pub estimated_duration_min: Option<i64>,
    #[serde(default)]
    pub distance_miles: f64,
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default)]
    pub volume_m3: Option<f64>,
    #[serde(default = "default_tier")]
    pub service_tier: ServiceTier,
}

fn default_booking_status() -> BookingStatus {
    BookingStatus::Confirmed
}

fn default_urgency() -> Urgency {
    Urgency::Standard
}

fn default_tier() -> ServiceTier {
    ServiceTier::Standard
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDriver {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default = "default_availability")]
    pub availability: DriverAvailability,
}

fn default_availability() -> DriverAvailability {
    DriverAvailability::Offline
}

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub event_type: &'static str,
    pub severity: Severity,
    pub actor: String,
    pub actor_type: ActorType,
    pub target_type: Option<&'static str>,
    pub target_id: Option<String>,
    pub action: &'static str,
    pub details: serde_json::Value,
    pub result: &'static str,
    pub error_message: Option<String>,
}

impl NewAuditEntry {
    pub fn info(event_type: &'static str, action: &'static str, actor: &str, actor_type: ActorType) -> Self {
        Self {
            event_type,
            severity: Severity::Info,
            actor: actor.to_string(),
            actor_type,
            target_type: None,
            target_id: None,
            action,
            details: serde_json::Value::Object(Default::default()),
            result: "success",
            error_message: None,
        }
    }

    pub fn target(mut self, kind: &'static str, id: &str) -> Self {
        self.target_type = Some(kind);
        self.target_id = Some(id.to_string());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.severity = Severity::Error;
        self.result = "failure";
        self.error_message = Some(message.into());
        self
    }
}

/// Persisted payout for a completed route.
#[derive(Debug, Clone, Serialize)]
pub struct EarningsRecord {
    pub id: String,
    pub driver_id: String,
    pub route_id: Option<String>,
    pub drop_id: Option<String>,
    pub base_pence: i64,
    pub gross_pence: i64,
    pub capped_net_pence: i64,
    pub net_pence: i64,
    pub requires_admin_approval: bool,
    pub calculated_at: DateTime<Utc>,
}
