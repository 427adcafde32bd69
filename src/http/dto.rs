//! Request and response bodies for the HTTP API.
//!
//! Domain types already derive `Serialize`, so most responses reuse them
//! directly; this module only holds the wrappers the endpoints need.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manager::AutoRoutingReport;
use crate::model::{AutoRoutingStatus, DriverAvailability, RouteStatus, RoutingMode, RoutingSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeRequest {
    pub mode: RoutingMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunQuery {
    #[serde(default)]
    pub force: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutesQuery {
    #[serde(default)]
    pub status: Option<RouteStatus>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewRequest {
    pub booking_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApproveRequest {
    #[serde(default)]
    pub driver_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRequest {
    pub driver_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityRequest {
    pub availability: DriverAvailability,
}

/// Auto-routing state shown by `GET /api/admin/routes/scheduler`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub routing_mode: RoutingMode,
    pub auto_routing_enabled: bool,
    pub auto_routing_interval_min: i64,
    pub auto_routing_status: AutoRoutingStatus,
    pub last_auto_routing_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<RoutingSettings> for SchedulerStatus {
    fn from(s: RoutingSettings) -> Self {
        Self {
            routing_mode: s.routing_mode,
            auto_routing_enabled: s.auto_routing_enabled,
            auto_routing_interval_min: s.auto_routing_interval_min,
            auto_routing_status: s.auto_routing_status,
            last_auto_routing_run: s.last_auto_routing_run,
            last_error: s.last_error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SchedulerRun {
    Skipped { skipped: bool, reason: String },
    Ran(AutoRoutingReport),
}
