use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declares a status-like enum stored as TEXT, with `as_str`/`parse` and
/// snake_case serde names matching the column values.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(BookingStatus {
    PendingPayment => "pending_payment",
    Confirmed => "confirmed",
    Cancelled => "cancelled",
    Completed => "completed",
});

string_enum!(DropStatus {
    Pending => "pending",
    AssignedToRoute => "assigned_to_route",
    Delivered => "delivered",
    Cancelled => "cancelled",
});

string_enum!(
    /// Lifecycle of a route. `Pending` routes wait for admin approval and are
    /// never shown to drivers.
    RouteStatus {
        Pending => "pending",
        Planned => "planned",
        Assigned => "assigned",
        InProgress => "in_progress",
        Completed => "completed",
        Cancelled => "cancelled",
    }
);

string_enum!(RouteOrigin {
    Auto => "auto",
    Manual => "manual",
});

string_enum!(AssignmentStatus {
    Accepted => "accepted",
    Declined => "declined",
    Cancelled => "cancelled",
    Completed => "completed",
});

string_enum!(ApprovalStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

string_enum!(DriverStatus {
    Active => "active",
    Suspended => "suspended",
});

string_enum!(DriverAvailability {
    Online => "online",
    Offline => "offline",
    Busy => "busy",
});

string_enum!(RoutingMode {
    Auto => "auto",
    Manual => "manual",
});

string_enum!(AutoRoutingStatus {
    Idle => "idle",
    Running => "running",
    Error => "error",
});

string_enum!(ServiceTier {
    Economy => "economy",
    Standard => "standard",
    Premium => "premium",
});

string_enum!(Urgency {
    Standard => "standard",
    Express => "express",
    Premium => "premium",
    Urgent => "urgent",
});

string_enum!(Severity {
    Info => "info",
    Warning => "warning",
    Error => "error",
});

string_enum!(ActorType {
    Admin => "admin",
    System => "system",
    Driver => "driver",
});

string_enum!(OutboxKind {
    RouteAssigned => "route_assigned",
});

impl Urgency {
    pub fn drop_priority(&self) -> i32 {
        match self {
            Urgency::Urgent | Urgency::Premium => 10,
            Urgency::Express | Urgency::Standard => 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Address {
    pub label: String,
    pub postcode: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

impl Address {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some((lat, lng)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub point: GeoPoint,
    pub address: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeWindow {
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

impl TimeWindow {
    pub fn span_minutes(&self) -> i64 {
        (self.latest - self.earliest).num_minutes()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: String,
    pub reference: String,
    pub status: BookingStatus,
    pub scheduled_at: DateTime<Utc>,
    pub pickup: Address,
    pub dropoff: Address,
    pub total_pence: i64,
    pub urgency: Urgency,
    pub estimated_duration_min: Option<i64>,
    pub distance_miles: f64,
    pub weight_kg: Option<f64>,
    pub volume_m3: Option<f64>,
    pub service_tier: ServiceTier,
    pub route_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drop {
    pub id: String,
    pub booking_id: Option<String>,
    pub route_id: Option<String>,
    pub sequence: Option<i64>,
    pub status: DropStatus,
    pub pickup: Location,
    pub delivery: Location,
    pub window: TimeWindow,
    pub weight_kg: f64,
    pub volume_m3: f64,
    pub service_tier: ServiceTier,
    pub priority: i32,
    pub estimated_duration_min: i64,
    pub value_pence: i64,
    pub distance_miles: f64,
    pub urgency: Urgency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: DriverStatus,
    pub availability: DriverAvailability,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub driver_id: Option<String>,
    pub status: RouteStatus,
    pub origin: RouteOrigin,
    pub start_time: DateTime<Utc>,
    pub service_tier: ServiceTier,
    pub total_drops: i64,
    pub completed_drops: i64,
    pub total_value_pence: i64,
    pub total_weight_kg: f64,
    pub total_volume_m3: f64,
    pub distance_km: f64,
    pub estimated_duration_min: i64,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub route_id: String,
    pub driver_id: String,
    pub status: AssignmentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteApproval {
    pub id: String,
    pub route_id: String,
    pub status: ApprovalStatus,
    pub submitted_by: String,
    pub auto_generated: bool,
    pub estimated_duration_min: i64,
    pub estimated_distance_km: f64,
    pub total_drops: i64,
    pub total_value_pence: i64,
    pub preview: serde_json::Value,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Persisted routing configuration, edited from the admin back office.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingSettings {
    pub routing_mode: RoutingMode,
    pub auto_routing_enabled: bool,
    pub auto_routing_interval_min: i64,
    pub max_drops_per_route: i64,
    pub max_route_distance_km: f64,
    pub auto_assign_drivers: bool,
    pub require_admin_approval: bool,
    pub min_drops_for_auto_route: i64,
    pub auto_routing_status: AutoRoutingStatus,
    pub last_auto_routing_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl RoutingSettings {
    pub fn defaults(now: DateTime<Utc>) -> Self {
        Self {
            routing_mode: RoutingMode::Manual,
            auto_routing_enabled: false,
            auto_routing_interval_min: 15,
            max_drops_per_route: 10,
            max_route_distance_km: 50.0,
            auto_assign_drivers: false,
            require_admin_approval: true,
            min_drops_for_auto_route: 2,
            auto_routing_status: AutoRoutingStatus::Idle,
            last_auto_routing_run: None,
            last_error: None,
            updated_by: "system".into(),
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub event_type: String,
    pub severity: Severity,
    pub actor: String,
    pub actor_type: ActorType,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub action: String,
    pub details: serde_json::Value,
    pub result: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxTask {
    pub id: i64,
    pub kind: OutboxKind,
    pub route_id: String,
    pub driver_id: String,
    pub attempt: i32,
}
