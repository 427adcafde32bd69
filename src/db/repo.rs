use super::model::{
    approval_from_row, assignment_from_row, audit_from_row, booking_from_row, driver_from_row,
    drop_from_row, route_from_row, settings_from_row, EarningsRecord, NewAuditEntry, NewBooking,
    NewDriver,
};
use crate::model::{
    ApprovalStatus, Assignment, AssignmentStatus, AuditEntry, AutoRoutingStatus, Booking,
    BookingStatus, Driver, DriverAvailability, DriverStatus, Drop, DropStatus, OutboxKind,
    OutboxTask, Route, RouteApproval, RouteStatus, RoutingSettings,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::str::FromStr;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", database_url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// settings

/// Read the settings row, inserting defaults on first use.
#[instrument(skip_all)]
pub async fn get_or_create_settings(conn: &mut SqliteConnection, now: DateTime<Utc>) -> Result<RoutingSettings> {
    if let Some(row) = sqlx::query("SELECT * FROM routing_settings WHERE id = 1")
        .fetch_optional(&mut *conn)
        .await?
    {
        return settings_from_row(&row);
    }
    let defaults = RoutingSettings::defaults(now);
    sqlx::query(
        "INSERT OR IGNORE INTO routing_settings (id, routing_mode, auto_routing_enabled, auto_routing_interval_min, \
         max_drops_per_route, max_route_distance_km, auto_assign_drivers, require_admin_approval, \
         min_drops_for_auto_route, auto_routing_status, updated_by, updated_at) \
         VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(defaults.routing_mode.as_str())
    .bind(defaults.auto_routing_enabled)
    .bind(defaults.auto_routing_interval_min)
    .bind(defaults.max_drops_per_route)
    .bind(defaults.max_route_distance_km)
    .bind(defaults.auto_assign_drivers)
    .bind(defaults.require_admin_approval)
    .bind(defaults.min_drops_for_auto_route)
    .bind(defaults.auto_routing_status.as_str())
    .bind(&defaults.updated_by)
    .bind(defaults.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(defaults)
}

/// Persist the admin-editable settings fields.
#[instrument(skip_all)]
pub async fn save_settings(conn: &mut SqliteConnection, settings: &RoutingSettings) -> Result<()> {
    sqlx::query(
        "UPDATE routing_settings SET routing_mode = ?, auto_routing_enabled = ?, auto_routing_interval_min = ?, \
         max_drops_per_route = ?, max_route_distance_km = ?, auto_assign_drivers = ?, \
         require_admin_approval = ?, min_drops_for_auto_route = ?, updated_by = ?, updated_at = ? \
         WHERE id = 1",
    )
    .bind(settings.routing_mode.as_str())
    .bind(settings.auto_routing_enabled)
    .bind(settings.auto_routing_interval_min)
    .bind(settings.max_drops_per_route)
    .bind(settings.max_route_distance_km)
    .bind(settings.auto_assign_drivers)
    .bind(settings.require_admin_approval)
    .bind(settings.min_drops_for_auto_route)
    .bind(&settings.updated_by)
    .bind(settings.updated_at)
    .execute(&mut *conn)
    .await
    .context("failed to persist routing settings")?;
    Ok(())
}

/// Record the auto-routing run state. `last_run` and `last_error` are only
/// written when given.
#[instrument(skip_all)]
pub async fn set_auto_routing_status(
    conn: &mut SqliteConnection,
    status: AutoRoutingStatus,
    last_run: Option<DateTime<Utc>>,
    last_error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE routing_settings SET auto_routing_status = ?, \
         last_auto_routing_run = COALESCE(?, last_auto_routing_run), last_error = ? WHERE id = 1",
    )
    .bind(status.as_str())
    .bind(last_run)
    .bind(last_error)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// drivers

#[instrument(skip_all)]
pub async fn insert_driver(conn: &mut SqliteConnection, driver: &NewDriver, now: DateTime<Utc>) -> Result<Driver> {
    let row = sqlx::query(
        "INSERT INTO drivers (id, name, email, phone, status, availability, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(new_id("drv"))
    .bind(&driver.name)
    .bind(&driver.email)
    .bind(&driver.phone)
    .bind(DriverStatus::Active.as_str())
    .bind(driver.availability.as_str())
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    driver_from_row(&row)
}

#[instrument(skip_all)]
pub async fn get_driver(conn: &mut SqliteConnection, id: &str) -> Result<Option<Driver>> {
    let row = sqlx::query("SELECT * FROM drivers WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(driver_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_drivers(conn: &mut SqliteConnection) -> Result<Vec<Driver>> {
    let rows = sqlx::query("SELECT * FROM drivers ORDER BY created_at, id")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(driver_from_row).collect()
}

#[instrument(skip_all)]
pub async fn set_driver_availability(
    conn: &mut SqliteConnection,
    id: &str,
    availability: DriverAvailability,
) -> Result<bool> {
    let res = sqlx::query("UPDATE drivers SET availability = ? WHERE id = ?")
        .bind(availability.as_str())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// First active, online driver not already holding an assigned or running
/// route, nor proposed on a route awaiting approval.
#[instrument(skip_all)]
pub async fn find_available_driver(conn: &mut SqliteConnection) -> Result<Option<Driver>> {
    let row = sqlx::query(
        "SELECT d.* FROM drivers d \
         WHERE d.status = 'active' AND d.availability = 'online' \
           AND NOT EXISTS (SELECT 1 FROM routes r WHERE r.driver_id = d.id \
                           AND r.status IN ('pending', 'assigned', 'in_progress')) \
         ORDER BY d.created_at, d.id LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(driver_from_row).transpose()
}

/// Whether the driver holds an assigned or running route other than `except_route`.
#[instrument(skip_all)]
pub async fn driver_has_active_route(conn: &mut SqliteConnection, driver_id: &str, except_route: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM routes WHERE driver_id = ? AND id != ? \
         AND status IN ('assigned', 'in_progress')",
    )
    .bind(driver_id)
    .bind(except_route)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}

// ---------------------------------------------------------------------------
// bookings

#[instrument(skip_all)]
pub async fn insert_booking(conn: &mut SqliteConnection, booking: &NewBooking, now: DateTime<Utc>) -> Result<Booking> {
    let row = sqlx::query(
        "INSERT INTO bookings (id, reference, status, scheduled_at, pickup_label, pickup_postcode, pickup_lat, \
         pickup_lng, dropoff_label, dropoff_postcode, dropoff_lat, dropoff_lng, total_pence, urgency, \
         estimated_duration_min, distance_miles, weight_kg, volume_m3, service_tier, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(new_id("bk"))
    .bind(&booking.reference)
    .bind(booking.status.as_str())
    .bind(booking.scheduled_at)
    .bind(&booking.pickup.label)
    .bind(&booking.pickup.postcode)
    .bind(booking.pickup.lat)
    .bind(booking.pickup.lng)
    .bind(&booking.dropoff.label)
    .bind(&booking.dropoff.postcode)
    .bind(booking.dropoff.lat)
    .bind(booking.dropoff.lng)
    .bind(booking.total_pence)
    .bind(booking.urgency.as_str())
    .bind(booking.estimated_duration_min)
    .bind(booking.distance_miles)
    .bind(booking.weight_kg)
    .bind(booking.volume_m3)
    .bind(booking.service_tier.as_str())
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("failed to insert booking {}", booking.reference))?;
    booking_from_row(&row)
}

#[instrument(skip_all)]
pub async fn get_bookings(conn: &mut SqliteConnection, ids: &[String]) -> Result<Vec<Booking>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM bookings WHERE id IN (");
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(id);
    }
    qb.push(") ORDER BY scheduled_at, id");
    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter().map(booking_from_row).collect()
}

/// Confirmed bookings without a route scheduled within `[from, to]`.
#[instrument(skip_all)]
pub async fn fetch_routable_bookings(
    conn: &mut SqliteConnection,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Booking>> {
    let rows = sqlx::query(
        "SELECT * FROM bookings WHERE status = 'confirmed' AND route_id IS NULL \
         AND datetime(scheduled_at) >= datetime(?) AND datetime(scheduled_at) <= datetime(?) \
         ORDER BY datetime(scheduled_at), id LIMIT ?",
    )
    .bind(from)
    .bind(to)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(booking_from_row).collect()
}

/// Attach a confirmed, unrouted booking to a route. Returns false when the
/// booking was not available.
#[instrument(skip_all)]
pub async fn link_booking(conn: &mut SqliteConnection, booking_id: &str, route_id: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE bookings SET route_id = ? WHERE id = ? AND route_id IS NULL AND status = 'confirmed'",
    )
    .bind(route_id)
    .bind(booking_id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn release_bookings(conn: &mut SqliteConnection, route_id: &str) -> Result<u64> {
    let res = sqlx::query("UPDATE bookings SET route_id = NULL WHERE route_id = ? AND status = 'confirmed'")
        .bind(route_id)
        .execute(&mut *conn)
        .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn complete_bookings(conn: &mut SqliteConnection, route_id: &str) -> Result<u64> {
    let res = sqlx::query("UPDATE bookings SET status = ? WHERE route_id = ? AND status = 'confirmed'")
        .bind(BookingStatus::Completed.as_str())
        .bind(route_id)
        .execute(&mut *conn)
        .await?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// drops

#[instrument(skip_all)]
pub async fn insert_drop(conn: &mut SqliteConnection, drop: &Drop, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "INSERT INTO drops (id, booking_id, route_id, sequence, status, pickup_lat, pickup_lng, pickup_address, \
         delivery_lat, delivery_lng, delivery_address, window_earliest, window_latest, weight_kg, volume_m3, \
         service_tier, priority, estimated_duration_min, value_pence, distance_miles, urgency, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&drop.id)
    .bind(&drop.booking_id)
    .bind(&drop.route_id)
    .bind(drop.sequence)
    .bind(drop.status.as_str())
    .bind(drop.pickup.point.lat)
    .bind(drop.pickup.point.lng)
    .bind(&drop.pickup.address)
    .bind(drop.delivery.point.lat)
    .bind(drop.delivery.point.lng)
    .bind(&drop.delivery.address)
    .bind(drop.window.earliest)
    .bind(drop.window.latest)
    .bind(drop.weight_kg)
    .bind(drop.volume_m3)
    .bind(drop.service_tier.as_str())
    .bind(drop.priority)
    .bind(drop.estimated_duration_min)
    .bind(drop.value_pence)
    .bind(drop.distance_miles)
    .bind(drop.urgency.as_str())
    .bind(now)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("failed to insert drop {}", drop.id))?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn find_drop_by_booking(conn: &mut SqliteConnection, booking_id: &str) -> Result<Option<Drop>> {
    let row = sqlx::query("SELECT * FROM drops WHERE booking_id = ?")
        .bind(booking_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(drop_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn get_drops(conn: &mut SqliteConnection, ids: &[String]) -> Result<Vec<Drop>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM drops WHERE id IN (");
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(id);
    }
    qb.push(")");
    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter().map(drop_from_row).collect()
}

/// Drops of a route in visiting order.
#[instrument(skip_all)]
pub async fn drops_for_route(conn: &mut SqliteConnection, route_id: &str) -> Result<Vec<Drop>> {
    let rows = sqlx::query("SELECT * FROM drops WHERE route_id = ? ORDER BY sequence, id")
        .bind(route_id)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(drop_from_row).collect()
}

/// Attach a pending, unrouted drop to a route at `sequence`. Returns false
/// when another route got there first.
#[instrument(skip_all)]
pub async fn link_drop(conn: &mut SqliteConnection, drop_id: &str, route_id: &str, sequence: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE drops SET route_id = ?, sequence = ?, status = ? \
         WHERE id = ? AND route_id IS NULL AND status = 'pending'",
    )
    .bind(route_id)
    .bind(sequence)
    .bind(DropStatus::AssignedToRoute.as_str())
    .bind(drop_id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Put a route's undelivered drops back in the pending pool.
#[instrument(skip_all)]
pub async fn release_drops(conn: &mut SqliteConnection, route_id: &str) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE drops SET route_id = NULL, sequence = NULL, status = 'pending' \
         WHERE route_id = ? AND status = 'assigned_to_route'",
    )
    .bind(route_id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn mark_drop_delivered(conn: &mut SqliteConnection, route_id: &str, drop_id: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE drops SET status = ? WHERE id = ? AND route_id = ? AND status = 'assigned_to_route'",
    )
    .bind(DropStatus::Delivered.as_str())
    .bind(drop_id)
    .bind(route_id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// routes

#[instrument(skip_all)]
pub async fn insert_route(conn: &mut SqliteConnection, route: &Route) -> Result<()> {
    sqlx::query(
        "INSERT INTO routes (id, driver_id, status, origin, start_time, service_tier, total_drops, \
         completed_drops, total_value_pence, total_weight_kg, total_volume_m3, distance_km, \
         estimated_duration_min, notes, created_by, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&route.id)
    .bind(&route.driver_id)
    .bind(route.status.as_str())
    .bind(route.origin.as_str())
    .bind(route.start_time)
    .bind(route.service_tier.as_str())
    .bind(route.total_drops)
    .bind(route.completed_drops)
    .bind(route.total_value_pence)
    .bind(route.total_weight_kg)
    .bind(route.total_volume_m3)
    .bind(route.distance_km)
    .bind(route.estimated_duration_min)
    .bind(&route.notes)
    .bind(&route.created_by)
    .bind(route.created_at)
    .bind(route.updated_at)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("failed to insert route {}", route.id))?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_route(conn: &mut SqliteConnection, id: &str) -> Result<Option<Route>> {
    let row = sqlx::query("SELECT * FROM routes WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(route_from_row).transpose()
}

/// Newest first, optionally filtered by status and driver.
#[instrument(skip_all)]
pub async fn list_routes(
    conn: &mut SqliteConnection,
    status: Option<RouteStatus>,
    driver_id: Option<&str>,
    limit: i64,
) -> Result<Vec<Route>> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM routes WHERE 1 = 1");
    if let Some(status) = status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(driver_id) = driver_id {
        qb.push(" AND driver_id = ").push_bind(driver_id.to_string());
    }
    qb.push(" ORDER BY datetime(created_at) DESC, id LIMIT ").push_bind(limit);
    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter().map(route_from_row).collect()
}

/// Routes a driver may see: everything addressed to them except routes
/// still waiting for approval.
#[instrument(skip_all)]
pub async fn routes_for_driver(conn: &mut SqliteConnection, driver_id: &str) -> Result<Vec<Route>> {
    let rows = sqlx::query(
        "SELECT * FROM routes WHERE driver_id = ? AND status IN ('assigned', 'in_progress', 'completed') \
         ORDER BY datetime(start_time), id",
    )
    .bind(driver_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(route_from_row).collect()
}

/// Move a route to `next` if its current status is one of `expected`,
/// setting `driver_id`. Returns false when the route was in another state.
#[instrument(skip_all)]
pub async fn transition_route(
    conn: &mut SqliteConnection,
    id: &str,
    expected: &[RouteStatus],
    next: RouteStatus,
    driver_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    if expected.is_empty() {
        return Err(anyhow!("transition_route needs at least one expected status"));
    }
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE routes SET status = ");
    qb.push_bind(next.as_str())
        .push(", driver_id = ")
        .push_bind(driver_id.map(str::to_string))
        .push(", updated_at = ")
        .push_bind(now)
        .push(" WHERE id = ")
        .push_bind(id.to_string())
        .push(" AND status IN (");
    let mut sep = qb.separated(", ");
    for status in expected {
        sep.push_bind(status.as_str());
    }
    qb.push(")");
    let res = qb.build().execute(&mut *conn).await?;
    Ok(res.rows_affected() == 1)
}

/// Count one more delivered drop and return the new total.
#[instrument(skip_all)]
pub async fn increment_completed_drops(conn: &mut SqliteConnection, id: &str, now: DateTime<Utc>) -> Result<i64> {
    let completed: i64 = sqlx::query_scalar(
        "UPDATE routes SET completed_drops = completed_drops + 1, updated_at = ? WHERE id = ? \
         RETURNING completed_drops",
    )
    .bind(now)
    .bind(id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(completed)
}

// ---------------------------------------------------------------------------
// assignments

#[instrument(skip_all)]
pub async fn insert_assignment(
    conn: &mut SqliteConnection,
    route_id: &str,
    driver_id: &str,
    now: DateTime<Utc>,
) -> Result<Assignment> {
    let row = sqlx::query(
        "INSERT INTO assignments (id, route_id, driver_id, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(new_id("asg"))
    .bind(route_id)
    .bind(driver_id)
    .bind(AssignmentStatus::Accepted.as_str())
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    assignment_from_row(&row)
}

#[instrument(skip_all)]
pub async fn list_assignments(conn: &mut SqliteConnection, route_id: &str) -> Result<Vec<Assignment>> {
    let rows = sqlx::query("SELECT * FROM assignments WHERE route_id = ? ORDER BY datetime(created_at), id")
        .bind(route_id)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(assignment_from_row).collect()
}

/// Close the route's accepted assignment, if any.
#[instrument(skip_all)]
pub async fn close_active_assignment(
    conn: &mut SqliteConnection,
    route_id: &str,
    status: AssignmentStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE assignments SET status = ?, updated_at = ? WHERE route_id = ? AND status = 'accepted'",
    )
    .bind(status.as_str())
    .bind(now)
    .bind(route_id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// approvals

#[instrument(skip_all)]
pub async fn insert_approval(conn: &mut SqliteConnection, approval: &RouteApproval) -> Result<()> {
    sqlx::query(
        "INSERT INTO route_approvals (id, route_id, status, submitted_by, auto_generated, \
         estimated_duration_min, estimated_distance_km, total_drops, total_value_pence, preview, submitted_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&approval.id)
    .bind(&approval.route_id)
    .bind(approval.status.as_str())
    .bind(&approval.submitted_by)
    .bind(approval.auto_generated)
    .bind(approval.estimated_duration_min)
    .bind(approval.estimated_distance_km)
    .bind(approval.total_drops)
    .bind(approval.total_value_pence)
    .bind(approval.preview.to_string())
    .bind(approval.submitted_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn approval_for_route(conn: &mut SqliteConnection, route_id: &str) -> Result<Option<RouteApproval>> {
    let row = sqlx::query("SELECT * FROM route_approvals WHERE route_id = ?")
        .bind(route_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(approval_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn pending_approvals(conn: &mut SqliteConnection) -> Result<Vec<RouteApproval>> {
    let rows = sqlx::query(
        "SELECT * FROM route_approvals WHERE status = 'pending' ORDER BY datetime(submitted_at), id",
    )
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(approval_from_row).collect()
}

/// Close a pending approval. Returns false when it was already reviewed.
#[instrument(skip_all)]
pub async fn review_approval(
    conn: &mut SqliteConnection,
    route_id: &str,
    status: ApprovalStatus,
    reviewer: &str,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE route_approvals SET status = ?, reviewed_by = ?, reviewed_at = ?, rejection_reason = ? \
         WHERE route_id = ? AND status = 'pending'",
    )
    .bind(status.as_str())
    .bind(reviewer)
    .bind(now)
    .bind(reason)
    .bind(route_id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// audit

#[instrument(skip_all)]
pub async fn insert_audit(conn: &mut SqliteConnection, entry: &NewAuditEntry, now: DateTime<Utc>) -> Result<i64> {
    let id: i64 = sqlx::query(
        "INSERT INTO audit_log (event_type, severity, actor, actor_type, target_type, target_id, action, \
         details, result, error_message, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(entry.event_type)
    .bind(entry.severity.as_str())
    .bind(&entry.actor)
    .bind(entry.actor_type.as_str())
    .bind(entry.target_type)
    .bind(&entry.target_id)
    .bind(entry.action)
    .bind(entry.details.to_string())
    .bind(entry.result)
    .bind(&entry.error_message)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?
    .get("id");
    Ok(id)
}

/// Newest first.
#[instrument(skip_all)]
pub async fn list_audit(conn: &mut SqliteConnection, event_types: &[&str], limit: i64) -> Result<Vec<AuditEntry>> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM audit_log");
    if !event_types.is_empty() {
        qb.push(" WHERE event_type IN (");
        let mut sep = qb.separated(", ");
        for event_type in event_types {
            sep.push_bind(event_type.to_string());
        }
        qb.push(")");
    }
    qb.push(" ORDER BY id DESC LIMIT ").push_bind(limit);
    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter().map(audit_from_row).collect()
}

// ---------------------------------------------------------------------------
// earnings

/// Net pence already recorded for the driver on `day`'s calendar date (UTC).
#[instrument(skip_all)]
pub async fn earned_on_day(conn: &mut SqliteConnection, driver_id: &str, day: DateTime<Utc>) -> Result<i64> {
    let total: Option<i64> = sqlx::query_scalar(
        "SELECT SUM(net_pence) FROM driver_earnings WHERE driver_id = ? AND date(calculated_at) = date(?)",
    )
    .bind(driver_id)
    .bind(day)
    .fetch_one(&mut *conn)
    .await?;
    Ok(total.unwrap_or(0))
}

#[instrument(skip_all)]
pub async fn insert_earnings(conn: &mut SqliteConnection, record: &EarningsRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO driver_earnings (id, driver_id, route_id, drop_id, base_pence, gross_pence, \
         capped_net_pence, net_pence, requires_admin_approval, calculated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(&record.driver_id)
    .bind(&record.route_id)
    .bind(&record.drop_id)
    .bind(record.base_pence)
    .bind(record.gross_pence)
    .bind(record.capped_net_pence)
    .bind(record.net_pence)
    .bind(record.requires_admin_approval)
    .bind(record.calculated_at)
    .execute(&mut *conn)
    .await
    .context("failed to persist driver earnings")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// outbox

#[instrument(skip_all)]
pub async fn enqueue_outbox(
    conn: &mut SqliteConnection,
    kind: OutboxKind,
    route_id: &str,
    driver_id: &str,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO outbox (kind, route_id, driver_id, attempt, due_at) VALUES (?, ?, ?, 0, ?) RETURNING id",
    )
    .bind(kind.as_str())
    .bind(route_id)
    .bind(driver_id)
    .bind(due_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn next_due_outbox(conn: &mut SqliteConnection, now: DateTime<Utc>) -> Result<Option<OutboxTask>> {
    let row = sqlx::query(
        "SELECT id, kind, route_id, driver_id, attempt FROM outbox \
         WHERE datetime(due_at) <= datetime(?) ORDER BY datetime(due_at), id LIMIT 1",
    )
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let kind: String = row.get("kind");
    Ok(Some(OutboxTask {
        id: row.get("id"),
        kind: OutboxKind::parse(&kind).ok_or_else(|| anyhow!("unknown outbox kind {}", kind))?,
        route_id: row.get("route_id"),
        driver_id: row.get("driver_id"),
        attempt: row.get("attempt"),
    }))
}

#[instrument(skip_all)]
pub async fn delete_outbox(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM outbox WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Seconds until the next attempt: 5s * 2^attempt, capped at `max_cap_secs`
/// (no cap when zero or negative).
pub fn backoff_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

#[instrument(skip_all)]
pub async fn backoff_outbox_with_cap(
    conn: &mut SqliteConnection,
    id: i64,
    attempt: i32,
    max_cap_secs: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let due_at = now + chrono::Duration::seconds(backoff_secs(attempt, max_cap_secs));
    sqlx::query("UPDATE outbox SET attempt = ?, due_at = ? WHERE id = ?")
        .bind(attempt + 1)
        .bind(due_at)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_outbox(conn: &mut SqliteConnection) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}
